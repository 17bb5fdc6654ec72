//! HTTP server implementation using Axum.

use crate::challenges::{ChallengeSummary, ChallengeView};
use crate::error::ApiError;
use crate::provisioner::{StartResponse, SubmitResponse, TERMINAL_PATH};
use crate::session::SessionInfo;
use crate::state::{AppState, ConnectionInfo};
use crate::terminal::terminal_ws;
use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// How often idle sessions are swept.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    flag: String,
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/challenges", get(list_challenges))
        .route("/api/challenges/:id", get(get_challenge))
        .route("/api/challenges/:id/start", post(start_challenge))
        .route("/api/challenges/:id/submit", post(submit_flag))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/connections", get(list_connections))
        .route(&format!("{}/:session_id", TERMINAL_PATH), get(terminal_ws))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until interrupted, then terminate every session.
pub async fn run_server(addr: SocketAddr, state: AppState, allowed_origins: &[String]) -> anyhow::Result<()> {
    let registry = state.registry.clone();
    let sweeper = registry.spawn_sweeper(SWEEP_INTERVAL);
    let app = router(state, allowed_origins);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Starting HTTP server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutting down, cleaning up sandbox sessions");
    sweeper.abort();
    registry.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "cli-quest-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_challenges(State(state): State<AppState>) -> Json<Vec<ChallengeSummary>> {
    Json(state.provisioner.catalog().list())
}

async fn get_challenge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChallengeView>, ApiError> {
    state
        .provisioner
        .catalog()
        .get(&id)
        .map(Json)
        .ok_or(ApiError::NotFound("challenge"))
}

async fn start_challenge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StartResponse>, ApiError> {
    state.provisioner.start(&id).map(Json)
}

async fn submit_flag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    state.provisioner.submit(&id, &req.flag).map(Json)
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state.registry.get(&id).ok_or(ApiError::NotFound("session"))?;
    Ok(Json(session.info().await))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.force_terminate(&id).await?;
    info!("Deleted session: {}", id);
    Ok(StatusCode::NO_CONTENT)
}

async fn list_connections(State(state): State<AppState>) -> Json<Vec<ConnectionInfo>> {
    Json(state.connection_list())
}
