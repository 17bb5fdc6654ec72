//! Error types shared across the sandbox, session and HTTP layers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures raised by an execution environment or its backend.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to allocate sandbox: {0}")]
    FatalInit(String),

    #[error("sandbox not initialized")]
    NotInitialized,

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("graceful stop failed: {0}")]
    Stop(String),

    #[error("forced kill failed: {0}")]
    Kill(String),

    #[error("invalid workspace path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of session-level operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session initialization failed: {0}")]
    Init(#[source] SandboxError),

    #[error("invalid session id: {0:?}")]
    InvalidId(String),

    #[error("session {0} has no running environment")]
    NotReady(String),

    #[error("session {0} is shutting down")]
    Closed(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Session(SessionError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Session(SessionError::InvalidId(_)) => StatusCode::BAD_REQUEST,
            ApiError::Session(SessionError::NotReady(_)) => StatusCode::CONFLICT,
            ApiError::Session(SessionError::Init(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Session(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let detail = match &self {
            ApiError::NotFound(what) => format!("{} not found", capitalize(what)),
            other => other.to_string(),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
