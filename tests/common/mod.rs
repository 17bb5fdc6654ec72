//! Shared fixtures for integration tests.

#![allow(dead_code)]

use cli_quest::challenges::ChallengeCatalog;
use cli_quest::error::SandboxError;
use cli_quest::http_server;
use cli_quest::policy::CommandPolicy;
use cli_quest::protocol::ServerMessage;
use cli_quest::sandbox::mock::MockBackend;
use cli_quest::sandbox::{
    Backend, ContainerHandle, ContainerSpec, EnvironmentConfig, EnvironmentFactory, ExecOutput,
};
use cli_quest::{AppState, RegistrySettings, SessionRegistry};
use futures_util::StreamExt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const ORIGINS: [&str; 1] = ["http://localhost:5173"];

pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub registry: Arc<SessionRegistry>,
    pub state: AppState,
}

pub fn settings(grace: Duration) -> RegistrySettings {
    RegistrySettings {
        grace_period: grace,
        idle_ttl: Duration::from_secs(1800),
        queue_depth: 8,
    }
}

pub fn harness(settings: RegistrySettings) -> Harness {
    let backend = Arc::new(MockBackend::new());
    let state = app_state(backend.clone(), settings);
    Harness {
        backend,
        registry: state.registry.clone(),
        state,
    }
}

pub fn app_state(backend: Arc<dyn Backend>, settings: RegistrySettings) -> AppState {
    let factory = EnvironmentFactory::new(EnvironmentConfig::default(), CommandPolicy::new(), backend);
    let registry = Arc::new(SessionRegistry::new(factory, settings));
    AppState::new(registry, ChallengeCatalog::builtin().unwrap())
}

pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let origins: Vec<String> = ORIGINS.iter().map(|o| o.to_string()).collect();
    let app = http_server::router(state, &origins);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub async fn connect(addr: SocketAddr, session_id: &str) -> Client {
    let url = format!("ws://{}/api/terminal/{}", addr, session_id);
    let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    client
}

/// Next output/error frame, skipping control frames.
pub async fn next_message(client: &mut Client) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Mock backend where `slow <tag>` takes `delay` and prints `done <tag>`.
/// Stopping or killing the container ends a running `slow` command early with
/// exit code 137, as SIGKILL would.
pub struct SlowBackend {
    pub inner: MockBackend,
    pub delay: Duration,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MockBackend::new(),
            delay,
        }
    }
}

impl Backend for SlowBackend {
    fn kind(&self) -> &'static str {
        "slow"
    }

    fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, SandboxError> {
        self.inner.create(spec)
    }

    fn exec(&self, container: &ContainerHandle, command: &str) -> Result<ExecOutput, SandboxError> {
        if let Some(tag) = command.strip_prefix("slow ") {
            let deadline = Instant::now() + self.delay;
            while Instant::now() < deadline {
                if !self.inner.is_live(&container.name) {
                    return Ok(ExecOutput {
                        output: "Killed".into(),
                        exit_code: 137,
                    });
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            return Ok(ExecOutput {
                output: format!("done {}", tag),
                exit_code: 0,
            });
        }
        self.inner.exec(container, command)
    }

    fn resize(&self, container: &ContainerHandle, cols: u16, rows: u16) -> Result<(), SandboxError> {
        self.inner.resize(container, cols, rows)
    }

    fn write_file(&self, container: &ContainerHandle, path: &Path, content: &[u8]) -> Result<(), SandboxError> {
        self.inner.write_file(container, path, content)
    }

    fn stop(&self, container: &ContainerHandle, timeout: Duration) -> Result<(), SandboxError> {
        self.inner.stop(container, timeout)
    }

    fn kill(&self, container: &ContainerHandle) -> Result<(), SandboxError> {
        self.inner.kill(container)
    }
}

/// A runtime that can never allocate a container.
pub struct UnavailableBackend;

impl Backend for UnavailableBackend {
    fn kind(&self) -> &'static str {
        "unavailable"
    }

    fn create(&self, _spec: &ContainerSpec) -> Result<ContainerHandle, SandboxError> {
        Err(SandboxError::Runtime("container runtime unreachable".into()))
    }

    fn exec(&self, _container: &ContainerHandle, _command: &str) -> Result<ExecOutput, SandboxError> {
        Err(SandboxError::NotInitialized)
    }

    fn resize(&self, _container: &ContainerHandle, _cols: u16, _rows: u16) -> Result<(), SandboxError> {
        Ok(())
    }

    fn write_file(&self, _container: &ContainerHandle, _path: &Path, _content: &[u8]) -> Result<(), SandboxError> {
        Err(SandboxError::NotInitialized)
    }

    fn stop(&self, _container: &ContainerHandle, _timeout: Duration) -> Result<(), SandboxError> {
        Ok(())
    }

    fn kill(&self, _container: &ContainerHandle) -> Result<(), SandboxError> {
        Ok(())
    }
}
