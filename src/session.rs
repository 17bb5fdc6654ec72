//! A single client session: lifecycle state, its environment, and the worker
//! that serializes command execution.

use crate::error::{SandboxError, SessionError};
use crate::provisioner;
use crate::sandbox::{Environment, EnvironmentFactory};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of a session. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Initializing,
    Ready,
    Executing,
    Suspended,
    Terminated,
}

/// What a session is started with.
#[derive(Debug, Clone, Default)]
pub struct SessionSeed {
    pub challenge_id: Option<String>,
    pub files: BTreeMap<String, String>,
}

/// Result of one submitted command.
pub type CommandReply = Result<String, SessionError>;

struct Job {
    command: String,
    reply: mpsc::Sender<CommandReply>,
}

struct SessionInner {
    state: SessionState,
    last_activity: Instant,
    environment: Option<Arc<Environment>>,
    jobs: Option<mpsc::Sender<Job>>,
    connections: usize,
    grace_timer: Option<JoinHandle<()>>,
    /// Bumped on every suspend and resume so stale grace timers do nothing.
    suspend_epoch: u64,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub challenge_id: Option<String>,
    pub container: Option<String>,
    pub connections: usize,
    pub age_secs: u64,
    pub idle_secs: u64,
}

pub struct Session {
    id: String,
    seed: SessionSeed,
    created_at: Instant,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(id: String, seed: SessionSeed) -> Self {
        Self {
            id,
            seed,
            created_at: Instant::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                last_activity: Instant::now(),
                environment: None,
                jobs: None,
                connections: 0,
                grace_timer: None,
                suspend_epoch: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn challenge_id(&self) -> Option<&str> {
        self.seed.challenge_id.as_deref()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// The live environment, if the session has one.
    pub async fn environment(&self) -> Option<Arc<Environment>> {
        self.inner.lock().await.environment.clone()
    }

    pub async fn info(&self) -> SessionInfo {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        SessionInfo {
            id: self.id.clone(),
            state: inner.state,
            challenge_id: self.seed.challenge_id.clone(),
            container: inner.environment.as_ref().map(|e| e.name().to_string()),
            connections: inner.connections,
            age_secs: now.duration_since(self.created_at).as_secs(),
            idle_secs: now.duration_since(inner.last_activity).as_secs(),
        }
    }

    /// Attach a connection: allocate and seed the environment on first use,
    /// resume a suspended session, or join a live one.
    pub(crate) async fn attach(
        self: &Arc<Self>,
        factory: &EnvironmentFactory,
        queue_depth: usize,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        let state = inner.state;
        match state {
            SessionState::Terminated => return Err(SessionError::NotFound(self.id.clone())),
            SessionState::Created => {
                inner.state = SessionState::Initializing;
                debug!(session = %self.id, "Initializing session");

                let environment = Arc::new(factory.environment(&self.id));
                let files = self.seed.files.clone();
                let setup = {
                    let environment = environment.clone();
                    tokio::task::spawn_blocking(move || {
                        environment.initialize()?;
                        provisioner::seed(&environment, &files)
                    })
                };
                let outcome = match setup.await {
                    Ok(result) => result,
                    Err(e) => Err(SandboxError::FatalInit(format!("setup task failed: {}", e))),
                };

                if let Err(e) = outcome {
                    error!(session = %self.id, error = %e, "Failed to initialize sandbox");
                    inner.state = SessionState::Terminated;
                    drop(inner);
                    let _ = tokio::task::spawn_blocking(move || environment.cleanup()).await;
                    return Err(SessionError::Init(e));
                }

                let (tx, rx) = mpsc::channel(queue_depth.max(1));
                tokio::spawn(run_worker(Arc::downgrade(self), environment.clone(), rx));
                inner.environment = Some(environment);
                inner.jobs = Some(tx);
                inner.state = SessionState::Ready;
                info!(session = %self.id, challenge = ?self.seed.challenge_id, "Created new sandbox session");
            }
            SessionState::Suspended => {
                if let Some(timer) = inner.grace_timer.take() {
                    timer.abort();
                }
                inner.suspend_epoch += 1;
                inner.state = SessionState::Ready;
                info!(session = %self.id, "Session resumed");
            }
            SessionState::Initializing | SessionState::Ready | SessionState::Executing => {}
        }
        inner.connections += 1;
        inner.last_activity = Instant::now();
        Ok(())
    }

    /// Detach a connection. Returns the suspend epoch when this was the last
    /// connection and the session is now suspended.
    pub(crate) async fn detach(&self) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        inner.connections = inner.connections.saturating_sub(1);
        inner.last_activity = Instant::now();
        if inner.connections > 0 {
            return None;
        }
        match inner.state {
            SessionState::Ready | SessionState::Executing => {
                inner.state = SessionState::Suspended;
                inner.suspend_epoch += 1;
                info!(session = %self.id, "Session suspended");
                Some(inner.suspend_epoch)
            }
            _ => None,
        }
    }

    pub(crate) async fn arm_grace_timer(&self, epoch: u64, timer: JoinHandle<()>) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Suspended && inner.suspend_epoch == epoch {
            inner.grace_timer = Some(timer);
        }
    }

    /// Queue a command. The reply arrives on `reply` once every earlier
    /// command of this session has completed.
    pub async fn submit(&self, command: String, reply: mpsc::Sender<CommandReply>) -> Result<(), SessionError> {
        let jobs = {
            let inner = self.inner.lock().await;
            match inner.state {
                SessionState::Terminated => return Err(SessionError::NotFound(self.id.clone())),
                SessionState::Created | SessionState::Initializing => {
                    return Err(SessionError::NotReady(self.id.clone()))
                }
                _ => {}
            }
            inner.jobs.clone().ok_or_else(|| SessionError::Closed(self.id.clone()))?
        };
        jobs.send(Job { command, reply })
            .await
            .map_err(|_| SessionError::Closed(self.id.clone()))
    }

    /// Submit and wait for the result.
    pub async fn execute(&self, command: impl Into<String>) -> CommandReply {
        let (tx, mut rx) = mpsc::channel(1);
        self.submit(command.into(), tx).await?;
        rx.recv()
            .await
            .unwrap_or_else(|| Err(SessionError::Closed(self.id.clone())))
    }

    /// Best-effort terminal resize. Not queued behind running commands.
    pub async fn resize(&self, cols: u16, rows: u16) {
        let Some(environment) = self.environment().await else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || environment.resize(cols, rows)).await {
            warn!(session = %self.id, error = %e, "Resize task failed");
        }
    }

    /// Terminate regardless of state. Returns false if already terminated.
    pub(crate) async fn terminate(&self) -> bool {
        let environment = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Terminated {
                return false;
            }
            if let Some(timer) = inner.grace_timer.take() {
                timer.abort();
            }
            Self::close(&mut inner)
        };
        self.release_environment(environment).await;
        true
    }

    /// Called from the grace timer itself, which must not abort its own task.
    pub(crate) async fn terminate_if_suspended(&self, epoch: u64) -> bool {
        let environment = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Suspended || inner.suspend_epoch != epoch {
                return false;
            }
            inner.grace_timer = None;
            Self::close(&mut inner)
        };
        self.release_environment(environment).await;
        true
    }

    /// Terminate if nobody is attached and nothing happened for `ttl`.
    pub(crate) async fn terminate_if_idle(&self, ttl: Duration) -> bool {
        let environment = {
            let mut inner = self.inner.lock().await;
            let idle = inner.connections == 0
                && inner.last_activity.elapsed() >= ttl
                && matches!(
                    inner.state,
                    SessionState::Created | SessionState::Ready | SessionState::Suspended
                );
            if !idle {
                return false;
            }
            if let Some(timer) = inner.grace_timer.take() {
                timer.abort();
            }
            Self::close(&mut inner)
        };
        self.release_environment(environment).await;
        true
    }

    fn close(inner: &mut SessionInner) -> Option<Arc<Environment>> {
        inner.state = SessionState::Terminated;
        // the worker drains what is queued and then exits
        inner.jobs = None;
        inner.environment.take()
    }

    async fn release_environment(&self, environment: Option<Arc<Environment>>) {
        if let Some(environment) = environment {
            if let Err(e) = tokio::task::spawn_blocking(move || environment.cleanup()).await {
                error!(session = %self.id, error = %e, "Cleanup task failed");
            }
        }
        info!(session = %self.id, "Session terminated");
    }

    async fn mark_executing(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Ready {
            inner.state = SessionState::Executing;
        }
        inner.last_activity = Instant::now();
    }

    async fn mark_idle(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Executing {
            inner.state = SessionState::Ready;
        }
        inner.last_activity = Instant::now();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("challenge_id", &self.seed.challenge_id)
            .finish_non_exhaustive()
    }
}

/// Runs queued commands one at a time on the blocking pool.
async fn run_worker(session: Weak<Session>, environment: Arc<Environment>, mut jobs: mpsc::Receiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let Some(owner) = session.upgrade() else {
            break;
        };
        owner.mark_executing().await;

        let env = environment.clone();
        let command = job.command;
        let result = tokio::task::spawn_blocking(move || env.execute(&command)).await;
        owner.mark_idle().await;

        let reply = match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(SandboxError::NotInitialized)) => Err(SessionError::Closed(owner.id.clone())),
            Ok(Err(e)) => Err(SessionError::Sandbox(e)),
            Err(e) => Err(SessionError::Sandbox(SandboxError::Runtime(format!(
                "execution task failed: {}",
                e
            )))),
        };
        // the connection may be gone already
        let _ = job.reply.send(reply).await;
    }
    debug!(container = %environment.name(), "Session worker stopped");
}
