//! Process-wide table of live sessions.
//!
//! Entries live in a sharded map and each session carries its own lock, so
//! work on one session never waits on another. Map references are never
//! held across an `.await`.

use crate::error::SessionError;
use crate::sandbox::EnvironmentFactory;
use crate::session::{Session, SessionInfo, SessionSeed};
use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

/// Longest accepted session id. Ids end up in container names and paths.
const MAX_SESSION_ID_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// How long a disconnected session is kept for reconnection. Zero
    /// terminates on disconnect.
    pub grace_period: Duration,
    /// Sessions with no connection and no activity for this long are reaped.
    pub idle_ttl: Duration,
    pub queue_depth: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            idle_ttl: Duration::from_secs(1800),
            queue_depth: 32,
        }
    }
}

pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidId(id.to_string()))
    }
}

pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    factory: EnvironmentFactory,
    settings: RegistrySettings,
}

impl SessionRegistry {
    pub fn new(factory: EnvironmentFactory, settings: RegistrySettings) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            factory,
            settings,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Register a session without allocating its environment yet.
    pub fn reserve(&self, seed: SessionSeed) -> Arc<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone(), seed));
        self.sessions.insert(id, session.clone());
        debug!(session = %session.id(), "Session reserved");
        session
    }

    /// Attach a connection to `id`, creating and initializing the session
    /// when needed. Initialization failure removes the session.
    pub async fn get_or_create(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        validate_session_id(id)?;
        let session = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Session::new(id.to_string(), SessionSeed::default())))
            .value()
            .clone();

        match session.attach(&self.factory, self.settings.queue_depth).await {
            Ok(()) => Ok(session),
            Err(e) => {
                self.remove_entry(&session);
                Err(e)
            }
        }
    }

    /// A connection went away. Suspends the session when it was the last
    /// one and schedules termination after the grace period.
    pub async fn release(&self, id: &str) {
        let Some(session) = self.get(id) else {
            return;
        };
        let Some(epoch) = session.detach().await else {
            return;
        };

        if self.settings.grace_period.is_zero() {
            self.remove_entry(&session);
            session.terminate().await;
            return;
        }

        let sessions = self.sessions.clone();
        let grace = self.settings.grace_period;
        let expiring = session.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if expiring.terminate_if_suspended(epoch).await {
                sessions.remove_if(expiring.id(), |_, s| Arc::ptr_eq(s, &expiring));
                info!(session = %expiring.id(), "Grace period elapsed, session cleaned up");
            }
        });
        session.arm_grace_timer(epoch, timer).await;
    }

    /// Tear a session down now, whatever its state.
    pub async fn force_terminate(&self, id: &str) -> Result<(), SessionError> {
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.terminate().await;
        Ok(())
    }

    /// Drain every session. Used at process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!(sessions = ids.len(), "Terminating all sessions");
        join_all(ids.iter().map(|id| self.force_terminate(id))).await;
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        join_all(sessions.iter().map(|s| s.info())).await
    }

    /// Terminate unattached sessions idle for at least `idle_ttl`.
    pub async fn sweep_idle(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut reaped = 0;
        for session in sessions {
            if session.terminate_if_idle(self.settings.idle_ttl).await {
                self.remove_entry(&session);
                info!(session = %session.id(), "Cleaning up expired session");
                reaped += 1;
            }
        }
        reaped
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = interval(every);
            loop {
                interval.tick().await;
                registry.sweep_idle().await;
            }
        })
    }

    fn remove_entry(&self, session: &Arc<Session>) {
        self.sessions
            .remove_if(session.id(), |_, s| Arc::ptr_eq(s, session));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_restricted() {
        assert!(validate_session_id("3f2b9c1e-0d4a-4c1b-9a57-0e6a3b1f2c4d").is_ok());
        assert!(validate_session_id("abc_DEF-123").is_ok());
        let long = "x".repeat(65);
        for bad in ["", "../etc", "a/b", "with space", long.as_str()] {
            assert!(
                matches!(validate_session_id(bad), Err(SessionError::InvalidId(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
