//! Turns challenge definitions into sessions and seeded workspaces.

use crate::challenges::ChallengeCatalog;
use crate::error::{ApiError, SandboxError};
use crate::registry::SessionRegistry;
use crate::sandbox::Environment;
use crate::session::SessionSeed;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Route prefix of the per-session terminal endpoint.
pub const TERMINAL_PATH: &str = "/api/terminal";

pub fn terminal_endpoint(session_id: &str) -> String {
    format!("{}/{}", TERMINAL_PATH, session_id)
}

/// Write a challenge's files into a freshly initialized environment.
pub fn seed(environment: &Environment, files: &BTreeMap<String, String>) -> Result<(), SandboxError> {
    if files.is_empty() {
        return Ok(());
    }
    environment.provision_files(files)?;
    info!(container = %environment.name(), files = files.len(), "Challenge files provisioned");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub session_id: String,
    pub challenge_id: String,
    pub websocket_url: String,
    /// Names only; contents can hold the flag.
    pub setup_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubmitResponse {
    pub success: bool,
    pub message: String,
    pub points: u32,
}

pub struct ChallengeProvisioner {
    catalog: Arc<ChallengeCatalog>,
    registry: Arc<SessionRegistry>,
}

impl ChallengeProvisioner {
    pub fn new(catalog: Arc<ChallengeCatalog>, registry: Arc<SessionRegistry>) -> Self {
        Self { catalog, registry }
    }

    pub fn catalog(&self) -> &ChallengeCatalog {
        &self.catalog
    }

    /// Reserve a session bound to the challenge. Its files are written when
    /// the first connection initializes the environment.
    pub fn start(&self, challenge_id: &str) -> Result<StartResponse, ApiError> {
        let challenge = self
            .catalog
            .definition(challenge_id)
            .ok_or(ApiError::NotFound("challenge"))?;

        let session = self.registry.reserve(SessionSeed {
            challenge_id: Some(challenge.id.clone()),
            files: challenge.setup_files.clone(),
        });
        info!(session = %session.id(), challenge = %challenge.id, "Challenge started");

        Ok(StartResponse {
            session_id: session.id().to_string(),
            challenge_id: challenge.id.clone(),
            websocket_url: terminal_endpoint(session.id()),
            setup_files: challenge.setup_files.keys().cloned().collect(),
        })
    }

    /// Compare a submitted flag. Independent of any session.
    pub fn submit(&self, challenge_id: &str, submitted_flag: &str) -> Result<SubmitResponse, ApiError> {
        let challenge = self
            .catalog
            .definition(challenge_id)
            .ok_or(ApiError::NotFound("challenge"))?;

        if challenge.check_flag(submitted_flag) {
            info!(challenge = %challenge.id, "Correct flag submitted");
            Ok(SubmitResponse {
                success: true,
                message: "Congratulations! You've completed the challenge!".to_string(),
                points: challenge.points,
            })
        } else {
            Ok(SubmitResponse {
                success: false,
                message: "Incorrect flag. Keep trying!".to_string(),
                points: 0,
            })
        }
    }
}
