//! Shared application state.

use crate::challenges::ChallengeCatalog;
use crate::provisioner::ChallengeProvisioner;
use crate::registry::SessionRegistry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// An open terminal connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub session_id: String,
    pub connected_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub session_id: String,
    pub connected_secs: u64,
}

/// Active connections, keyed by connection id.
pub type Connections = Arc<DashMap<Uuid, Connection>>;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub provisioner: Arc<ChallengeProvisioner>,
    pub connections: Connections,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, catalog: ChallengeCatalog) -> Self {
        let provisioner = ChallengeProvisioner::new(Arc::new(catalog), registry.clone());
        Self {
            registry,
            provisioner: Arc::new(provisioner),
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn connection_list(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| ConnectionInfo {
                id: entry.key().to_string(),
                session_id: entry.session_id.clone(),
                connected_secs: entry.connected_at.elapsed().as_secs(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_info_serializes_id_as_string() {
        let id = Uuid::new_v4();
        let info = ConnectionInfo {
            id: id.to_string(),
            session_id: "s1".into(),
            connected_secs: 3,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], id.to_string());
        assert_eq!(json["session_id"], "s1");
    }
}
