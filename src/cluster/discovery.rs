//! Cluster topology: server identity and service discovery.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A server instance as seen by the cluster. Immutable after start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub server_type: String,
    pub frontend: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Server {
    pub fn frontend(id: impl Into<String>, server_type: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            server_type: server_type.into(),
            frontend: true,
            metadata: HashMap::new(),
        })
    }

    pub fn backend(id: impl Into<String>, server_type: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            server_type: server_type.into(),
            frontend: false,
            metadata: HashMap::new(),
        })
    }
}

/// Live-topology view. The production implementation watches an external
/// registry (etcd endpoints, heartbeat and lease come from
/// [`crate::core::config::DiscoveryConfig`]); tests and embedded single
/// process deployments use [`StaticDiscovery`].
pub trait ServiceDiscovery: Send + Sync + 'static {
    /// All live servers of one type.
    fn servers_by_type(&self, server_type: &str) -> Vec<Arc<Server>>;

    /// One representative server per known type, keyed by type.
    fn server_types(&self) -> Vec<Arc<Server>>;

    /// Lookup by server id.
    fn server_by_id(&self, id: &str) -> Option<Arc<Server>>;
}

/// Fixed in-process topology.
#[derive(Default)]
pub struct StaticDiscovery {
    servers: RwLock<HashMap<String, Arc<Server>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, server: Arc<Server>) {
        self.servers.write().insert(server.id.clone(), server);
    }

    pub fn remove(&self, id: &str) {
        self.servers.write().remove(id);
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn servers_by_type(&self, server_type: &str) -> Vec<Arc<Server>> {
        let mut matched: Vec<Arc<Server>> = self
            .servers
            .read()
            .values()
            .filter(|s| s.server_type == server_type)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    fn server_types(&self) -> Vec<Arc<Server>> {
        let mut by_type: HashMap<String, Arc<Server>> = HashMap::new();
        for server in self.servers.read().values() {
            by_type
                .entry(server.server_type.clone())
                .and_modify(|held| {
                    // Deterministic representative: smallest id wins.
                    if server.id < held.id {
                        *held = server.clone();
                    }
                })
                .or_insert_with(|| server.clone());
        }
        let mut reps: Vec<Arc<Server>> = by_type.into_values().collect();
        reps.sort_by(|a, b| a.server_type.cmp(&b.server_type));
        reps
    }

    fn server_by_id(&self, id: &str) -> Option<Arc<Server>> {
        self.servers.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> StaticDiscovery {
        let disco = StaticDiscovery::new();
        disco.add(Server::frontend("f1", "connector"));
        disco.add(Server::frontend("f2", "connector"));
        disco.add(Server::backend("r1", "room"));
        disco
    }

    #[test]
    fn servers_by_type_filters_and_sorts() {
        let disco = topology();
        let connectors = disco.servers_by_type("connector");
        assert_eq!(connectors.len(), 2);
        assert_eq!(connectors[0].id, "f1");
        assert!(disco.servers_by_type("matchmaker").is_empty());
    }

    #[test]
    fn one_representative_per_type() {
        let disco = topology();
        let reps = disco.server_types();
        assert_eq!(reps.len(), 2);
        let connector = reps.iter().find(|s| s.server_type == "connector").unwrap();
        assert_eq!(connector.id, "f1");
    }

    #[test]
    fn lookup_by_id() {
        let disco = topology();
        assert!(disco.server_by_id("r1").is_some());
        assert!(disco.server_by_id("r9").is_none());
        disco.remove("r1");
        assert!(disco.server_by_id("r1").is_none());
    }
}
