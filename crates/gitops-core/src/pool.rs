//! Per-request map of cluster name to ready API client

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cluster::Cluster;
use crate::error::ClusterNotFoundError;
use crate::kube_client::ClusterClient;

/// Clients to the leaf clusters, scoped to one user or session.
///
/// Built fresh for every impersonation request and never shared across users.
/// The mutex only serializes concurrent `add`s from the per-cluster builders of
/// the same call.
#[derive(Default)]
pub struct ClientsPool {
    clients: Mutex<HashMap<String, Arc<dyn ClusterClient>>>,
}

impl ClientsPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the client for `cluster.name`; last write wins
    pub fn add(&self, client: Arc<dyn ClusterClient>, cluster: &Cluster) {
        self.clients.lock().insert(cluster.name.clone(), client);
    }

    /// Client of the named cluster
    pub fn client(&self, name: &str) -> Result<Arc<dyn ClusterClient>, ClusterNotFoundError> {
        self.clients
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterNotFoundError::new(name))
    }

    /// Snapshot of every entry, for fan-out iteration
    pub fn clients(&self) -> HashMap<String, Arc<dyn ClusterClient>> {
        self.clients.lock().clone()
    }

    /// Names of the clusters in the pool, sorted
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of clients
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    /// True if the pool holds no clients
    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

impl fmt::Debug for ClientsPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientsPool")
            .field("clusters", &self.cluster_names())
            .finish()
    }
}
