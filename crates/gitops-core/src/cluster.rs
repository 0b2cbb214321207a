//! Cluster definitions and the live clusters snapshot
//!
//! A [`Cluster`] is produced by a [`ClusterFetcher`] and never mutated once it
//! lands in a snapshot. [`Clusters`] swaps the whole snapshot on every
//! successful fetch so readers always see a consistent list.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use zeroize::Zeroizing;

use crate::error::Result;

/// Name used for the local cluster when only one cluster is managed
pub const DEFAULT_CLUSTER: &str = "Default";

/// TLS settings for reaching a cluster API server
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Skip server certificate verification
    pub insecure: bool,
    /// Override for the server name used in SNI and certificate checks
    pub server_name: Option<String>,
    /// PEM encoded CA bundle trusted for this cluster
    pub ca_data: Option<Vec<u8>>,
    /// PEM encoded client certificate presented as the service identity
    pub cert_data: Option<Vec<u8>>,
    /// PEM encoded private key of `cert_data`
    pub key_data: Option<Zeroizing<Vec<u8>>>,
}

impl TlsConfig {
    /// True when both halves of a client certificate identity are present
    pub fn has_client_identity(&self) -> bool {
        self.cert_data.is_some() && self.key_data.is_some()
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("insecure", &self.insecure)
            .field("server_name", &self.server_name)
            .field("ca_data", &self.ca_data.as_ref().map(|d| d.len()))
            .field("cert_data", &self.cert_data.as_ref().map(|d| d.len()))
            .field("key_data", &self.key_data.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A downstream cluster the server talks to
#[derive(Clone, Default)]
pub struct Cluster {
    /// Unique cluster name, the cluster's identity
    pub name: String,
    /// API server address
    pub server: String,
    /// Name of the secret the bearer token was read from
    pub secret_ref: Option<String>,
    /// Service bearer token for server-identity access
    pub bearer_token: Option<Zeroizing<String>>,
    /// TLS settings
    pub tls: TlsConfig,
}

impl Cluster {
    /// Create a cluster with a name and server address
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            ..Default::default()
        }
    }

    /// Set the service bearer token
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(Zeroizing::new(token.into()));
        self
    }

    /// Set the TLS settings
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Service bearer token, if any
    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_ref().map(|t| t.as_str())
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("secret_ref", &self.secret_ref)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .finish()
    }
}

/// Source of cluster definitions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterFetcher: Send + Sync {
    /// Fetch the current list of clusters
    async fn fetch(&self) -> Result<Vec<Cluster>>;
}

/// Immutable clusters list plus the hash derived from its ordered names
#[derive(Debug, Default)]
pub struct ClusterSnapshot {
    clusters: Vec<Cluster>,
    hash: String,
}

impl ClusterSnapshot {
    /// Build a snapshot, deriving its hash
    pub fn new(clusters: Vec<Cluster>) -> Self {
        let hash = clusters_hash(&clusters);
        Self { clusters, hash }
    }

    /// Clusters in fetch order
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Topology hash of this snapshot
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Find a cluster by name
    pub fn get(&self, name: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Number of clusters
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// True if there are no clusters
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Deterministic topology hash of an ordered cluster list.
///
/// Only names take part: the hash exists to detect clusters being added,
/// removed or reordered, not credential rotation. Names are length prefixed
/// so `["a,b"]` and `["a", "b"]` never collide.
pub fn clusters_hash(clusters: &[Cluster]) -> String {
    clusters.iter().fold(String::new(), |mut acc, c| {
        acc.push_str(&c.name.len().to_string());
        acc.push(':');
        acc.push_str(&c.name);
        acc.push(';');
        acc
    })
}

/// Copy-on-write holder of the current [`ClusterSnapshot`]
#[derive(Debug, Default)]
pub struct Clusters {
    current: RwLock<Arc<ClusterSnapshot>>,
}

impl Clusters {
    /// Create an empty holder
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot wholesale
    pub fn set(&self, clusters: Vec<Cluster>) {
        let snapshot = Arc::new(ClusterSnapshot::new(clusters));
        *self.current.write() = snapshot;
    }

    /// Current snapshot; stays valid even if a newer one is installed
    pub fn get(&self) -> Arc<ClusterSnapshot> {
        self.current.read().clone()
    }

    /// Hash of the current snapshot
    pub fn hash(&self) -> String {
        self.current.read().hash().to_string()
    }
}
