//! Error types for multi-cluster client management
//!
//! Per-cluster failures are never dropped: they carry the originating cluster
//! (and namespace, when a fan-out was namespace scoped) and are collected into
//! an [`AggregateError`] that travels alongside whatever succeeded.

use std::fmt;

use thiserror::Error;

/// Result type alias using the crate error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cluster client operations
#[derive(Debug, Error)]
pub enum Error {
    /// A named cluster is absent from a pool or from the clusters snapshot
    #[error(transparent)]
    ClusterNotFound(#[from] ClusterNotFoundError),

    /// Client configuration could not be resolved (bad principal, bad credentials)
    #[error("configuration error for {cluster}: {message}")]
    Config {
        /// Cluster whose configuration failed, `unknown` when not cluster specific
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// A single cluster failed during construction or use of its client
    #[error(transparent)]
    Client(#[from] ClientError),

    /// One or more clusters failed during a fan-out operation
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// A SelfSubjectRulesReview failed; the namespace filter fails closed
    #[error("user namespace access in {namespace}: {source}")]
    NamespaceAccess {
        /// Namespace being reviewed when the request failed
        namespace: String,
        /// The underlying API error
        #[source]
        source: kube::Error,
    },

    /// The cluster fetcher could not produce a cluster list
    #[error("failed to fetch clusters: {message}")]
    Fetch {
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A dynamic object could not be converted into the requested type
    #[error("decode error for {kind}: {message}")]
    Decode {
        /// Kind that was being decoded
        kind: String,
        /// Description of what failed
        message: String,
    },
}

/// Default cluster value for errors raised outside any single cluster
pub const UNKNOWN_CLUSTER: &str = "unknown";

impl Error {
    /// Create a configuration error without cluster context
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            cluster: UNKNOWN_CLUSTER.to_string(),
            message: msg.into(),
        }
    }

    /// Create a configuration error for a specific cluster
    pub fn config_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a fetch error
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch {
            message: msg.into(),
        }
    }

    /// Create a decode error for the given kind
    pub fn decode(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Decode {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::ClusterNotFound(e) => Some(&e.cluster),
            Error::Config { cluster, .. } if cluster != UNKNOWN_CLUSTER => Some(cluster),
            Error::Client(e) => Some(&e.cluster_name),
            _ => None,
        }
    }
}

/// A cluster client could not be found
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cluster={cluster} not found")]
pub struct ClusterNotFoundError {
    /// Name of the missing cluster
    pub cluster: String,
}

impl ClusterNotFoundError {
    /// Create a not-found error for the named cluster
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }
}

/// Failure of one cluster (optionally one namespace of it) inside a fan-out
#[derive(Debug, Error)]
pub struct ClientError {
    /// Cluster the failure originated from
    pub cluster_name: String,
    /// Namespace the failing call was scoped to, if any
    pub namespace: Option<String>,
    /// The underlying failure
    #[source]
    pub source: Box<Error>,
}

impl ClientError {
    /// Wrap an error with its originating cluster
    pub fn new(cluster_name: impl Into<String>, source: impl Into<Error>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            namespace: None,
            source: Box::new(source.into()),
        }
    }

    /// Wrap an error with its originating cluster and namespace
    pub fn in_namespace(
        cluster_name: impl Into<String>,
        namespace: impl Into<String>,
        source: impl Into<Error>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            namespace: Some(namespace.into()),
            source: Box::new(source.into()),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(
                f,
                "{}, cluster: {}, namespace: {}",
                self.source, self.cluster_name, ns
            ),
            None => write!(f, "{}, cluster: {}", self.source, self.cluster_name),
        }
    }
}

/// Typed multi-error: zero or more independent per-cluster failures
#[derive(Debug, Default, Error)]
pub struct AggregateError {
    /// Collected per-cluster failures, in the order they were recorded
    pub errors: Vec<ClientError>,
}

impl AggregateError {
    /// Create an empty aggregate
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure
    pub fn push(&mut self, err: ClientError) {
        self.errors.push(err);
    }

    /// Append every failure of another aggregate
    pub fn extend(&mut self, other: AggregateError) {
        self.errors.extend(other.errors);
    }

    /// True when no failure was recorded
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Names of the failing clusters, deduplicated, in first-seen order
    pub fn clusters(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for err in &self.errors {
            if !names.contains(&err.cluster_name.as_str()) {
                names.push(&err.cluster_name);
            }
        }
        names
    }

    /// `Ok(())` when empty, otherwise `Err(self)`
    pub fn into_result(self) -> std::result::Result<(), AggregateError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "1 error occurred: {}", self.errors[0]),
            n => {
                write!(f, "{} errors occurred:", n)?;
                for err in &self.errors {
                    write!(f, " [{}]", err)?;
                }
                Ok(())
            }
        }
    }
}

impl FromIterator<ClientError> for AggregateError {
    fn from_iter<I: IntoIterator<Item = ClientError>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}
