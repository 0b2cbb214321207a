//! Multi-cluster client management and namespace access control
//!
//! Keeps a live registry of downstream clusters, builds per-user impersonated
//! clients for them, fans requests out across every cluster while tolerating
//! partial failure, and caches which namespaces each user may see on each
//! cluster based on a live RBAC review.
//!
//! The entry point is [`ClientsFactory`]:
//!
//! ```ignore
//! use std::sync::Arc;
//! use gitops_core::{ClientsFactory, FactoryConfig, SingleClusterFetcher, UserPrincipal};
//!
//! let fetcher = Arc::new(SingleClusterFetcher::infer().await?);
//! let factory = Arc::new(ClientsFactory::with_kube(fetcher, FactoryConfig::default()));
//! factory.start();
//!
//! let user = UserPrincipal::new("alice", vec!["dev".into()]);
//! let client = factory.get_impersonated_client(&user).await;
//! let deployments = client.value.clustered_list::<Deployment>(true, &Default::default()).await;
//!
//! factory.stop().await;
//! ```

#![deny(missing_docs)]

pub mod aggregated;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod factory;
pub mod fetcher;
pub mod kube_client;
pub mod nsaccess;
pub mod pool;
pub mod principal;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use aggregated::{AggregatedClient, ClusteredLists, FanOut, ListPage};
pub use cluster::{Cluster, ClusterFetcher, ClusterSnapshot, TlsConfig, DEFAULT_CLUSTER};
pub use config::{ClientSettings, ClusterConfig, FactoryConfig};
pub use error::{AggregateError, ClientError, ClusterNotFoundError, Error, Result};
pub use factory::ClientsFactory;
pub use fetcher::{FileClusterFetcher, SingleClusterFetcher, StaticClusterFetcher};
pub use kube_client::{ClientBuilder, ClusterClient, KubeClientBuilder};
pub use nsaccess::{NamespaceChecker, PolicyRulesChecker};
pub use pool::ClientsPool;
pub use principal::UserPrincipal;
