//! Clients factory
//!
//! Owns the clusters snapshot, the namespace caches and the two background
//! refresh loops, and builds per-user [`AggregatedClient`]s on demand.
//!
//! # Lifecycle
//!
//! ```text
//! start() ──► watch_clusters ──(first load)──► watch_namespaces
//!                  │ every poll interval             │ every poll interval
//!                  ▼                                 ▼
//!            update_clusters                  update_namespaces + TTL sweep
//! stop()  ──► cancel token ──► join both tasks
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ListParams;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregated::{AggregatedClient, FanOut};
use crate::cache::{ClustersNamespaces, UsersNamespaces};
use crate::cluster::{Cluster, ClusterFetcher, ClusterSnapshot, Clusters};
use crate::config::{ClusterConfig, FactoryConfig};
use crate::error::{AggregateError, ClientError, ClusterNotFoundError, Error, Result};
use crate::kube_client::{discovery_client, ClientBuilder, KubeClientBuilder};
use crate::nsaccess::{NamespaceChecker, PolicyRulesChecker};
use crate::pool::ClientsPool;
use crate::principal::UserPrincipal;

#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

/// Builds and caches per-user multi-cluster clients
pub struct ClientsFactory {
    fetcher: Arc<dyn ClusterFetcher>,
    checker: Arc<dyn NamespaceChecker>,
    builder: Arc<dyn ClientBuilder>,
    config: FactoryConfig,
    clusters: Clusters,
    /// Hash the namespace caches were last synced against
    clusters_hash: Mutex<String>,
    clusters_namespaces: ClustersNamespaces,
    users_namespaces: UsersNamespaces,
    lifecycle: Mutex<Lifecycle>,
}

impl ClientsFactory {
    /// Create a factory from its collaborators
    pub fn new(
        fetcher: Arc<dyn ClusterFetcher>,
        checker: Arc<dyn NamespaceChecker>,
        builder: Arc<dyn ClientBuilder>,
        config: FactoryConfig,
    ) -> Self {
        Self {
            fetcher,
            checker,
            builder,
            users_namespaces: UsersNamespaces::new(config.user_namespace_ttl),
            config,
            clusters: Clusters::new(),
            clusters_hash: Mutex::new(String::new()),
            clusters_namespaces: ClustersNamespaces::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Factory talking to real clusters with the default required RBAC rules
    pub fn with_kube(fetcher: Arc<dyn ClusterFetcher>, config: FactoryConfig) -> Self {
        let builder = KubeClientBuilder::new(config.client.clone());
        Self::new(
            fetcher,
            Arc::new(PolicyRulesChecker::default()),
            Arc::new(builder),
            config,
        )
    }

    /// Factory settings
    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Current clusters snapshot
    pub fn clusters(&self) -> Arc<ClusterSnapshot> {
        self.clusters.get()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the cluster and namespace refresh loops. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.cancel.is_some() {
            debug!("Clients factory already started");
            return;
        }

        let cancel = CancellationToken::new();
        let (loaded_tx, loaded_rx) = oneshot::channel();

        lifecycle.tasks.push(tokio::spawn(
            self.clone().watch_clusters(cancel.clone(), loaded_tx),
        ));
        lifecycle.tasks.push(tokio::spawn(
            self.clone().watch_namespaces(cancel.clone(), loaded_rx),
        ));
        lifecycle.cancel = Some(cancel);

        info!(
            clusters_interval = ?self.config.clusters_poll_interval,
            namespaces_interval = ?self.config.namespaces_poll_interval,
            "Clients factory started"
        );
    }

    /// Cancel the refresh loops and wait for them to exit
    pub async fn stop(&self) {
        let (cancel, tasks) = {
            let mut lifecycle = self.lifecycle.lock();
            (
                lifecycle.cancel.take(),
                std::mem::take(&mut lifecycle.tasks),
            )
        };
        let Some(cancel) = cancel else {
            return;
        };

        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Refresh loop panicked");
            }
        }
        info!("Clients factory stopped");
    }

    /// True between `start` and `stop`
    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().cancel.is_some()
    }

    async fn watch_clusters(
        self: Arc<Self>,
        cancel: CancellationToken,
        loaded: oneshot::Sender<()>,
    ) {
        let mut loaded = Some(loaded);
        let mut ticker = tokio::time::interval(self.config.clusters_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.update_clusters().await {
                        warn!(error = %e, "Failed to update clusters");
                    }
                    if let Some(tx) = loaded.take() {
                        let _ = tx.send(());
                    }
                }
            }
        }
        debug!("Cluster refresh loop exited");
    }

    async fn watch_namespaces(
        self: Arc<Self>,
        cancel: CancellationToken,
        loaded: oneshot::Receiver<()>,
    ) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            first = loaded => {
                if first.is_err() {
                    return;
                }
            }
        }

        let mut ticker = tokio::time::interval(self.config.namespaces_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(errors) = self.update_namespaces().await {
                        for e in &errors.errors {
                            warn!(
                                cluster = %e.cluster_name,
                                error = %e.source,
                                "Failed to update namespaces"
                            );
                        }
                    }
                    let purged = self.users_namespaces.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Dropped expired user namespace entries");
                    }
                }
            }
        }
        debug!("Namespace refresh loop exited");
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Fetch the cluster list and replace the snapshot.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn update_clusters(&self) -> Result<()> {
        let clusters = self.fetcher.fetch().await?;
        debug!(count = clusters.len(), "Fetched clusters");
        self.clusters.set(clusters);
        Ok(())
    }

    /// Refresh the unfiltered namespace inventory of every cluster.
    ///
    /// Clears both namespace caches first when the cluster topology changed.
    /// Clusters that fail keep no entry and are reported in the error;
    /// the others are still updated.
    pub async fn update_namespaces(&self) -> std::result::Result<(), AggregateError> {
        self.sync_caches();

        let (server, mut errors) = self.get_server_client().await.into_parts();
        let (lists, list_errors) = server
            .clustered_list::<Namespace>(false, &ListParams::default())
            .await
            .into_parts();
        errors.extend(list_errors);

        for (cluster, pages) in lists {
            let namespaces: Vec<Namespace> = pages.into_iter().flat_map(|p| p.items).collect();
            debug!(cluster = %cluster, count = namespaces.len(), "Updated cluster namespaces");
            self.clusters_namespaces.set(&cluster, namespaces);
        }

        errors.into_result()
    }

    /// Clear namespace caches if the clusters hash moved since the last sync
    fn sync_caches(&self) -> bool {
        let hash = self.clusters.hash();
        let mut synced = self.clusters_hash.lock();
        if *synced == hash {
            return false;
        }

        info!("Clearing namespace caches");
        self.clusters_namespaces.clear();
        self.users_namespaces.clear();
        *synced = hash;
        true
    }

    // ========================================================================
    // Clients
    // ========================================================================

    /// Clients for every cluster acting as `user`.
    ///
    /// Clusters whose client could not be built are missing from the pool and
    /// named in the returned errors.
    pub async fn get_impersonated_client(&self, user: &UserPrincipal) -> FanOut<AggregatedClient> {
        let snapshot = self.clusters.get();
        let pool = self
            .build_pool(&snapshot, |cluster| {
                ClusterConfig::with_user(cluster, user, &self.config.client)
            })
            .await;
        let namespaces = self.user_ns_list(user).await;
        pool.map(|pool| AggregatedClient::new(pool, namespaces))
    }

    /// Client for one cluster acting as `user`
    pub async fn get_impersonated_client_for_cluster(
        &self,
        user: &UserPrincipal,
        cluster_name: &str,
    ) -> Result<AggregatedClient> {
        let snapshot = self.clusters.get();
        let cluster = snapshot
            .get(cluster_name)
            .ok_or_else(|| ClusterNotFoundError::new(cluster_name))?;

        let config = ClusterConfig::with_user(cluster, user, &self.config.client)?;
        let client = self
            .builder
            .build(config)
            .await
            .map_err(|e| ClientError::new(cluster_name, e))?;

        let pool = ClientsPool::new();
        pool.add(client, cluster);
        Ok(AggregatedClient::new(
            Arc::new(pool),
            self.user_ns_list(user).await,
        ))
    }

    /// API discovery for one cluster acting as `user`.
    ///
    /// The returned [`kube::Discovery`] has not run yet.
    pub fn get_impersonated_discovery_client(
        &self,
        user: &UserPrincipal,
        cluster_name: &str,
    ) -> Result<kube::Discovery> {
        let snapshot = self.clusters.get();
        let cluster = snapshot
            .get(cluster_name)
            .ok_or_else(|| ClusterNotFoundError::new(cluster_name))?;
        let config = ClusterConfig::with_user(cluster, user, &self.config.client)?;
        discovery_client(&config)
    }

    /// Clients for every cluster acting as the server's service identity
    pub async fn get_server_client(&self) -> FanOut<AggregatedClient> {
        let snapshot = self.clusters.get();
        let pool = self
            .build_pool(&snapshot, |cluster| {
                ClusterConfig::as_server(cluster, &self.config.client)
            })
            .await;
        let namespaces = self.clusters_namespaces.snapshot();
        pool.map(|pool| AggregatedClient::new(pool, namespaces))
    }

    async fn build_pool<F>(
        &self,
        snapshot: &ClusterSnapshot,
        resolve: F,
    ) -> FanOut<Arc<ClientsPool>>
    where
        F: Fn(&Cluster) -> Result<ClusterConfig>,
    {
        let pool = Arc::new(ClientsPool::new());

        let builds = snapshot.clusters().iter().map(|cluster| {
            let config = resolve(cluster);
            let pool = &pool;
            async move {
                let client = self.builder.build(config?).await?;
                pool.add(client, cluster);
                Ok::<(), Error>(())
            }
        });
        let results: Vec<Result<()>> = join_all(builds).await;

        let errors: AggregateError = snapshot
            .clusters()
            .iter()
            .zip(results)
            .filter_map(|(cluster, result)| {
                result.err().map(|e| ClientError::new(&cluster.name, e))
            })
            .collect();

        if !errors.is_empty() {
            debug!(
                built = pool.len(),
                failed = ?errors.clusters(),
                "Some cluster clients could not be built"
            );
        }

        FanOut { value: pool, errors }
    }

    // ========================================================================
    // User namespaces
    // ========================================================================

    /// Recompute which namespaces `user` may access on every cluster.
    ///
    /// Best effort: a cluster that fails is logged and left without an entry.
    pub async fn update_user_namespaces(&self, user: &UserPrincipal) {
        let snapshot = self.clusters.get();
        let updates = snapshot
            .clusters()
            .iter()
            .map(|cluster| self.update_user_namespaces_for(user, cluster));
        let results = join_all(updates).await;

        for (cluster, result) in snapshot.clusters().iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    cluster = %cluster.name,
                    user = %user.id,
                    error = %e,
                    "Failed filtering namespaces"
                );
            }
        }
    }

    async fn update_user_namespaces_for(
        &self,
        user: &UserPrincipal,
        cluster: &Cluster,
    ) -> Result<()> {
        let hash = self.clusters.hash();
        let namespaces = self
            .clusters_namespaces
            .get(&cluster.name)
            .unwrap_or_default();
        let config = ClusterConfig::with_user(cluster, user, &self.config.client)?;
        let client = self.builder.build(config).await?;
        let accessible = self
            .checker
            .filter_accessible_namespaces(client.as_ref(), &namespaces)
            .await?;

        // Held across the check so a topology clear cannot interleave
        let _synced = self.clusters_hash.lock();
        if self.clusters.hash() != hash {
            debug!(
                cluster = %cluster.name,
                user = %user.id,
                "Clusters changed during namespace check, dropping result"
            );
            return Ok(());
        }
        self.users_namespaces.set(user, &cluster.name, accessible);
        Ok(())
    }

    /// Cached accessible namespaces of `user`, keyed by cluster.
    ///
    /// Clusters without a fresh entry are absent.
    pub fn get_user_namespaces(&self, user: &UserPrincipal) -> HashMap<String, Vec<Namespace>> {
        let snapshot = self.clusters.get();
        self.users_namespaces
            .get_all(user, snapshot.clusters().iter().map(|c| c.name.as_str()))
    }

    /// Unfiltered namespace inventory, keyed by cluster
    pub fn get_clusters_namespaces(&self) -> HashMap<String, Vec<Namespace>> {
        self.clusters_namespaces.snapshot()
    }

    async fn user_ns_list(&self, user: &UserPrincipal) -> HashMap<String, Vec<Namespace>> {
        let namespaces = self.get_user_namespaces(user);
        if !namespaces.is_empty() {
            return namespaces;
        }
        self.update_user_namespaces(user).await;
        self.get_user_namespaces(user)
    }
}

impl std::fmt::Debug for ClientsFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientsFactory")
            .field("clusters", &self.clusters.get().len())
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
