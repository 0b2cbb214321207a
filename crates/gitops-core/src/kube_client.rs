//! Per-cluster API clients
//!
//! [`ClusterClient`] is the narrow, object-safe surface the fan-out and
//! namespace-access code needs from a cluster. [`ClientBuilder`] turns a
//! resolved [`ClusterConfig`] into one. Production code uses
//! [`KubeClientBuilder`] backed by kube-rs; tests inject fakes.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    SelfSubjectRulesReview, SelfSubjectRulesReviewSpec, SubjectRulesReviewStatus,
};
use kube::api::{Api, DynamicObject, ListParams, ObjectList, PostParams};
use kube::client::{Body, ClientBuilder as KubeRsClientBuilder};
use kube::discovery::ApiResource;
use kube::{Client, Discovery};
use tower::limit::RateLimitLayer;
use tracing::debug;

use crate::config::{ClientSettings, ClusterConfig};
use crate::error::{Error, Result};

/// Header set by API servers that have API Priority & Fairness enabled
pub const FLOW_SCHEMA_UID_HEADER: &str = "X-Kubernetes-PF-FlowSchema-UID";

/// Cheap endpoint used to detect API Priority & Fairness
const FLOW_CONTROL_PROBE_PATH: &str = "/livez/ping";

// ============================================================================
// Traits for Dependency Injection
// ============================================================================

/// Operations this subsystem performs against a single cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List objects of `resource`, in `namespace` or across all namespaces
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> std::result::Result<ObjectList<DynamicObject>, kube::Error>;

    /// Get one object of `resource` by name
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> std::result::Result<DynamicObject, kube::Error>;

    /// Effective RBAC rules of the calling identity in `namespace`
    async fn rules_review(
        &self,
        namespace: &str,
    ) -> std::result::Result<SubjectRulesReviewStatus, kube::Error>;
}

/// Builds per-cluster clients from resolved configurations
#[async_trait]
pub trait ClientBuilder: Send + Sync {
    /// Build a ready-to-use client for `config`
    async fn build(&self, config: ClusterConfig) -> Result<Arc<dyn ClusterClient>>;
}

// ============================================================================
// kube-rs implementation
// ============================================================================

/// [`ClusterClient`] backed by a kube-rs [`Client`]
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap an existing kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying kube client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> std::result::Result<ObjectList<DynamicObject>, kube::Error> {
        self.api(resource, namespace).list(params).await
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> std::result::Result<DynamicObject, kube::Error> {
        self.api(resource, namespace).get(name).await
    }

    async fn rules_review(
        &self,
        namespace: &str,
    ) -> std::result::Result<SubjectRulesReviewStatus, kube::Error> {
        let api: Api<SelfSubjectRulesReview> = Api::all(self.client.clone());
        let review = SelfSubjectRulesReview {
            spec: SelfSubjectRulesReviewSpec {
                namespace: Some(namespace.to_string()),
            },
            ..Default::default()
        };
        let created = api.create(&PostParams::default(), &review).await?;
        Ok(created.status.unwrap_or_default())
    }
}

/// Production [`ClientBuilder`] creating kube-rs clients
#[derive(Debug, Clone)]
pub struct KubeClientBuilder {
    flow_control: bool,
    settings: ClientSettings,
}

impl KubeClientBuilder {
    /// Builder using `settings`; probes flow control if the settings ask for it
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            flow_control: settings.flow_control,
            settings,
        }
    }

    /// Turn the flow-control probe on or off
    pub fn with_flow_control(mut self, enabled: bool) -> Self {
        self.flow_control = enabled;
        self
    }

    /// Pick client-side limits from what `probe` reports about flow control
    async fn resolve_limits(&self, probe: &Client, config: &mut ClusterConfig) -> Result<()> {
        let enabled = flow_control_enabled(probe).await.map_err(|e| {
            Error::config_for(
                &config.cluster_name,
                format!("error querying cluster for flowcontrol config: {}", e),
            )
        })?;
        if enabled {
            config.use_server_flow_control();
        } else {
            config.use_client_limits(self.settings.qps, self.settings.burst);
        }
        debug!(
            cluster = %config.cluster_name,
            qps = config.qps,
            burst = config.burst,
            "Resolved client rate limits"
        );
        Ok(())
    }
}

#[async_trait]
impl ClientBuilder for KubeClientBuilder {
    async fn build(&self, mut config: ClusterConfig) -> Result<Arc<dyn ClusterClient>> {
        if self.flow_control {
            let probe = plain_client(&config)?;
            self.resolve_limits(&probe, &mut config).await?;
        }

        Ok(Arc::new(KubeClusterClient::new(build_kube_client(&config)?)))
    }
}

/// Create a kube client for `config`, rate limited client side when bounded
pub fn build_kube_client(config: &ClusterConfig) -> Result<Client> {
    let Some((num, per)) = config.rate_limit() else {
        return plain_client(config);
    };

    let builder = KubeRsClientBuilder::try_from(config.to_kube_config()?).map_err(|e| {
        Error::config_for(
            &config.cluster_name,
            format!("failed to create client: {}", e),
        )
    })?;
    Ok(builder.with_layer(&RateLimitLayer::new(num, per)).build())
}

fn plain_client(config: &ClusterConfig) -> Result<Client> {
    Client::try_from(config.to_kube_config()?).map_err(|e| {
        Error::config_for(
            &config.cluster_name,
            format!("failed to create client: {}", e),
        )
    })
}

/// Ask the cluster whether it advertises API Priority & Fairness
pub async fn flow_control_enabled(client: &Client) -> Result<bool> {
    let request = http::Request::head(FLOW_CONTROL_PROBE_PATH)
        .body(Body::empty())
        .map_err(|e| Error::config(format!("failed to build flowcontrol probe: {}", e)))?;
    let response = client.send(request).await?;
    Ok(response.headers().contains_key(FLOW_SCHEMA_UID_HEADER))
}

/// Create an API discovery client for `config`
pub fn discovery_client(config: &ClusterConfig) -> Result<Discovery> {
    Ok(Discovery::new(plain_client(config)?))
}
