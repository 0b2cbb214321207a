//! Cluster sources
//!
//! - [`StaticClusterFetcher`]: a fixed, replaceable list
//! - [`FileClusterFetcher`]: a YAML file re-read on every fetch
//! - [`SingleClusterFetcher`]: the local cluster as [`DEFAULT_CLUSTER`]

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use parking_lot::RwLock;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::debug;
use zeroize::Zeroizing;

use crate::cluster::{Cluster, ClusterFetcher, TlsConfig, DEFAULT_CLUSTER};
use crate::error::{Error, Result};

// ============================================================================
// Static
// ============================================================================

/// Serves a fixed list of clusters
#[derive(Debug, Default)]
pub struct StaticClusterFetcher {
    clusters: RwLock<Vec<Cluster>>,
}

impl StaticClusterFetcher {
    /// Serve `clusters`
    pub fn new(clusters: Vec<Cluster>) -> Self {
        Self {
            clusters: RwLock::new(clusters),
        }
    }

    /// Swap the served list; picked up on the next fetch
    pub fn replace(&self, clusters: Vec<Cluster>) {
        *self.clusters.write() = clusters;
    }
}

#[async_trait]
impl ClusterFetcher for StaticClusterFetcher {
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        Ok(self.clusters.read().clone())
    }
}

// ============================================================================
// File
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClustersFile {
    #[serde(default)]
    clusters: Vec<ClusterEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterEntry {
    name: String,
    server: String,
    #[serde(default)]
    secret_ref: Option<String>,
    #[serde(default)]
    bearer_token: Option<String>,
    /// Base64 encoded PEM bundle
    #[serde(default)]
    certificate_authority_data: Option<String>,
    /// Base64 encoded PEM client certificate
    #[serde(default)]
    client_certificate_data: Option<String>,
    /// Base64 encoded PEM private key
    #[serde(default)]
    client_key_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
    #[serde(default)]
    tls_server_name: Option<String>,
}

impl ClusterEntry {
    fn into_cluster(self) -> Result<Cluster> {
        if self.name.is_empty() {
            return Err(Error::fetch("cluster entry without a name"));
        }

        let decode = |field: &str, data: Option<String>| {
            data.map(|data| {
                decode_base64(&data).map_err(|e| {
                    Error::fetch(format!("cluster {}: invalid {}: {}", self.name, field, e))
                })
            })
            .transpose()
        };
        let ca_data = decode("certificateAuthorityData", self.certificate_authority_data)?;
        let cert_data = decode("clientCertificateData", self.client_certificate_data)?;
        let key_data = decode("clientKeyData", self.client_key_data)?.map(Zeroizing::new);
        if cert_data.is_some() != key_data.is_some() {
            return Err(Error::fetch(format!(
                "cluster {}: clientCertificateData and clientKeyData must be set together",
                self.name
            )));
        }

        let mut cluster = Cluster::new(self.name, self.server).with_tls(TlsConfig {
            insecure: self.insecure_skip_tls_verify,
            server_name: self.tls_server_name,
            ca_data,
            cert_data,
            key_data,
        });
        cluster.secret_ref = self.secret_ref;
        if let Some(token) = self.bearer_token.filter(|t| !t.is_empty()) {
            cluster = cluster.with_bearer_token(token);
        }
        Ok(cluster)
    }
}

fn decode_base64(data: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(data.trim())
}

/// Parse a clusters document, rejecting duplicate names
pub fn parse_clusters(yaml: &str) -> Result<Vec<Cluster>> {
    let file: ClustersFile = serde_yaml::from_str(yaml)
        .map_err(|e| Error::fetch(format!("invalid clusters file: {}", e)))?;

    let mut seen = HashSet::new();
    let mut clusters = Vec::with_capacity(file.clusters.len());
    for entry in file.clusters {
        if !seen.insert(entry.name.clone()) {
            return Err(Error::fetch(format!("duplicate cluster name {}", entry.name)));
        }
        clusters.push(entry.into_cluster()?);
    }
    Ok(clusters)
}

/// Reads clusters from a YAML file on every fetch
#[derive(Debug, Clone)]
pub struct FileClusterFetcher {
    path: PathBuf,
}

impl FileClusterFetcher {
    /// Read clusters from `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File being read
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ClusterFetcher for FileClusterFetcher {
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        let yaml = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::fetch(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let clusters = parse_clusters(&yaml)?;
        debug!(path = %self.path.display(), count = clusters.len(), "Loaded clusters file");
        Ok(clusters)
    }
}

// ============================================================================
// Single cluster
// ============================================================================

/// Serves the one cluster the server runs against, named [`DEFAULT_CLUSTER`]
#[derive(Debug, Clone)]
pub struct SingleClusterFetcher {
    cluster: Cluster,
}

impl SingleClusterFetcher {
    /// Serve `cluster` under the default name
    pub fn new(mut cluster: Cluster) -> Self {
        cluster.name = DEFAULT_CLUSTER.to_string();
        Self { cluster }
    }

    /// Build from the in-cluster environment or local kubeconfig
    pub async fn infer() -> Result<Self> {
        let config = kube::Config::infer()
            .await
            .map_err(|e| Error::fetch(format!("failed to infer kube config: {}", e)))?;
        Self::from_kube_config(&config).await
    }

    /// Build from a resolved kube config.
    ///
    /// The service identity is a bearer token (inline or token file) or a
    /// client certificate (inline data or files). Exec plugins and auth
    /// providers are not carried over, so a config relying only on them is
    /// rejected.
    pub async fn from_kube_config(config: &kube::Config) -> Result<Self> {
        let auth = &config.auth_info;
        let token = match (&auth.token, &auth.token_file) {
            (Some(token), _) => Some(token.expose_secret().to_string()),
            (None, Some(path)) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| {
                        Error::fetch(format!("failed to read token file {}: {}", path, e))
                    })?
                    .trim()
                    .to_string(),
            ),
            (None, None) => None,
        };
        let token = token.filter(|t| !t.is_empty());

        let cert_data = inline_or_file(
            "client certificate",
            auth.client_certificate_data.as_deref(),
            auth.client_certificate.as_deref(),
        )
        .await?;
        let key_data = inline_or_file(
            "client key",
            auth.client_key_data.as_ref().map(|k| k.expose_secret()),
            auth.client_key.as_deref(),
        )
        .await?
        .map(Zeroizing::new);

        let ca_data = config.root_cert.as_ref().map(|certs| {
            let pems: Vec<pem::Pem> = certs
                .iter()
                .map(|der| pem::Pem::new("CERTIFICATE", der.clone()))
                .collect();
            pem::encode_many(&pems).into_bytes()
        });

        let tls = TlsConfig {
            insecure: config.accept_invalid_certs,
            server_name: config.tls_server_name.clone(),
            ca_data,
            cert_data,
            key_data,
        };
        if token.is_none() && !tls.has_client_identity() {
            return Err(Error::fetch(format!(
                "kube config for {} has no bearer token or client certificate; \
                 exec and auth provider credentials are not supported",
                config.cluster_url
            )));
        }

        let mut cluster =
            Cluster::new(DEFAULT_CLUSTER, config.cluster_url.to_string()).with_tls(tls);
        if let Some(token) = token {
            cluster = cluster.with_bearer_token(token);
        }
        Ok(Self { cluster })
    }
}

/// Credential bytes from base64 inline data, falling back to a file path
async fn inline_or_file(
    what: &str,
    data: Option<&str>,
    path: Option<&str>,
) -> Result<Option<Vec<u8>>> {
    if let Some(data) = data {
        return decode_base64(data)
            .map(Some)
            .map_err(|e| Error::fetch(format!("invalid {} data: {}", what, e)));
    }
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .map(Some)
            .map_err(|e| Error::fetch(format!("failed to read {} file {}: {}", what, path, e))),
        None => Ok(None),
    }
}

#[async_trait]
impl ClusterFetcher for SingleClusterFetcher {
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        Ok(vec![self.cluster.clone()])
    }
}
