//! Factory settings and per-cluster client configuration
//!
//! [`ClusterConfig`] is the resolved connection configuration for one cluster
//! and one identity. It is built by one of two credential rules:
//!
//! - [`ClusterConfig::as_server`]: the cluster's own service bearer token.
//! - [`ClusterConfig::with_user`]: the user's delegated token when present,
//!   otherwise the service token plus `Impersonate-User`/`Impersonate-Group`
//!   so the cluster authorizes the request as that user.
//!
//! Both rules validate everything they can before any network call is made.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::config::AuthInfo;
use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::cluster::{Cluster, TlsConfig};
use crate::error::{Error, Result};
use crate::principal::UserPrincipal;

// ============================================================================
// Defaults
// ============================================================================

/// Client-side QPS when the cluster does not arbitrate with flow control
pub const CLIENT_QPS: f32 = 1000.0;

/// Client-side burst when the cluster does not arbitrate with flow control
pub const CLIENT_BURST: i32 = 2000;

/// Read timeout for cluster API requests
pub const KUBE_CLIENT_TIMEOUT: Duration = Duration::from_secs(8);

/// Connect timeout for cluster API requests
pub const KUBE_CLIENT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the cluster list is refreshed
pub const WATCH_CLUSTERS_FREQUENCY: Duration = Duration::from_secs(30);

/// How often the per-cluster namespace inventory is refreshed
pub const WATCH_NAMESPACES_FREQUENCY: Duration = Duration::from_secs(30);

/// How long a user's accessible namespaces stay cached
pub const USER_NAMESPACE_TTL: Duration = Duration::from_secs(30);

// ============================================================================
// Settings
// ============================================================================

/// Settings applied to every per-cluster client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    /// Client-side queries per second
    pub qps: f32,
    /// Client-side burst
    pub burst: i32,
    /// Read timeout for API requests
    pub timeout: Duration,
    /// Connect timeout for API requests
    pub connect_timeout: Duration,
    /// Probe each cluster for API Priority & Fairness before building a client
    pub flow_control: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            qps: CLIENT_QPS,
            burst: CLIENT_BURST,
            timeout: KUBE_CLIENT_TIMEOUT,
            connect_timeout: KUBE_CLIENT_DIAL_TIMEOUT,
            flow_control: true,
        }
    }
}

/// Settings of a [`ClientsFactory`](crate::ClientsFactory)
#[derive(Debug, Clone, PartialEq)]
pub struct FactoryConfig {
    /// Interval between cluster list refreshes
    pub clusters_poll_interval: Duration,
    /// Interval between namespace inventory refreshes
    pub namespaces_poll_interval: Duration,
    /// Lifetime of a cached user namespace view
    pub user_namespace_ttl: Duration,
    /// Per-cluster client settings
    pub client: ClientSettings,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            clusters_poll_interval: WATCH_CLUSTERS_FREQUENCY,
            namespaces_poll_interval: WATCH_NAMESPACES_FREQUENCY,
            user_namespace_ttl: USER_NAMESPACE_TTL,
            client: ClientSettings::default(),
        }
    }
}

// ============================================================================
// ClusterConfig
// ============================================================================

/// Identity a cluster API server is asked to act as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Impersonation {
    /// Value of `Impersonate-User`
    pub user: String,
    /// Values of `Impersonate-Group`
    pub groups: Vec<String>,
}

/// Resolved connection configuration for one cluster and one identity
#[derive(Clone)]
pub struct ClusterConfig {
    /// Cluster this configuration targets
    pub cluster_name: String,
    /// API server address
    pub host: String,
    /// TLS settings
    pub tls: TlsConfig,
    /// Impersonated identity, if the service token acts on a user's behalf
    pub impersonate: Option<Impersonation>,
    /// Client-side QPS; negative means the server arbitrates
    pub qps: f32,
    /// Client-side burst; negative means the server arbitrates
    pub burst: i32,
    /// Read timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    bearer_token: Option<Zeroizing<String>>,
}

impl ClusterConfig {
    /// Base configuration for a cluster, without any credential
    pub fn for_cluster(cluster: &Cluster, settings: &ClientSettings) -> Self {
        Self {
            cluster_name: cluster.name.clone(),
            host: cluster.server.clone(),
            tls: cluster.tls.clone(),
            impersonate: None,
            qps: settings.qps,
            burst: settings.burst,
            timeout: settings.timeout,
            connect_timeout: settings.connect_timeout,
            bearer_token: None,
        }
    }

    /// Configuration acting as the server's own service identity
    pub fn as_server(cluster: &Cluster, settings: &ClientSettings) -> Result<Self> {
        let mut config = Self::for_cluster(cluster, settings);
        config.bearer_token = cluster.bearer_token.clone();
        config.validate()?;
        Ok(config)
    }

    /// Configuration acting as `user`
    pub fn with_user(
        cluster: &Cluster,
        user: &UserPrincipal,
        settings: &ClientSettings,
    ) -> Result<Self> {
        if !user.is_valid() {
            return Err(Error::config_for(
                &cluster.name,
                "no user ID or token found in user principal",
            ));
        }

        let mut config = Self::for_cluster(cluster, settings);
        match user.token() {
            Some(token) => {
                config.bearer_token = Some(Zeroizing::new(token.to_string()));
                config.tls.cert_data = None;
                config.tls.key_data = None;
            }
            None => {
                config.bearer_token = cluster.bearer_token.clone();
                config.impersonate = Some(Impersonation {
                    user: user.id.clone(),
                    groups: user.groups.clone(),
                });
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Bearer token sent with every request
    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_ref().map(|t| t.as_str())
    }

    /// Let the server's flow control arbitrate instead of limiting client side
    pub fn use_server_flow_control(&mut self) {
        self.qps = -1.0;
        self.burst = -1;
    }

    /// Apply fixed client-side limits
    pub fn use_client_limits(&mut self, qps: f32, burst: i32) {
        self.qps = qps;
        self.burst = burst;
    }

    /// Client-side rate limit as `(requests, per period)`, `None` when unbounded.
    ///
    /// A burst of `burst` requests refills over `burst / qps` seconds. A
    /// period that is zero or does not fit a [`Duration`] counts as unbounded.
    pub fn rate_limit(&self) -> Option<(u64, Duration)> {
        if self.qps.is_nan() || self.qps <= 0.0 || self.burst <= 0 {
            return None;
        }
        let per = Duration::try_from_secs_f64(self.burst as f64 / self.qps as f64)
            .ok()
            .filter(|per| !per.is_zero())?;
        Some((self.burst as u64, per))
    }

    /// Check host, CA data and client identity without touching the network
    fn validate(&self) -> Result<()> {
        self.cluster_url()?;
        self.root_certs()?;
        if self.tls.cert_data.is_some() != self.tls.key_data.is_some() {
            return Err(Error::config_for(
                &self.cluster_name,
                "client certificate and key must be set together",
            ));
        }
        Ok(())
    }

    fn cluster_url(&self) -> Result<http::Uri> {
        if self.host.is_empty() {
            return Err(Error::config_for(
                &self.cluster_name,
                "cluster has no server address",
            ));
        }
        self.host.parse::<http::Uri>().map_err(|e| {
            Error::config_for(
                &self.cluster_name,
                format!("invalid server address {}: {}", self.host, e),
            )
        })
    }

    fn root_certs(&self) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(data) = &self.tls.ca_data else {
            return Ok(None);
        };
        let certs = pem::parse_many(data).map_err(|e| {
            Error::config_for(&self.cluster_name, format!("invalid CA data: {}", e))
        })?;
        if certs.is_empty() {
            return Err(Error::config_for(
                &self.cluster_name,
                "CA data contains no PEM certificates",
            ));
        }
        Ok(Some(certs.into_iter().map(|c| c.into_contents()).collect()))
    }

    /// Convert into a kube-rs client configuration
    pub fn to_kube_config(&self) -> Result<kube::Config> {
        let mut config = kube::Config::new(self.cluster_url()?);
        config.root_cert = self.root_certs()?;
        config.accept_invalid_certs = self.tls.insecure;
        config.tls_server_name = self.tls.server_name.clone();
        config.connect_timeout = Some(self.connect_timeout);
        config.read_timeout = Some(self.timeout);
        config.auth_info = AuthInfo {
            token: self
                .bearer_token
                .as_ref()
                .map(|t| SecretString::from(t.to_string())),
            impersonate: self.impersonate.as_ref().map(|i| i.user.clone()),
            impersonate_groups: self
                .impersonate
                .as_ref()
                .filter(|i| !i.groups.is_empty())
                .map(|i| i.groups.clone()),
            client_certificate_data: self.tls.cert_data.as_ref().map(|c| BASE64.encode(c)),
            client_key_data: self
                .tls
                .key_data
                .as_ref()
                .map(|k| SecretString::from(BASE64.encode(k.as_slice()))),
            ..Default::default()
        };
        Ok(config)
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("cluster_name", &self.cluster_name)
            .field("host", &self.host)
            .field("tls", &self.tls)
            .field("impersonate", &self.impersonate)
            .field("qps", &self.qps)
            .field("burst", &self.burst)
            .field(
                "bearer_token",
                &self.bearer_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn cluster() -> Cluster {
        Cluster::new("east", "https://east.example.com:6443").with_bearer_token("service-token")
    }

    #[test]
    fn user_token_is_used_verbatim() {
        let user = UserPrincipal::new("alice", vec!["dev".into()]).with_token("oidc-token");
        let config = ClusterConfig::with_user(&cluster(), &user, &ClientSettings::default())
            .expect("config should resolve");

        assert_eq!(config.bearer_token(), Some("oidc-token"));
        assert!(config.impersonate.is_none());

        let kube = config.to_kube_config().unwrap();
        assert!(kube.auth_info.impersonate.is_none());
        assert!(kube.auth_info.impersonate_groups.is_none());
    }

    #[test]
    fn missing_user_token_falls_back_to_impersonation() {
        let user = UserPrincipal::new("alice", vec!["dev".into(), "ops".into()]);
        let config = ClusterConfig::with_user(&cluster(), &user, &ClientSettings::default())
            .expect("config should resolve");

        assert_eq!(config.bearer_token(), Some("service-token"));

        let kube = config.to_kube_config().unwrap();
        assert_eq!(kube.auth_info.impersonate.as_deref(), Some("alice"));
        assert_eq!(
            kube.auth_info.impersonate_groups,
            Some(vec!["dev".to_string(), "ops".to_string()])
        );
    }

    #[test]
    fn invalid_user_is_a_configuration_error() {
        let err = ClusterConfig::with_user(
            &cluster(),
            &UserPrincipal::default(),
            &ClientSettings::default(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Config { .. }));
        assert_eq!(err.cluster(), Some("east"));
    }

    #[test]
    fn server_config_uses_service_token() {
        let config = ClusterConfig::as_server(&cluster(), &ClientSettings::default()).unwrap();
        assert_eq!(config.bearer_token(), Some("service-token"));
        assert!(config.impersonate.is_none());
        assert_eq!(config.qps, CLIENT_QPS);
        assert_eq!(config.burst, CLIENT_BURST);
    }

    #[test]
    fn malformed_server_address_fails_before_network() {
        let bad = Cluster::new("bad", "");
        assert!(matches!(
            ClusterConfig::as_server(&bad, &ClientSettings::default()),
            Err(Error::Config { .. })
        ));

        let bad = Cluster::new("bad", "not a url");
        assert!(ClusterConfig::as_server(&bad, &ClientSettings::default()).is_err());
    }

    #[test]
    fn malformed_ca_data_fails_before_network() {
        let bad = cluster().with_tls(TlsConfig {
            ca_data: Some(b"not a certificate".to_vec()),
            ..Default::default()
        });
        let err = ClusterConfig::as_server(&bad, &ClientSettings::default()).unwrap_err();
        assert!(err.to_string().contains("CA data"));
    }

    #[test]
    fn rate_limit_follows_qps_and_burst() {
        let mut config = ClusterConfig::as_server(&cluster(), &ClientSettings::default()).unwrap();
        assert_eq!(config.rate_limit(), Some((2000, Duration::from_secs(2))));

        config.use_server_flow_control();
        assert_eq!(config.qps, -1.0);
        assert_eq!(config.burst, -1);
        assert_eq!(config.rate_limit(), None);

        config.use_client_limits(10.0, 5);
        assert_eq!(config.rate_limit(), Some((5, Duration::from_millis(500))));
    }

    #[test]
    fn degenerate_limits_are_unbounded() {
        let mut config = ClusterConfig::as_server(&cluster(), &ClientSettings::default()).unwrap();

        config.use_client_limits(f32::MIN_POSITIVE, 2000);
        assert_eq!(config.rate_limit(), None);

        config.use_client_limits(f32::NAN, 2000);
        assert_eq!(config.rate_limit(), None);

        config.use_client_limits(f32::INFINITY, 2000);
        assert_eq!(config.rate_limit(), None);

        config.use_client_limits(1000.0, 0);
        assert_eq!(config.rate_limit(), None);
    }

    fn cert_cluster() -> Cluster {
        Cluster::new("kind", "https://127.0.0.1:6443").with_tls(TlsConfig {
            cert_data: Some(b"client-cert-pem".to_vec()),
            key_data: Some(Zeroizing::new(b"client-key-pem".to_vec())),
            ..Default::default()
        })
    }

    #[test]
    fn client_certificate_reaches_kube_config() {
        let config = ClusterConfig::as_server(&cert_cluster(), &ClientSettings::default())
            .unwrap()
            .to_kube_config()
            .unwrap();

        assert!(config.auth_info.token.is_none());
        assert_eq!(
            config.auth_info.client_certificate_data,
            Some(BASE64.encode("client-cert-pem"))
        );
        assert_eq!(
            config
                .auth_info
                .client_key_data
                .as_ref()
                .map(|k| k.expose_secret().to_string()),
            Some(BASE64.encode("client-key-pem"))
        );
    }

    #[test]
    fn impersonation_keeps_client_certificate_and_user_token_drops_it() {
        let alice = UserPrincipal::new("alice", vec![]);
        let config = ClusterConfig::with_user(&cert_cluster(), &alice, &ClientSettings::default())
            .unwrap();
        assert!(config.tls.has_client_identity());
        assert!(config.impersonate.is_some());

        let delegated = alice.with_token("oidc-token");
        let config =
            ClusterConfig::with_user(&cert_cluster(), &delegated, &ClientSettings::default())
                .unwrap()
                .to_kube_config()
                .unwrap();
        assert!(config.auth_info.client_certificate_data.is_none());
        assert!(config.auth_info.client_key_data.is_none());
    }

    #[test]
    fn client_certificate_without_key_is_rejected() {
        let half = Cluster::new("kind", "https://127.0.0.1:6443").with_tls(TlsConfig {
            cert_data: Some(b"client-cert-pem".to_vec()),
            ..Default::default()
        });
        let err = ClusterConfig::as_server(&half, &ClientSettings::default()).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn kube_config_carries_credentials_and_timeouts() {
        let user = UserPrincipal::new("alice", vec!["dev".into()]);
        let config = ClusterConfig::with_user(&cluster(), &user, &ClientSettings::default())
            .unwrap()
            .to_kube_config()
            .unwrap();

        assert_eq!(config.cluster_url.host(), Some("east.example.com"));
        assert_eq!(config.read_timeout, Some(KUBE_CLIENT_TIMEOUT));
        assert_eq!(config.connect_timeout, Some(KUBE_CLIENT_DIAL_TIMEOUT));
        assert_eq!(config.auth_info.impersonate.as_deref(), Some("alice"));
        assert_eq!(
            config.auth_info.impersonate_groups,
            Some(vec!["dev".to_string()])
        );
        assert_eq!(
            config
                .auth_info
                .token
                .as_ref()
                .map(|t| t.expose_secret().to_string()),
            Some("service-token".to_string())
        );
    }

    #[test]
    fn debug_redacts_token() {
        let config = ClusterConfig::as_server(&cluster(), &ClientSettings::default()).unwrap();
        assert!(!format!("{:?}", config).contains("service-token"));
    }
}
