//! GitOps server - hosts the multi-cluster clients factory

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use gitops_core::telemetry::{init_logging, LogConfig};
use gitops_core::{
    ClientSettings, ClientsFactory, ClusterFetcher, FactoryConfig, FileClusterFetcher,
    SingleClusterFetcher,
};

/// GitOps server - manages clients for every downstream cluster
#[derive(Parser, Debug)]
#[command(name = "gitops-server", version, about, long_about = None)]
struct Cli {
    /// YAML file listing the clusters to manage; the local cluster is used when unset
    #[arg(long, env = "GITOPS_CLUSTERS_FILE")]
    clusters_file: Option<PathBuf>,

    /// Seconds between cluster list and namespace inventory refreshes
    #[arg(long, env = "GITOPS_POLL_INTERVAL_SECS", default_value_t = 30)]
    poll_interval_secs: u64,

    /// Seconds a user's accessible namespaces stay cached
    #[arg(long, env = "GITOPS_USER_NAMESPACE_TTL_SECS", default_value_t = 30)]
    user_namespace_ttl_secs: u64,

    /// Probe clusters for API Priority & Fairness before applying client-side limits
    #[arg(long, env = "GITOPS_FLOW_CONTROL", default_value_t = true, action = clap::ArgAction::Set)]
    flow_control: bool,

    /// Emit JSON logs
    #[arg(long, env = "GITOPS_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn factory_config(&self) -> FactoryConfig {
        let poll = Duration::from_secs(self.poll_interval_secs);
        FactoryConfig {
            clusters_poll_interval: poll,
            namespaces_poll_interval: poll,
            user_namespace_ttl: Duration::from_secs(self.user_namespace_ttl_secs),
            client: ClientSettings {
                flow_control: self.flow_control,
                ..Default::default()
            },
        }
    }

    async fn fetcher(&self) -> anyhow::Result<Arc<dyn ClusterFetcher>> {
        let fetcher: Arc<dyn ClusterFetcher> = match &self.clusters_file {
            Some(path) => {
                info!(path = %path.display(), "Reading clusters from file");
                Arc::new(FileClusterFetcher::new(path))
            }
            None => {
                info!("Managing the local cluster only");
                Arc::new(SingleClusterFetcher::infer().await?)
            }
        };
        Ok(fetcher)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    init_logging(LogConfig {
        json: cli.log_json,
        ..Default::default()
    })?;

    let factory = Arc::new(ClientsFactory::with_kube(
        cli.fetcher().await?,
        cli.factory_config(),
    ));
    factory.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    factory.stop().await;

    Ok(())
}
