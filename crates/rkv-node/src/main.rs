use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::sync::mpsc;

use rkv_consensus::LocalLog;
use rkv_server::{serve_client, KvReplica, ReplicaConfig};
use rkv_storage::fjall::{FjallLogStorage, FjallStore};
use rkv_storage::BincodeCodec;

#[derive(clap::Parser, Debug)]
#[command(name = "rkv-node", about = "Replicated linearizable KV node")]
struct Cli {
    #[arg(long)]
    node_id: u64,
    #[arg(long, default_value = "0.0.0.0:17000")]
    client_addr: String,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `storage.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    request_timeout_ms: u64,
    leadership_check_ms: u64,
    max_raft_state_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    server: ServerConfig,
    storage: StorageConfig,
    observability: ObservabilityConfig,
}

impl TryFrom<&ServerConfig> for ReplicaConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: &ServerConfig) -> anyhow::Result<Self> {
        if cfg.request_timeout_ms == 0 {
            anyhow::bail!("server.request_timeout_ms must be greater than zero");
        }
        if cfg.leadership_check_ms == 0 {
            anyhow::bail!("server.leadership_check_ms must be greater than zero");
        }
        Ok(ReplicaConfig {
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            leadership_check: Duration::from_millis(cfg.leadership_check_ms),
            max_raft_state: (cfg.max_raft_state_bytes > 0).then_some(cfg.max_raft_state_bytes),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("REPLIKV_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let data_dir = cli.data_dir.unwrap_or(config.storage.data_dir);
    tracing::info!(
        node_id = cli.node_id,
        client_addr = %cli.client_addr,
        data_dir = %data_dir.display(),
        "node starting"
    );

    let replica_config =
        ReplicaConfig::try_from(&config.server).context("invalid [server] configuration")?;

    let client_addr: SocketAddr = cli
        .client_addr
        .parse()
        .with_context(|| format!("invalid client_addr: {}", cli.client_addr))?;

    let store = FjallStore::open(&data_dir)
        .with_context(|| format!("failed to open storage at {}", data_dir.display()))?;
    let (apply_tx, apply_rx) = mpsc::unbounded_channel();
    let log = LocalLog::open(Arc::new(FjallLogStorage(store)), apply_tx)
        .await
        .context("failed to open command log")?;
    let replica = KvReplica::start(
        Arc::new(log),
        apply_rx,
        replica_config,
        Arc::new(BincodeCodec),
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    };
    let served = serve_client(client_addr, replica.clone(), cli.node_id, shutdown).await;
    replica.shutdown().await;
    served
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(request_timeout_ms: u64, leadership_check_ms: u64, max: usize) -> ServerConfig {
        ServerConfig { request_timeout_ms, leadership_check_ms, max_raft_state_bytes: max }
    }

    #[test]
    fn default_config_converts() {
        let config: Config = Figment::new()
            .merge(Toml::string(include_str!("../../../config/default.toml")))
            .extract()
            .unwrap();
        let replica = ReplicaConfig::try_from(&config.server).unwrap();
        assert_eq!(replica.request_timeout, Duration::from_millis(800));
        assert_eq!(replica.leadership_check, Duration::from_millis(50));
        assert_eq!(replica.max_raft_state, Some(1_048_576));
    }

    #[test]
    fn zero_snapshot_threshold_disables_snapshots() {
        let replica = ReplicaConfig::try_from(&server(500, 20, 0)).unwrap();
        assert_eq!(replica.max_raft_state, None);
    }

    #[test]
    fn zero_durations_are_rejected() {
        let err = ReplicaConfig::try_from(&server(500, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("leadership_check_ms"));
        let err = ReplicaConfig::try_from(&server(0, 20, 0)).unwrap_err();
        assert!(err.to_string().contains("request_timeout_ms"));
    }
}
