use anyhow::{bail, Context};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use votechain_core::{logging, Config};
use votechain_ledger::{AdminSet, ChainClient, LocalChainClient, VotingContract};
use votechain_mirror::MirrorStore;
use votechain_sync::ElectionService;

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;
const CONFIG_ENV: &str = "VOTECHAIN_CONFIG";

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args, std::env::var(CONFIG_ENV).ok())?;
    let config = match &config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default_config(),
    };

    logging::init_from_config(&config.logging);
    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => warn!("No configuration given, using defaults"),
    }

    let service = open_service(&config)?;

    let status = service.chain_status().await?;
    info!(
        chain_id = %status.chain_id,
        latest_block = status.latest_block,
        account = %status.account,
        routing = ?config.sync.routing,
        "Votechain node started"
    );

    if args.iter().any(|arg| arg == "--status") {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    run(service, config.sync.reconcile_interval_secs).await;
    info!("Votechain node stopped");
    Ok(())
}

fn open_service(config: &Config) -> anyhow::Result<ElectionService> {
    let store = MirrorStore::open(
        &config.mirror.path,
        Duration::from_millis(config.mirror.busy_timeout_ms),
    )
    .with_context(|| format!("opening mirror at {}", config.mirror.path.display()))?;

    let policy = AdminSet::new(config.ledger.owner.clone(), config.ledger.admins.iter().cloned());
    let contract = VotingContract::open(&config.ledger.path, Arc::new(policy))
        .with_context(|| format!("opening contract host at {}", config.ledger.path.display()))?;

    let chain: Arc<dyn ChainClient> = Arc::new(LocalChainClient::new(contract, config.ledger.owner.clone()));
    Ok(ElectionService::new(store, chain, config))
}

/// Reconcile synced elections periodically until interrupted.
async fn run(service: ElectionService, interval_secs: u64) {
    if interval_secs == 0 {
        info!("Background reconciliation disabled");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => reconcile_pass(&service).await,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown requested");
                return;
            }
        }
    }
}

async fn reconcile_pass(service: &ElectionService) {
    let outcomes = match service.reconcile_all().await {
        Ok(outcomes) => outcomes,
        Err(e) => {
            error!(error = %e, "Could not list synced elections");
            return;
        }
    };

    for (election_id, outcome) in outcomes {
        match outcome {
            Ok(report) if !report.is_consistent() => warn!(
                election_id = %election_id,
                divergences = report.divergences.len(),
                unsynced_candidates = report.unsynced_candidates.len(),
                mirror_active = report.mirror_active,
                ledger_active = report.ledger_active,
                "Mirror and ledger differ"
            ),
            Ok(_) => {}
            Err(e) => error!(election_id = %election_id, kind = ?e.kind(), error = %e, "Reconciliation failed"),
        }
    }
}

/// `--config <path>` wins over the environment; neither means defaults.
fn parse_config_path(args: &[String], from_env: Option<String>) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(Some(PathBuf::from(path)));
            }
            bail!("--config was provided without a path");
        }
    }

    Ok(from_env.filter(|p| !p.trim().is_empty()).map(PathBuf::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_config_flag_wins_over_env() {
        let path = parse_config_path(
            &args(&["votechain-node", "--config", "/etc/votechain.toml"]),
            Some("/tmp/other.toml".into()),
        )
        .unwrap();
        assert_eq!(path, Some(PathBuf::from("/etc/votechain.toml")));
    }

    #[test]
    fn test_env_used_without_flag() {
        let path = parse_config_path(&args(&["votechain-node"]), Some("/tmp/env.toml".into())).unwrap();
        assert_eq!(path, Some(PathBuf::from("/tmp/env.toml")));
        assert_eq!(parse_config_path(&args(&["votechain-node"]), None).unwrap(), None);
    }

    #[test]
    fn test_config_flag_without_path() {
        assert!(parse_config_path(&args(&["votechain-node", "--config"]), None).is_err());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = Config::from_toml_str(include_str!("../votechain.example.toml")).unwrap();
        assert_eq!(config.ledger.owner, "authority");
        assert_eq!(config.sync.reconcile_interval_secs, 60);
    }

    #[tokio::test]
    async fn test_open_service_and_reconcile_pass() {
        let dir = std::env::temp_dir().join(format!("test_node_{}", uuid::Uuid::new_v4()));
        let mut config = Config::default_config();
        config.mirror.path = dir.join("mirror.db");
        config.ledger.path = dir.join("ledger.db");

        let service = open_service(&config).unwrap();
        let election = service.create_election("Node Smoke Election").unwrap();
        service.add_candidate(&election.id, "Alice", "Green").unwrap();
        service.sync_election(&election.id).await.unwrap();

        reconcile_pass(&service).await;
        assert!(service.sync_state(&election.id).unwrap().last_reconciled_at.is_some());

        drop(service);
        std::fs::remove_dir_all(&dir).ok();
    }
}
