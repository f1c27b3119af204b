//! Shardex indexer
//!
//! Runs the ingestion pipeline of a sharded chain:
//!
//! - one block loop per configured shard
//! - one log loop on shard 0
//! - token trackers (ERC20, ERC721, ERC1155) fed from shard 0's stored logs
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=shardex=debug shardex-indexer --shard-rpc 0=https://api.s0.t.hmny.io
//! ```

mod config;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use shardex::etl::{
    BlockIndexer, LogIndexer, SyncLoop, TokenTracker, TrackerRunner, TrackerRunnerConfig,
    LOG_SHARD,
};
use shardex::rpc::ChainClient;
use shardex::types::TokenStandard;
use shardex_common::MetadataResolver;
use shardex_erc1155::{Erc1155Storage, Erc1155Tracker, Erc1155TrackerConfig};
use shardex_erc20::{Erc20Storage, Erc20Tracker, Erc20TrackerConfig};
use shardex_erc721::{Erc721Storage, Erc721Tracker, Erc721TrackerConfig};
use tokio::task::JoinSet;

const LOG_TARGET: &str = "shardex_indexer";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    tracing::info!(target: LOG_TARGET, "Starting shardex indexer");
    tracing::info!(target: LOG_TARGET, "Transport: {}", config.transport);
    tracing::info!(target: LOG_TARGET, "Database directory: {}", config.db_dir);

    std::fs::create_dir_all(&config.db_dir)
        .with_context(|| format!("Failed to create {}", config.db_dir))?;

    let options = config.connect_options();
    let mut tasks = JoinSet::new();
    let mut log_shard = None;

    for shard in &config.shards {
        let client = shardex::connect_shard(shard, &options)?;
        let storage = shardex::open_storage(&config.db_dir, shard.shard)?;

        let blocks = BlockIndexer::new(client.clone(), storage.clone(), config.block_indexer());
        tasks.spawn(SyncLoop::new(blocks, config.blocks_loop()).run());

        if shard.shard == LOG_SHARD {
            let logs = LogIndexer::new(client.clone(), storage.clone())?;
            tasks.spawn(SyncLoop::new(logs, config.logs_loop()).run());
            log_shard = Some((client, storage));
        }
    }

    match log_shard {
        Some((client, storage)) => {
            let trackers = build_trackers(&config, &client)?;
            if trackers.is_empty() {
                tracing::info!(target: LOG_TARGET, "No token standards enabled");
            } else {
                let runner = TrackerRunner::new(
                    storage,
                    trackers,
                    TrackerRunnerConfig {
                        interval: Duration::from_millis(config.tracker_interval_ms),
                        ..Default::default()
                    },
                );
                tasks.spawn(runner.run());
            }
        }
        None => tracing::warn!(
            target: LOG_TARGET,
            "Shard {LOG_SHARD} not configured, logs and token trackers are disabled"
        ),
    }

    tracing::info!(target: LOG_TARGET, tasks = tasks.len(), "Indexer running, press Ctrl+C to stop");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            tracing::info!(target: LOG_TARGET, "Shutting down");
        }
        Some(joined) = tasks.join_next() => {
            if let Err(e) = joined {
                tracing::error!(target: LOG_TARGET, error = %e, "Indexer task aborted");
            }
        }
    }

    tasks.shutdown().await;
    Ok(())
}

fn build_trackers(config: &Config, client: &ChainClient) -> Result<Vec<Arc<dyn TokenTracker>>> {
    let db_dir = Path::new(&config.db_dir);
    let db_path = |name: &str| db_dir.join(name).to_string_lossy().into_owned();
    let mut trackers: Vec<Arc<dyn TokenTracker>> = Vec::new();

    if config.tracks(TokenStandard::Erc20) {
        let storage = Arc::new(Erc20Storage::new(&db_path("erc20.db"))?);
        trackers.push(Arc::new(Erc20Tracker::new(
            storage,
            client.clone(),
            Erc20TrackerConfig::default(),
        )?));
    }

    if config.tracks(TokenStandard::Erc721) {
        let storage = Arc::new(Erc721Storage::new(&db_path("erc721.db"))?);
        trackers.push(Arc::new(Erc721Tracker::new(
            storage,
            client.clone(),
            MetadataResolver::new(config.metadata_resolver())?,
            Erc721TrackerConfig::default(),
        )?));
    }

    if config.tracks(TokenStandard::Erc1155) {
        let storage = Arc::new(Erc1155Storage::new(&db_path("erc1155.db"))?);
        trackers.push(Arc::new(Erc1155Tracker::new(
            storage,
            client.clone(),
            MetadataResolver::new(config.metadata_resolver())?,
            Erc1155TrackerConfig::default(),
        )?));
    }

    for tracker in &trackers {
        tracing::info!(target: LOG_TARGET, standard = %tracker.standard(), "Tracker enabled");
    }
    Ok(trackers)
}
