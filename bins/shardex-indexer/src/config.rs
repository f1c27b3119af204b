//! Configuration for the shardex indexer

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use shardex::etl::{BlockIndexerConfig, SyncLoopConfig, DEFAULT_LOG_RANGE_WIDTH};
use shardex::rpc::ChainClientConfig;
use shardex::types::TokenStandard;
use shardex::{ConnectOptions, ShardConfig, TransportKind};
use shardex_common::MetadataResolverConfig;

/// Sharded chain indexer
///
/// Runs one block loop per shard, a log loop on shard 0 and the token
/// trackers fed by it.
///
/// # Examples
///
/// ```bash
/// # Two shards, two endpoints on shard 0
/// shardex-indexer --shard-rpc 0=https://a.s0.example,https://b.s0.example \
///                 --shard-rpc 1=https://a.s1.example
///
/// # Only fungible tokens, over websockets
/// shardex-indexer --shard-rpc 0=wss://ws.s0.example --transport ws --standards erc20
/// ```
#[derive(Parser, Debug)]
#[command(name = "shardex-indexer")]
#[command(about = "Index blocks, logs and tokens of a sharded chain", long_about = None)]
pub struct Config {
    /// Shard endpoints as `<shard>=<url>[,<url>...]`, repeatable
    #[arg(
        long = "shard-rpc",
        env = "SHARDEX_SHARD_RPC",
        value_parser = parse_shard_rpc,
        value_delimiter = ';',
        required = true
    )]
    pub shards: Vec<ShardConfig>,

    /// Wire used to reach the endpoints (http or ws)
    #[arg(long, env = "SHARDEX_TRANSPORT", default_value = "http", value_parser = parse_transport)]
    pub transport: TransportKind,

    /// Directory holding shard_<n>.db and the token databases
    #[arg(long, env = "SHARDEX_DB_DIR", default_value = "./shardex-data")]
    pub db_dir: String,

    /// Pipelines per iteration when a loop starts
    #[arg(long, default_value_t = 10)]
    pub initial_batch_count: usize,

    /// Upper bound on pipelines per iteration
    #[arg(long, default_value_t = 100)]
    pub max_batch_count: usize,

    /// First block ingested by block loops without a cursor
    #[arg(long, default_value_t = 0)]
    pub blocks_initial_height: u64,

    /// First block ingested by the log loop without a cursor
    #[arg(long, default_value_t = 0)]
    pub logs_initial_height: u64,

    /// Blocks per block pipeline
    #[arg(long, default_value_t = 1)]
    pub blocks_range_width: u64,

    /// Blocks per log pipeline
    #[arg(long, default_value_t = DEFAULT_LOG_RANGE_WIDTH)]
    pub logs_range_width: u64,

    /// Wait after a partial or failed iteration, in milliseconds
    #[arg(long, env = "SHARDEX_BLOCK_INTERVAL_MS", default_value_t = 2_000)]
    pub block_interval_ms: u64,

    /// Token standards to track (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "erc20,erc721,erc1155",
        value_parser = parse_standard
    )]
    pub standards: Vec<TokenStandard>,

    /// Addresses whose transactions are never traced (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub ignore_list: Vec<String>,

    /// Blocks whose traces are unavailable (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub trace_deny_list: Vec<u64>,

    /// Gateway used for ipfs:// metadata
    #[arg(long, env = "SHARDEX_IPFS_GATEWAY", default_value = "https://ipfs.io/ipfs")]
    pub ipfs_gateway: String,

    /// Pause between tracker cycles, in milliseconds
    #[arg(long, default_value_t = 2_000)]
    pub tracker_interval_ms: u64,
}

impl Config {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            transport: self.transport,
            client: ChainClientConfig {
                trace_deny_list: self.trace_deny_list.iter().copied().collect(),
            },
            ..Default::default()
        }
    }

    fn sync_loop(&self, initial_height: u64, range_width: u64) -> SyncLoopConfig {
        SyncLoopConfig {
            initial_height,
            range_width,
            initial_batch_count: self.initial_batch_count,
            max_batch_count: self.max_batch_count.max(self.initial_batch_count),
            block_interval: Duration::from_millis(self.block_interval_ms),
            ..Default::default()
        }
    }

    pub fn blocks_loop(&self) -> SyncLoopConfig {
        self.sync_loop(self.blocks_initial_height, self.blocks_range_width)
    }

    pub fn logs_loop(&self) -> SyncLoopConfig {
        self.sync_loop(self.logs_initial_height, self.logs_range_width)
    }

    pub fn block_indexer(&self) -> BlockIndexerConfig {
        BlockIndexerConfig {
            ignore_list: self.ignore_list.iter().cloned().collect::<HashSet<_>>(),
            ..Default::default()
        }
    }

    pub fn metadata_resolver(&self) -> MetadataResolverConfig {
        MetadataResolverConfig {
            ipfs_gateway: self.ipfs_gateway.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    pub fn tracks(&self, standard: TokenStandard) -> bool {
        self.standards.contains(&standard)
    }
}

/// Parse `<shard>=<url>[,<url>...]`.
pub fn parse_shard_rpc(value: &str) -> Result<ShardConfig> {
    let (shard, urls) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("expected <shard>=<url>[,<url>...], got '{value}'"))?;
    let shard = shard
        .trim()
        .parse()
        .map_err(|e| anyhow!("invalid shard id '{shard}': {e}"))?;
    let urls: Vec<&str> = urls
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .collect();
    if urls.is_empty() {
        return Err(anyhow!("shard {shard} has no endpoints"));
    }
    Ok(ShardConfig::new(shard, urls))
}

fn parse_transport(value: &str) -> Result<TransportKind> {
    value.parse()
}

fn parse_standard(value: &str) -> Result<TokenStandard> {
    value.parse()
}
