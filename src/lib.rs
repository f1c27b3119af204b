//! Shardex - self-tuning indexer for sharded JSON-RPC blockchains.
//!
//! Every shard gets its own endpoint pool, chain client and SQLite database.
//! Range pipelines ([`etl::BlockIndexer`], [`etl::LogIndexer`]) run inside an
//! adaptive [`etl::SyncLoop`] that sizes its batch from throughput and
//! endpoint health. Token trackers built on [`etl::TokenTracker`] consume the
//! contracts and logs those loops store.
//!
//! ```rust,ignore
//! let shard = shardex::connect_shard(&ShardConfig::new(0, ["https://api.s0.t.hmny.io"]), &options)?;
//! let storage = shardex::open_storage("./data", 0)?;
//! let indexer = BlockIndexer::new(shard.clone(), storage, BlockIndexerConfig::default());
//! SyncLoop::new(indexer, SyncLoopConfig::default()).run().await;
//! ```

pub mod abi;
pub mod etl;
pub mod rpc;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod types;

pub use async_trait::async_trait;
pub use primitive_types::U256;
pub use tokio;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{ensure, Result};

use rpc::{
    ChainClient, ChainClientConfig, EndpointPool, HttpTransport, HttpTransportConfig, Transport,
    WsTransport, WsTransportConfig,
};
use storage::{SqliteStorage, Storage};
use types::ShardId;

const LOG_TARGET: &str = "shardex::main";

/// Wire used to reach a shard's endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Http,
    Ws,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Self::Http),
            "ws" | "wss" | "websocket" => Ok(Self::Ws),
            other => anyhow::bail!("Unknown transport: {other}"),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::Ws => "ws",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub shard: ShardId,
    pub urls: Vec<String>,
}

impl ShardConfig {
    pub fn new<I, S>(shard: ShardId, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shard,
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }
}

/// Transport and client settings shared by every shard.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub transport: TransportKind,
    pub http: HttpTransportConfig,
    pub ws: WsTransportConfig,
    pub client: ChainClientConfig,
}

/// Build the endpoint pool, transport and client of one shard.
pub fn connect_shard(shard: &ShardConfig, options: &ConnectOptions) -> Result<ChainClient> {
    ensure!(!shard.urls.is_empty(), "Shard {} has no endpoints", shard.shard);

    let pool = Arc::new(EndpointPool::new(shard.shard, shard.urls.iter().cloned()));
    let transport: Arc<dyn Transport> = match options.transport {
        TransportKind::Http => Arc::new(HttpTransport::new(pool, options.http.clone())?),
        TransportKind::Ws => Arc::new(WsTransport::new(pool, options.ws.clone())),
    };

    tracing::info!(
        target: LOG_TARGET,
        shard = shard.shard,
        endpoints = shard.urls.len(),
        transport = %options.transport,
        "Connected shard"
    );

    Ok(ChainClient::new(shard.shard, transport, options.client.clone()))
}

/// Open (or create) `<dir>/shard_<n>.db`.
pub fn open_storage(dir: impl AsRef<Path>, shard: ShardId) -> Result<Arc<dyn Storage>> {
    let path = dir.as_ref().join(format!("shard_{shard}.db"));
    Ok(Arc::new(SqliteStorage::open(shard, &path.to_string_lossy())?))
}
