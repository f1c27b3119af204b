//! Log range pipeline. Logs are global on the chain, so only one shard runs it.

use std::sync::{Arc, Mutex};

use anyhow::{ensure, Result};
use async_trait::async_trait;

use super::address_collector::AddressCollector;
use super::sync_loop::RangeIndexer;
use crate::rpc::{ChainClient, LogFilter};
use crate::storage::Storage;
use crate::types::{IndexerKind, ShardId};

const LOG_TARGET: &str = "shardex::etl::logs";

/// The shard whose endpoints serve `eth_getLogs`.
pub const LOG_SHARD: ShardId = 0;

/// Blocks per `eth_getLogs` request.
pub const DEFAULT_LOG_RANGE_WIDTH: u64 = 10;

pub struct LogIndexer {
    client: ChainClient,
    storage: Arc<dyn Storage>,
}

impl LogIndexer {
    pub fn new(client: ChainClient, storage: Arc<dyn Storage>) -> Result<Self> {
        ensure!(
            client.shard() == LOG_SHARD,
            "Log indexer runs on shard {LOG_SHARD} only, got shard {}",
            client.shard()
        );
        Ok(Self { client, storage })
    }
}

#[async_trait]
impl RangeIndexer for LogIndexer {
    fn kind(&self) -> IndexerKind {
        IndexerKind::Logs
    }

    fn client(&self) -> &ChainClient {
        &self.client
    }

    fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn index_range(
        &self,
        from: u64,
        to: u64,
        _collector: &Mutex<AddressCollector>,
    ) -> Result<Option<u64>> {
        let logs = self
            .client
            .get_logs(&LogFilter {
                from_block: from,
                to_block: to,
                ..Default::default()
            })
            .await?;
        let added = self.storage.add_logs(&logs)?;

        tracing::trace!(
            target: LOG_TARGET,
            from,
            to,
            logs = logs.len(),
            added,
            "Indexed log range"
        );

        Ok(Some(to))
    }
}
