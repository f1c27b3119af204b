//! Adaptive range sync loop.
//!
//! Each iteration reads the cursor, splits `[cursor + 1, …]` into up to
//! `batch_count` consecutive ranges of `range_width` blocks (capped at the
//! chain head) and runs one pipeline per range concurrently. The cursor only
//! advances over the contiguous prefix of ranges that completed, so a failed
//! range is retried on the next iteration.
//!
//! Scheduling after an iteration:
//! - full range, no new endpoint failures, fast: grow the batch and go again at once
//! - full range otherwise: shrink the batch and go again at once
//! - partial range: shrink the batch and wait one block interval
//! - iteration error: shrink the batch and wait one block interval

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;

use super::address_collector::AddressCollector;
use super::batch_control::BatchControl;
use super::delay::{Delay, TokioDelay};
use crate::rpc::ChainClient;
use crate::storage::Storage;
use crate::types::{IndexerKind, ShardId};

const LOG_TARGET: &str = "shardex::etl::sync";

/// One kind of range pipeline (blocks, logs...).
#[async_trait]
pub trait RangeIndexer: Send + Sync {
    fn kind(&self) -> IndexerKind;

    fn client(&self) -> &ChainClient;

    fn storage(&self) -> &Arc<dyn Storage>;

    /// Ingest the inclusive range `[from, to]`.
    ///
    /// Returns the highest block fully ingested, or `None` when the chain had
    /// nothing for the range yet. Participants go to `collector`.
    async fn index_range(
        &self,
        from: u64,
        to: u64,
        collector: &Mutex<AddressCollector>,
    ) -> Result<Option<u64>>;
}

#[derive(Debug, Clone)]
pub struct SyncLoopConfig {
    /// First block to ingest when no cursor exists.
    pub initial_height: u64,
    /// Blocks per pipeline.
    pub range_width: u64,
    pub initial_batch_count: usize,
    pub max_batch_count: usize,
    /// Wait applied after partial ranges and errors.
    pub block_interval: Duration,
    /// Iterations slower than this never grow the batch.
    pub slow_iteration: Duration,
}

impl Default for SyncLoopConfig {
    fn default() -> Self {
        Self {
            initial_height: 0,
            range_width: 1,
            initial_batch_count: 10,
            max_batch_count: 100,
            block_interval: Duration::from_secs(2),
            slow_iteration: Duration::from_secs(60),
        }
    }
}

/// Outcome of one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationReport {
    pub start_block: u64,
    pub requested_end: u64,
    pub head: u64,
    pub batch_count: usize,
    pub pipelines: usize,
    pub failed_pipelines: usize,
    /// Cursor value after the iteration.
    pub synced_to: Option<u64>,
    pub full_range: bool,
    /// Endpoint failures recorded during the iteration.
    pub failed_delta: u64,
    pub elapsed: Duration,
}

pub struct SyncLoop<I, D = TokioDelay> {
    indexer: I,
    config: SyncLoopConfig,
    batch: BatchControl,
    delay: D,
    chain_id_known: bool,
}

impl<I: RangeIndexer> SyncLoop<I, TokioDelay> {
    pub fn new(indexer: I, config: SyncLoopConfig) -> Self {
        Self::with_delay(indexer, config, TokioDelay)
    }
}

impl<I: RangeIndexer, D: Delay> SyncLoop<I, D> {
    pub fn with_delay(indexer: I, config: SyncLoopConfig, delay: D) -> Self {
        let batch = BatchControl::new(config.initial_batch_count, config.max_batch_count);
        Self {
            indexer,
            config,
            batch,
            delay,
            chain_id_known: false,
        }
    }

    pub fn shard(&self) -> ShardId {
        self.indexer.client().shard()
    }

    pub fn batch_count(&self) -> usize {
        self.batch.current()
    }

    pub fn indexer(&self) -> &I {
        &self.indexer
    }

    /// Run one iteration without scheduling the next one.
    pub async fn run_iteration(&mut self) -> Result<IterationReport> {
        let started = Instant::now();
        let client = self.indexer.client();
        let storage = self.indexer.storage();
        let kind = self.indexer.kind();
        let pool = client.pool().clone();

        pool.reset_in_flight();
        let failed_before = pool.total_failed();

        if !self.chain_id_known {
            let chain_id = client.chain_id().await?;
            storage.set_chain_id(chain_id)?;
            self.chain_id_known = true;
            tracing::info!(
                target: LOG_TARGET,
                shard = client.shard(),
                chain_id,
                "Discovered chain id"
            );
        }

        let state = storage.get_indexer_state(kind)?;
        let start_block = state
            .last_synced_block
            .map_or(self.config.initial_height, |b| b + 1);
        let head = client.block_number().await?;

        let width = self.config.range_width.max(1);
        let batch_count = self.batch.current();
        let requested_end = start_block + width * batch_count as u64 - 1;

        let mut ranges = Vec::with_capacity(batch_count);
        for i in 0..batch_count as u64 {
            let from = start_block + i * width;
            if from > head {
                break;
            }
            ranges.push((from, (from + width - 1).min(head)));
        }

        let collector = Mutex::new(AddressCollector::new());
        let results = join_all(
            ranges
                .iter()
                .map(|&(from, to)| self.indexer.index_range(from, to, &collector)),
        )
        .await;

        let mut highest = None;
        let mut contiguous = true;
        let mut failed_pipelines = 0;
        for (&(from, to), result) in ranges.iter().zip(results) {
            match result {
                Ok(Some(reached)) if contiguous => {
                    highest = Some(reached);
                    contiguous = reached >= to;
                }
                Ok(_) => contiguous = false,
                Err(e) => {
                    failed_pipelines += 1;
                    contiguous = false;
                    tracing::warn!(
                        target: LOG_TARGET,
                        shard = client.shard(),
                        kind = %kind,
                        from,
                        to,
                        error = %e,
                        "Range pipeline failed"
                    );
                }
            }
        }

        let relations = match collector.into_inner() {
            Ok(mut c) => c.drain(),
            Err(poisoned) => poisoned.into_inner().drain(),
        };
        if !relations.is_empty() {
            if let Err(e) = storage.add_address_relations(&relations) {
                tracing::warn!(
                    target: LOG_TARGET,
                    shard = client.shard(),
                    error = %e,
                    "Failed to store address relations"
                );
            }
        }

        let synced_to = match highest {
            Some(block) => Some(storage.set_last_synced_block(kind, block)?),
            None => state.last_synced_block,
        };
        let reached = highest.map(|h| h.min(requested_end));
        let full_range = reached == Some(requested_end);

        Ok(IterationReport {
            start_block,
            requested_end,
            head,
            batch_count,
            pipelines: ranges.len(),
            failed_pipelines,
            synced_to,
            full_range,
            failed_delta: pool.total_failed().saturating_sub(failed_before),
            elapsed: started.elapsed(),
        })
    }

    /// Run one iteration, adjust the batch count and return the wait before the next.
    pub async fn step(&mut self) -> Duration {
        match self.run_iteration().await {
            Ok(report) => {
                let wait = self.schedule(&report);
                tracing::info!(
                    target: LOG_TARGET,
                    shard = self.shard(),
                    kind = %self.indexer.kind(),
                    from = report.start_block,
                    synced_to = ?report.synced_to,
                    head = report.head,
                    pipelines = report.pipelines,
                    failed_pipelines = report.failed_pipelines,
                    failed_requests = report.failed_delta,
                    batch_count = self.batch.current(),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Sync iteration finished"
                );
                wait
            }
            Err(e) => {
                self.batch.decrease();
                tracing::error!(
                    target: LOG_TARGET,
                    shard = self.shard(),
                    kind = %self.indexer.kind(),
                    error = %e,
                    batch_count = self.batch.current(),
                    "Sync iteration failed"
                );
                self.config.block_interval
            }
        }
    }

    fn schedule(&mut self, report: &IterationReport) -> Duration {
        if report.full_range
            && report.failed_delta == 0
            && report.elapsed < self.config.slow_iteration
        {
            self.batch.increase();
            Duration::ZERO
        } else {
            self.batch.decrease();
            if report.full_range {
                Duration::ZERO
            } else {
                self.config.block_interval
            }
        }
    }

    /// One iteration followed by its scheduled wait.
    pub async fn tick(&mut self) {
        let wait = self.step().await;
        if !wait.is_zero() {
            self.delay.sleep(wait).await;
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            target: LOG_TARGET,
            shard = self.shard(),
            kind = %self.indexer.kind(),
            batch_count = self.batch.current(),
            "Starting sync loop"
        );
        loop {
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::delay::RecordingDelay;
    use crate::rpc::ChainClientConfig;
    use crate::storage::SqliteStorage;
    use crate::testing::ScriptedTransport;
    use crate::types::AddressRelationKind;
    use serde_json::json;
    use std::collections::HashSet;

    /// Pipeline that fails for selected starting blocks.
    struct FakeIndexer {
        client: ChainClient,
        storage: Arc<dyn Storage>,
        failing: HashSet<u64>,
        calls: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl RangeIndexer for FakeIndexer {
        fn kind(&self) -> IndexerKind {
            IndexerKind::Blocks
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
            collector: &Mutex<AddressCollector>,
        ) -> Result<Option<u64>> {
            self.calls.lock().unwrap().push((from, to));
            if self.failing.contains(&from) {
                anyhow::bail!("range {from} failed");
            }
            collector.lock().unwrap().add(
                from,
                &format!("0xtx{from}"),
                AddressRelationKind::Transaction,
                ["0xaa"],
            );
            Ok(Some(to))
        }
    }

    fn sync_loop(
        head: u64,
        failing: &[u64],
        config: SyncLoopConfig,
    ) -> (SyncLoop<FakeIndexer, RecordingDelay>, Arc<ScriptedTransport>, RecordingDelay) {
        let transport = Arc::new(
            ScriptedTransport::new(0)
                .with_result("eth_chainId", json!("0x1"))
                .with_result("hmyv2_blockNumber", json!(head)),
        );
        let indexer = FakeIndexer {
            client: ChainClient::new(0, transport.clone(), ChainClientConfig::default()),
            storage: Arc::new(SqliteStorage::in_memory(0).unwrap()),
            failing: failing.iter().copied().collect(),
            calls: Mutex::new(Vec::new()),
        };
        let delay = RecordingDelay::new();
        (SyncLoop::with_delay(indexer, config, delay.clone()), transport, delay)
    }

    fn config(batch: usize, width: u64) -> SyncLoopConfig {
        SyncLoopConfig {
            initial_height: 0,
            range_width: width,
            initial_batch_count: batch,
            max_batch_count: 100,
            block_interval: Duration::from_secs(2),
            slow_iteration: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_full_range_grows_batch_without_waiting() {
        let (mut sync, transport, delay) = sync_loop(1_000, &[], config(10, 1));

        sync.tick().await;

        assert_eq!(sync.batch_count(), 11);
        assert!(delay.recorded().is_empty());
        let state = sync.indexer().storage.get_indexer_state(IndexerKind::Blocks).unwrap();
        assert_eq!(state.last_synced_block, Some(9));
        assert_eq!(state.chain_id, Some(1));
        assert_eq!(
            sync.indexer().storage.get_address_relations(&Default::default()).unwrap().len(),
            10
        );

        sync.tick().await;
        assert_eq!(transport.count("eth_chainId"), 1);
        let state = sync.indexer().storage.get_indexer_state(IndexerKind::Blocks).unwrap();
        assert_eq!(state.last_synced_block, Some(20));
    }

    #[tokio::test]
    async fn test_slow_full_range_shrinks_batch_and_reruns() {
        let config = SyncLoopConfig {
            slow_iteration: Duration::ZERO,
            ..config(10, 1)
        };
        let (mut sync, _, delay) = sync_loop(1_000, &[], config);

        assert_eq!(sync.step().await, Duration::ZERO);
        assert_eq!(sync.batch_count(), 9);
        let state = sync.indexer().storage.get_indexer_state(IndexerKind::Blocks).unwrap();
        assert_eq!(state.last_synced_block, Some(9));

        sync.tick().await;
        assert_eq!(sync.batch_count(), 8);
        assert!(delay.recorded().is_empty());
        let state = sync.indexer().storage.get_indexer_state(IndexerKind::Blocks).unwrap();
        assert_eq!(state.last_synced_block, Some(18));
    }

    #[tokio::test]
    async fn test_failed_range_stops_cursor_at_contiguous_prefix() {
        let (mut sync, _, delay) = sync_loop(1_000, &[4], config(10, 2));

        sync.tick().await;

        let state = sync.indexer().storage.get_indexer_state(IndexerKind::Blocks).unwrap();
        assert_eq!(state.last_synced_block, Some(3));
        assert_eq!(sync.batch_count(), 9);
        assert_eq!(delay.recorded(), vec![Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn test_ranges_capped_at_head() {
        let (mut sync, _, delay) = sync_loop(4, &[], config(10, 1));

        let report = sync.run_iteration().await.unwrap();
        assert_eq!(report.pipelines, 5);
        assert_eq!(report.synced_to, Some(4));
        assert!(!report.full_range);

        let wait = sync.schedule(&report);
        assert_eq!(wait, Duration::from_secs(2));
        assert_eq!(sync.batch_count(), 9);
        assert!(delay.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_head_behind_cursor_waits() {
        let (mut sync, _, delay) = sync_loop(1_000, &[], config(2, 1));
        sync.indexer()
            .storage
            .set_last_synced_block(IndexerKind::Blocks, 1_000)
            .unwrap();

        sync.tick().await;

        assert!(sync.indexer().calls.lock().unwrap().is_empty());
        assert_eq!(delay.recorded(), vec![Duration::from_secs(2)]);
        let state = sync.indexer().storage.get_indexer_state(IndexerKind::Blocks).unwrap();
        assert_eq!(state.last_synced_block, Some(1_000));
    }

    #[tokio::test]
    async fn test_rpc_error_shrinks_batch_and_waits() {
        let (mut sync, transport, delay) = sync_loop(1_000, &[], config(10, 1));
        transport.set_handler("hmyv2_blockNumber", |_| {
            Err(crate::rpc::RpcError::transport("scripted://shard-0", "connection refused"))
        });

        sync.tick().await;

        assert_eq!(sync.batch_count(), 9);
        assert_eq!(delay.recorded(), vec![Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn test_endpoint_failures_shrink_full_range_without_waiting() {
        let (mut sync, _, delay) = sync_loop(1_000, &[], config(10, 1));
        let report = IterationReport {
            start_block: 0,
            requested_end: 9,
            head: 1_000,
            batch_count: 10,
            pipelines: 10,
            failed_pipelines: 0,
            synced_to: Some(9),
            full_range: true,
            failed_delta: 3,
            elapsed: Duration::from_millis(5),
        };
        assert_eq!(sync.schedule(&report), Duration::ZERO);
        assert_eq!(sync.batch_count(), 9);

        let slow = IterationReport {
            failed_delta: 0,
            elapsed: Duration::from_secs(61),
            ..report
        };
        assert_eq!(sync.schedule(&slow), Duration::ZERO);
        assert_eq!(sync.batch_count(), 8);
        assert!(delay.recorded().is_empty());
    }
}
