use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::{ReconcileReport, TokenTracker, LOG_TARGET};
use crate::etl::delay::{Delay, TokioDelay};
use crate::storage::{Comparator, Filter, OrderDirection, Storage};
use crate::types::{IndexerKind, TokenStandard};

#[derive(Debug, Clone)]
pub struct TrackerRunnerConfig {
    /// Discovered contracts classified per page.
    pub contract_page_size: usize,
    /// Blocks of stored logs replayed per token step.
    pub log_window: u64,
    /// Pause between cycles.
    pub interval: Duration,
}

impl Default for TrackerRunnerConfig {
    fn default() -> Self {
        Self {
            contract_page_size: 100,
            log_window: 1_000,
            interval: Duration::from_secs(2),
        }
    }
}

/// What one cycle did for one tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerCycle {
    pub standard: TokenStandard,
    pub registered: usize,
    pub events: usize,
    pub reconciled: ReconcileReport,
}

/// Drives token trackers over the contracts and logs stored by the sync loops.
pub struct TrackerRunner<D = TokioDelay> {
    storage: Arc<dyn Storage>,
    trackers: Vec<Arc<dyn TokenTracker>>,
    config: TrackerRunnerConfig,
    delay: D,
}

impl TrackerRunner<TokioDelay> {
    pub fn new(
        storage: Arc<dyn Storage>,
        trackers: Vec<Arc<dyn TokenTracker>>,
        config: TrackerRunnerConfig,
    ) -> Self {
        Self::with_delay(storage, trackers, config, TokioDelay)
    }
}

impl<D: Delay> TrackerRunner<D> {
    pub fn with_delay(
        storage: Arc<dyn Storage>,
        trackers: Vec<Arc<dyn TokenTracker>>,
        config: TrackerRunnerConfig,
        delay: D,
    ) -> Self {
        Self {
            storage,
            trackers,
            config,
            delay,
        }
    }

    /// Classify contracts discovered since the tracker's contract cursor.
    pub async fn discover_contracts(&self, tracker: &dyn TokenTracker) -> Result<usize> {
        let kind = IndexerKind::TokenContracts(tracker.standard());
        let page_size = self.config.contract_page_size.max(1);
        let mut registered = 0;

        loop {
            let cursor = self.storage.get_indexer_state(kind)?.last_synced_block.unwrap_or(0);
            let contracts = self.storage.get_contracts(
                &Filter::new()
                    .with("id", Comparator::Gt, cursor)
                    .order_by("id", OrderDirection::Asc)
                    .limit(page_size as u64),
            )?;

            for contract in &contracts {
                match tracker.add_contract(contract).await {
                    Ok(true) => registered += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        target: LOG_TARGET,
                        standard = %tracker.standard(),
                        address = %contract.address,
                        error = %e,
                        "Skipping contract"
                    ),
                }
            }

            if let Some(last) = contracts.iter().filter_map(|c| c.id).max() {
                self.storage.set_last_synced_block(kind, last as u64)?;
            }
            if contracts.len() < page_size {
                break;
            }
        }

        Ok(registered)
    }

    /// Feed every token the stored logs past its watermark, one window at a time.
    pub async fn replay_logs(&self, tracker: &dyn TokenTracker) -> Result<usize> {
        let Some(logs_cursor) = self
            .storage
            .get_indexer_state(IndexerKind::Logs)?
            .last_synced_block
        else {
            return Ok(0);
        };

        let mut events = 0;
        for token in tracker.tokens()? {
            match self.replay_token(tracker, &token, logs_cursor).await {
                Ok(count) => events += count,
                Err(e) => tracing::warn!(
                    target: LOG_TARGET,
                    standard = %tracker.standard(),
                    token = %token,
                    error = %e,
                    "Log replay failed"
                ),
            }
        }
        Ok(events)
    }

    async fn replay_token(&self, tracker: &dyn TokenTracker, token: &str, until: u64) -> Result<usize> {
        let window = self.config.log_window.max(1);
        let page_size = tracker.batch_size().max(1) as u64;
        let mut from = tracker.last_synced_block(token)?.map_or(0, |b| b + 1);
        let mut events = 0;

        while from <= until {
            let to = from.saturating_add(window - 1).min(until);

            let mut logs = Vec::new();
            loop {
                let page = self.storage.get_logs(
                    &Filter::new()
                        .with("address", Comparator::Eq, token)
                        .with("block_number", Comparator::Gte, from)
                        .with("block_number", Comparator::Lte, to)
                        .order_by("block_number", OrderDirection::Asc)
                        .limit(page_size)
                        .offset(logs.len() as u64),
                )?;
                let fetched = page.len() as u64;
                logs.extend(page);
                if fetched < page_size {
                    break;
                }
            }

            if !logs.is_empty() {
                let produced = tracker.track_events(token, &logs).await?;
                self.storage.add_contract_events(&produced)?;
                events += produced.len();
            }
            tracker.set_last_synced_block(token, to)?;
            from = to + 1;
        }

        Ok(events)
    }

    /// Discover, replay and reconcile once for every tracker.
    pub async fn run_once(&self) -> Vec<TrackerCycle> {
        let mut cycles = Vec::with_capacity(self.trackers.len());

        for tracker in &self.trackers {
            let tracker = tracker.as_ref();
            let standard = tracker.standard();

            let registered = self.discover_contracts(tracker).await.unwrap_or_else(|e| {
                tracing::error!(target: LOG_TARGET, standard = %standard, error = %e, "Contract discovery failed");
                0
            });
            let events = self.replay_logs(tracker).await.unwrap_or_else(|e| {
                tracing::error!(target: LOG_TARGET, standard = %standard, error = %e, "Log replay failed");
                0
            });
            let reconciled = tracker.on_finish().await.unwrap_or_else(|e| {
                tracing::error!(target: LOG_TARGET, standard = %standard, error = %e, "Reconciliation failed");
                ReconcileReport::default()
            });

            tracing::info!(
                target: LOG_TARGET,
                standard = %standard,
                registered,
                events,
                updated = reconciled.updated,
                failed = reconciled.failed,
                "Tracker cycle finished"
            );
            cycles.push(TrackerCycle {
                standard,
                registered,
                events,
                reconciled,
            });
        }

        cycles
    }

    pub async fn run(self) {
        loop {
            self.run_once().await;
            self.delay.sleep(self.config.interval).await;
        }
    }
}
