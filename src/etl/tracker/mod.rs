//! Token tracking framework.
//!
//! A [`TokenTracker`] owns the state of one token standard: which contracts
//! are tokens, per-token log watermarks and the balances/assets touched by
//! events. The [`TrackerRunner`] feeds it newly discovered contracts and
//! stored logs, persists the events it produces and lets it reconcile dirty
//! rows against the chain.

mod runner;

use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;

pub use runner::{TrackerCycle, TrackerRunner, TrackerRunnerConfig};

use crate::types::{Contract, ContractEvent, Log, TokenStandard, ZERO_ADDRESS};

const LOG_TARGET: &str = "shardex::etl::tracker";

/// Accepted token name length, in characters.
pub const NAME_LENGTH: (usize, usize) = (3, 64);
/// Accepted ERC20/ERC721 symbol length.
pub const SYMBOL_LENGTH: (usize, usize) = (3, 10);
/// ERC1155 symbols are allowed to be longer.
pub const MULTI_TOKEN_SYMBOL_LENGTH: (usize, usize) = (3, 24);

#[async_trait]
pub trait TokenTracker: Send + Sync {
    fn standard(&self) -> TokenStandard;

    /// Rows fetched per page when replaying logs and reconciling.
    fn batch_size(&self) -> usize;

    /// Classify a discovered contract and register it when it is a valid token.
    ///
    /// `Ok(false)` means the contract is not a token of this standard. Errors
    /// are logged by the runner and the contract is not retried.
    async fn add_contract(&self, contract: &Contract) -> Result<bool>;

    /// Addresses of registered tokens.
    fn tokens(&self) -> Result<Vec<String>>;

    /// Apply the logs emitted by `token` and return the events they produced.
    async fn track_events(&self, token: &str, logs: &[Log]) -> Result<Vec<ContractEvent>>;

    fn last_synced_block(&self, token: &str) -> Result<Option<u64>>;

    fn set_last_synced_block(&self, token: &str, block: u64) -> Result<()>;

    /// Refresh every row marked as needing an update.
    async fn on_finish(&self) -> Result<ReconcileReport>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub updated: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn merge(self, other: ReconcileReport) -> Self {
        Self {
            updated: self.updated + other.updated,
            failed: self.failed + other.failed,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("name length out of range: {0:?}")]
    Name(String),
    #[error("symbol length out of range: {0:?}")]
    Symbol(String),
}

/// Normalise `name` and `symbol` and check their lengths.
pub fn validate_metadata(
    name: &str,
    symbol: &str,
    symbol_length: (usize, usize),
) -> Result<(String, String), MetadataError> {
    let name = shardex_common::normalize_string(name, NAME_LENGTH.1 + 1);
    let symbol = shardex_common::normalize_string(symbol, symbol_length.1 + 1);
    if !shardex_common::length_within(&name, NAME_LENGTH.0, NAME_LENGTH.1) {
        return Err(MetadataError::Name(name));
    }
    if !shardex_common::length_within(&symbol, symbol_length.0, symbol_length.1) {
        return Err(MetadataError::Symbol(symbol));
    }
    Ok((name, symbol))
}

pub fn is_zero_address(address: &str) -> bool {
    address.is_empty() || address.eq_ignore_ascii_case(ZERO_ADDRESS)
}

/// Page through rows needing an update until none are left.
///
/// Rows that fail stay dirty, so each page is read at `offset = failed so far`
/// to step over them. Rows of one page are reconciled concurrently.
pub async fn drain_dirty<T, P, R, Fut>(
    standard: TokenStandard,
    page_size: usize,
    mut page: P,
    mut reconcile: R,
) -> Result<ReconcileReport>
where
    P: FnMut(usize, usize) -> Result<Vec<T>>,
    R: FnMut(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let page_size = page_size.max(1);
    let mut report = ReconcileReport::default();

    loop {
        let rows = page(report.failed, page_size)?;
        let fetched = rows.len();
        if fetched == 0 {
            break;
        }

        for result in join_all(rows.into_iter().map(&mut reconcile)).await {
            match result {
                Ok(()) => report.updated += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::debug!(
                        target: LOG_TARGET,
                        standard = %standard,
                        error = %e,
                        "Reconciliation failed, row stays dirty"
                    );
                }
            }
        }

        if fetched < page_size {
            break;
        }
    }

    Ok(report)
}
