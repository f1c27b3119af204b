//! Extraction pipeline.
//!
//! - [`sync_loop`]: the adaptive loop shared by every range pipeline
//! - [`block_indexer`] / [`log_indexer`]: the range pipelines
//! - [`discovery`]: contract rows and standard fingerprints from bytecode
//! - [`tracker`]: token trackers fed from stored contracts and logs

pub mod address_collector;
pub mod batch_control;
pub mod block_indexer;
pub mod delay;
pub mod discovery;
pub mod log_indexer;
pub mod sync_loop;
pub mod tracker;

pub use address_collector::AddressCollector;
pub use batch_control::BatchControl;
pub use block_indexer::{BlockIndexer, BlockIndexerConfig};
pub use delay::{Delay, RecordingDelay, TokioDelay};
pub use discovery::Fingerprint;
pub use log_indexer::{LogIndexer, DEFAULT_LOG_RANGE_WIDTH, LOG_SHARD};
pub use sync_loop::{IterationReport, RangeIndexer, SyncLoop, SyncLoopConfig};
pub use tracker::{ReconcileReport, TokenTracker, TrackerRunner, TrackerRunnerConfig};
