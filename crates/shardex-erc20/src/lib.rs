//! ERC20 token tracker for shardex
//!
//! Identifies ERC20 contracts among discovered contracts, turns their stored
//! `Transfer`/`Approval` logs into contract events and keeps holder balances
//! in sync with the chain.
//!
//! # Usage
//!
//! ```rust,ignore
//! let storage = Arc::new(Erc20Storage::new("./data/erc20.db")?);
//! let tracker = Erc20Tracker::new(storage, client, Erc20TrackerConfig::default())?;
//! let runner = TrackerRunner::new(core_storage, vec![Arc::new(tracker)], Default::default());
//! ```

pub mod abi;
pub mod identification;
pub mod storage;
pub mod tracker;

pub use abi::{erc20_abi, REQUIRED_SIGNATURES};
pub use identification::{fetch_metadata, fingerprint, Erc20Metadata};
pub use storage::{Erc20Balance, Erc20Storage, Erc20Token};
pub use tracker::{Erc20Tracker, Erc20TrackerConfig};
