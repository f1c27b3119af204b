//! ERC1155 multi-token tracker for shardex
//!
//! Collections are identified by bytecode signatures and named from the JSON
//! document behind `contractURI()`. Balances are kept per `(owner, token, id)`
//! and reconciled with single-element `balanceOfBatch` reads.

pub mod abi;
pub mod identification;
pub mod storage;
pub mod tracker;

pub use abi::{erc1155_abi, REQUIRED_SIGNATURES};
pub use identification::{fetch_metadata, fingerprint, Erc1155Metadata};
pub use storage::{Erc1155Asset, Erc1155Balance, Erc1155Storage, Erc1155Token};
pub use tracker::{Erc1155Tracker, Erc1155TrackerConfig};
