//! ERC721 NFT tracker for shardex
//!
//! # Components
//!
//! - [`Erc721Tracker`]: classifies collections, records Transfer, Approval and
//!   ApprovalForAll events and reconciles asset ownership and metadata
//! - [`Erc721Storage`]: SQLite storage keyed by `(token, token_id)`
//!
//! ```rust,ignore
//! let storage = Arc::new(Erc721Storage::new("./data/erc721.db")?);
//! let resolver = MetadataResolver::new(MetadataResolverConfig::default())?;
//! let tracker = Erc721Tracker::new(storage, client, resolver, Erc721TrackerConfig::default())?;
//! ```

pub mod abi;
pub mod identification;
pub mod storage;
pub mod tracker;

pub use abi::{erc721_abi, REQUIRED_SIGNATURES};
pub use identification::{fetch_metadata, fingerprint};
pub use storage::{Erc721Asset, Erc721Storage, Erc721Token};
pub use tracker::{Erc721Tracker, Erc721TrackerConfig};
