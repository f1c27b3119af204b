//! Storage capability used by the pipeline.
//!
//! The engine and trackers only see [`Storage`]; [`SqliteStorage`] is the
//! bundled backend. Every `add_*` is idempotent on the entity's natural key
//! and returns the number of rows actually inserted.

pub mod filter;
pub mod sqlite;

use anyhow::Result;

pub use filter::{Comparator, Filter, FilterEntry, OrderDirection, TableSpec};
pub use sqlite::SqliteStorage;

use crate::types::{
    AddressRelation, Block, Contract, ContractEvent, IndexerKind, IndexerState,
    InternalTransaction, Log, ShardId, StakingTransaction, Transaction,
};

pub trait Storage: Send + Sync {
    fn shard(&self) -> ShardId;

    fn add_blocks(&self, blocks: &[Block]) -> Result<usize>;
    fn add_transactions(&self, transactions: &[Transaction]) -> Result<usize>;
    fn add_staking_transactions(&self, transactions: &[StakingTransaction]) -> Result<usize>;
    fn add_internal_transactions(&self, transactions: &[InternalTransaction]) -> Result<usize>;
    fn add_logs(&self, logs: &[Log]) -> Result<usize>;
    fn add_contracts(&self, contracts: &[Contract]) -> Result<usize>;
    fn add_address_relations(&self, relations: &[AddressRelation]) -> Result<usize>;
    fn add_contract_events(&self, events: &[ContractEvent]) -> Result<usize>;

    fn get_blocks(&self, filter: &Filter) -> Result<Vec<Block>>;
    fn get_transactions(&self, filter: &Filter) -> Result<Vec<Transaction>>;
    fn get_staking_transactions(&self, filter: &Filter) -> Result<Vec<StakingTransaction>>;
    fn get_internal_transactions(&self, filter: &Filter) -> Result<Vec<InternalTransaction>>;
    fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>>;
    fn get_contracts(&self, filter: &Filter) -> Result<Vec<Contract>>;
    fn get_address_relations(&self, filter: &Filter) -> Result<Vec<AddressRelation>>;
    fn get_contract_events(&self, filter: &Filter) -> Result<Vec<ContractEvent>>;

    fn get_indexer_state(&self, kind: IndexerKind) -> Result<IndexerState>;

    /// Advance the cursor. Never moves it backwards; returns the stored value.
    fn set_last_synced_block(&self, kind: IndexerKind, block: u64) -> Result<u64>;

    fn set_chain_id(&self, chain_id: u64) -> Result<()>;
}
