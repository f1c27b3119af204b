//! Entities shared by the chain client, storage and the ETL pipeline.
//!
//! Addresses are always canonical lowercase `0x` hex and amounts are decimal
//! strings by the time a value lands in one of these structs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Shard identifier.
pub type ShardId = u32;

/// The zero address used as mint/burn sentinel.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub shard: ShardId,
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub miner: String,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub size: u64,
    pub epoch: u64,
    pub transactions: Vec<String>,
    pub staking_transactions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub shard: ShardId,
    pub hash: String,
    pub eth_hash: Option<String>,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_index: u64,
    pub from: String,
    /// `None` for contract creations.
    pub to: Option<String>,
    pub value: String,
    pub gas: u64,
    pub gas_price: String,
    pub input: String,
    pub nonce: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakingTransaction {
    pub shard: ShardId,
    pub hash: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_index: u64,
    pub from: String,
    /// `Delegate`, `Undelegate`, `CollectRewards`, `CreateValidator`, `EditValidator`.
    pub kind: String,
    pub delegator_address: Option<String>,
    pub validator_address: Option<String>,
    /// Decimal amount. For `CollectRewards` this comes from the receipt.
    pub amount: Option<String>,
    pub gas: u64,
    pub gas_price: String,
    pub nonce: u64,
    pub timestamp: u64,
}

impl StakingTransaction {
    pub const COLLECT_REWARDS: &'static str = "CollectRewards";

    pub fn is_collect_rewards(&self) -> bool {
        self.kind == Self::COLLECT_REWARDS
    }
}

/// A flattened trace record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalTransaction {
    pub transaction_hash: String,
    /// Position of this trace within its transaction.
    pub index: u32,
    pub block_number: u64,
    pub from: String,
    pub to: String,
    pub value: String,
    pub gas: u64,
    pub gas_used: u64,
    pub input: String,
    pub output: String,
    /// `call`, `delegatecall`, `staticcall`, `create`, `create2`...
    pub kind: String,
    pub error: Option<String>,
    /// Runtime bytecode for contract creations.
    pub deployed_code: Option<String>,
}

impl InternalTransaction {
    /// A successful `create`/`create2` trace.
    pub fn is_contract_creation(&self) -> bool {
        matches!(self.kind.as_str(), "create" | "create2") && self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub log_index: u64,
    pub removed: bool,
}

impl Log {
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Receipt {
    pub transaction_hash: String,
    pub block_number: u64,
    pub status: Option<u64>,
    pub contract_address: Option<String>,
    pub gas_used: u64,
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    /// Storage row id, used for paging through newly discovered contracts.
    pub id: Option<i64>,
    pub address: String,
    pub creator: String,
    pub block_number: u64,
    pub transaction_hash: String,
    pub bytecode: String,
    pub solidity_version: Option<String>,
    pub ipfs_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressRelationKind {
    Transaction,
    StakingTransaction,
    InternalTransaction,
}

impl AddressRelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::StakingTransaction => "staking_transaction",
            Self::InternalTransaction => "internal_transaction",
        }
    }
}

impl FromStr for AddressRelationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transaction" => Ok(Self::Transaction),
            "staking_transaction" => Ok(Self::StakingTransaction),
            "internal_transaction" => Ok(Self::InternalTransaction),
            other => anyhow::bail!("Unknown address relation kind: {other}"),
        }
    }
}

/// Links a participant address to the transaction it appeared in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRelation {
    pub address: String,
    pub block_number: u64,
    pub transaction_hash: String,
    pub kind: AddressRelationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenStandard {
    #[serde(rename = "ERC20")]
    Erc20,
    #[serde(rename = "ERC721")]
    Erc721,
    #[serde(rename = "ERC1155")]
    Erc1155,
}

impl TokenStandard {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Erc20 => "ERC20",
            Self::Erc721 => "ERC721",
            Self::Erc1155 => "ERC1155",
        }
    }
}

impl fmt::Display for TokenStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenStandard {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ERC20" => Ok(Self::Erc20),
            "ERC721" => Ok(Self::Erc721),
            "ERC1155" => Ok(Self::Erc1155),
            other => anyhow::bail!("Unknown token standard: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractEventType {
    Transfer,
    Approval,
    ApprovalForAll,
}

impl ContractEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "Transfer",
            Self::Approval => "Approval",
            Self::ApprovalForAll => "ApprovalForAll",
        }
    }
}

impl FromStr for ContractEventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Transfer" => Ok(Self::Transfer),
            "Approval" => Ok(Self::Approval),
            "ApprovalForAll" => Ok(Self::ApprovalForAll),
            other => anyhow::bail!("Unknown contract event type: {other}"),
        }
    }
}

/// Normalised token event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractEvent {
    pub token: String,
    pub from: String,
    pub to: String,
    pub value: String,
    /// Set for ERC721/ERC1155 transfers.
    pub token_id: Option<String>,
    pub standard: TokenStandard,
    pub event_type: ContractEventType,
    pub block_number: u64,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub log_index: u64,
}

/// Which loop owns a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexerKind {
    Blocks,
    Logs,
    /// Paging cursor over discovered contracts, per token standard.
    TokenContracts(TokenStandard),
}

impl IndexerKind {
    pub fn key(&self) -> String {
        match self {
            Self::Blocks => "blocks".to_string(),
            Self::Logs => "logs".to_string(),
            Self::TokenContracts(standard) => {
                format!("contracts_{}", standard.as_str().to_ascii_lowercase())
            }
        }
    }
}

impl fmt::Display for IndexerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerState {
    pub shard: ShardId,
    pub kind: IndexerKind,
    pub last_synced_block: Option<u64>,
    pub chain_id: Option<u64>,
}

/// Direction selector for `hmyv2_getTransactionsCount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionCountKind {
    Sent,
    Received,
    #[default]
    All,
}

impl TransactionCountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Received => "RECEIVED",
            Self::All => "ALL",
        }
    }
}
