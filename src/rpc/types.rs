//! Wire shapes returned by shard nodes and their normalisation into
//! [`crate::types`] entities.
//!
//! Nodes are inconsistent about numeric encodings (`hmyv2_*` methods return
//! JSON numbers, `eth_*` methods return `0x` quantities) and about address
//! encodings (bech32 `one1…` vs hex), so every numeric field is read as a raw
//! [`Value`] and converted here.

use std::collections::HashMap;

use bech32::FromBase32;
use primitive_types::U256;
use serde::Deserialize;
use serde_json::Value;

use super::RpcError;
use crate::types::{
    Block, InternalTransaction, Log, Receipt, ShardId, StakingTransaction, Transaction,
};

/// Read a quantity that may be a JSON number, a `0x` hex string or a decimal string.
pub fn quantity_u256(value: &Value) -> Result<U256, RpcError> {
    match value {
        Value::Null => Ok(U256::zero()),
        Value::Number(n) => {
            // Numbers keep their source digits, so amounts above u64 are exact.
            let digits = n.to_string();
            if !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(RpcError::decode("quantity", format!("not a non-negative integer: {digits}")));
            }
            U256::from_dec_str(&digits)
                .map_err(|e| RpcError::decode("quantity", format!("{digits}: {e:?}")))
        }
        Value::String(s) => {
            let s = s.trim();
            if s.starts_with("0x") || s.starts_with("0X") {
                shardex_common::hex_to_u256(s).map_err(|e| RpcError::decode("quantity", e))
            } else if s.is_empty() {
                Ok(U256::zero())
            } else {
                U256::from_dec_str(s).map_err(|e| RpcError::decode("quantity", format!("{s}: {e:?}")))
            }
        }
        other => Err(RpcError::decode("quantity", format!("unexpected value {other}"))),
    }
}

pub fn quantity_u64(value: &Value) -> Result<u64, RpcError> {
    let v = quantity_u256(value)?;
    if v > U256::from(u64::MAX) {
        return Err(RpcError::decode("quantity", format!("{v} overflows u64")));
    }
    Ok(v.low_u64())
}

pub fn quantity_decimal(value: &Value) -> Result<String, RpcError> {
    Ok(quantity_u256(value)?.to_string())
}

/// Canonical address form: lowercase `0x` hex. Accepts hex in any case and
/// bech32 `one1…` addresses. Empty input stays empty.
pub fn canonical_address(address: &str) -> Result<String, RpcError> {
    let address = address.trim();
    if address.is_empty() {
        return Ok(String::new());
    }

    if address.starts_with("one1") {
        let (_, data, _) =
            bech32::decode(address).map_err(|e| RpcError::decode("bech32 address", e))?;
        let bytes =
            Vec::<u8>::from_base32(&data).map_err(|e| RpcError::decode("bech32 address", e))?;
        return Ok(format!("0x{}", hex::encode(bytes)));
    }

    let digits = shardex_common::strip_hex_prefix(address);
    if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(RpcError::decode("address", format!("invalid address {address}")));
    }
    Ok(format!("0x{}", digits.to_ascii_lowercase()))
}

fn optional_address(address: Option<&str>) -> Result<Option<String>, RpcError> {
    match address.map(canonical_address).transpose()? {
        Some(a) if a.is_empty() => Ok(None),
        other => Ok(other),
    }
}

fn lower_hash(hash: &str) -> String {
    hash.to_ascii_lowercase()
}

/// Either a bare hash or a full object, depending on request flags.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TxEntry<T> {
    Hash(String),
    Full(Box<T>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    pub number: Value,
    pub hash: String,
    #[serde(default)]
    pub parent_hash: String,
    #[serde(default)]
    pub miner: String,
    #[serde(default)]
    pub timestamp: Value,
    #[serde(default)]
    pub gas_limit: Value,
    #[serde(default)]
    pub gas_used: Value,
    #[serde(default)]
    pub size: Value,
    #[serde(default)]
    pub epoch: Value,
    #[serde(default)]
    pub transactions: Vec<TxEntry<RawTransaction>>,
    #[serde(default)]
    pub staking_transactions: Vec<TxEntry<RawStakingTransaction>>,
}

/// A block with its full transaction bodies.
#[derive(Debug, Clone, Default)]
pub struct BlockWithTransactions {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    pub staking_transactions: Vec<StakingTransaction>,
}

impl RawBlock {
    pub fn normalize(self, shard: ShardId) -> Result<BlockWithTransactions, RpcError> {
        let number = quantity_u64(&self.number)?;
        let timestamp = quantity_u64(&self.timestamp)?;

        let mut tx_hashes = Vec::with_capacity(self.transactions.len());
        let mut transactions = Vec::new();
        for entry in self.transactions {
            match entry {
                TxEntry::Hash(hash) => tx_hashes.push(lower_hash(&hash)),
                TxEntry::Full(raw) => {
                    let tx = raw.normalize(shard, timestamp)?;
                    tx_hashes.push(tx.hash.clone());
                    transactions.push(tx);
                }
            }
        }

        let mut staking_hashes = Vec::with_capacity(self.staking_transactions.len());
        let mut staking_transactions = Vec::new();
        for entry in self.staking_transactions {
            match entry {
                TxEntry::Hash(hash) => staking_hashes.push(lower_hash(&hash)),
                TxEntry::Full(raw) => {
                    let tx = raw.normalize(shard, timestamp)?;
                    staking_hashes.push(tx.hash.clone());
                    staking_transactions.push(tx);
                }
            }
        }

        let block = Block {
            shard,
            number,
            hash: lower_hash(&self.hash),
            parent_hash: lower_hash(&self.parent_hash),
            miner: canonical_address(&self.miner)?,
            timestamp,
            gas_limit: quantity_u64(&self.gas_limit)?,
            gas_used: quantity_u64(&self.gas_used)?,
            size: quantity_u64(&self.size)?,
            epoch: quantity_u64(&self.epoch)?,
            transactions: tx_hashes,
            staking_transactions: staking_hashes,
        };

        Ok(BlockWithTransactions {
            block,
            transactions,
            staking_transactions,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub hash: String,
    #[serde(default)]
    pub eth_hash: Option<String>,
    #[serde(default)]
    pub block_number: Value,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub transaction_index: Value,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub gas: Value,
    #[serde(default)]
    pub gas_price: Value,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub nonce: Value,
    #[serde(default)]
    pub timestamp: Value,
}

impl RawTransaction {
    pub fn normalize(self, shard: ShardId, block_timestamp: u64) -> Result<Transaction, RpcError> {
        let timestamp = match self.timestamp {
            Value::Null => block_timestamp,
            ref t => quantity_u64(t)?,
        };
        Ok(Transaction {
            shard,
            hash: lower_hash(&self.hash),
            eth_hash: self.eth_hash.as_deref().map(lower_hash),
            block_number: quantity_u64(&self.block_number)?,
            block_hash: self.block_hash.as_deref().map(lower_hash).unwrap_or_default(),
            transaction_index: quantity_u64(&self.transaction_index)?,
            from: canonical_address(&self.from)?,
            to: optional_address(self.to.as_deref())?,
            value: quantity_decimal(&self.value)?,
            gas: quantity_u64(&self.gas)?,
            gas_price: quantity_decimal(&self.gas_price)?,
            input: self.input.unwrap_or_else(|| "0x".to_string()),
            nonce: quantity_u64(&self.nonce)?,
            timestamp,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStakingMsg {
    #[serde(default)]
    pub delegator_address: Option<String>,
    #[serde(default)]
    pub validator_address: Option<String>,
    #[serde(default)]
    pub amount: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStakingTransaction {
    pub hash: String,
    #[serde(default)]
    pub block_number: Value,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub transaction_index: Value,
    pub from: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub msg: RawStakingMsg,
    #[serde(default)]
    pub gas: Value,
    #[serde(default)]
    pub gas_price: Value,
    #[serde(default)]
    pub nonce: Value,
    #[serde(default)]
    pub timestamp: Value,
}

impl RawStakingTransaction {
    pub fn normalize(
        self,
        shard: ShardId,
        block_timestamp: u64,
    ) -> Result<StakingTransaction, RpcError> {
        let timestamp = match self.timestamp {
            Value::Null => block_timestamp,
            ref t => quantity_u64(t)?,
        };
        Ok(StakingTransaction {
            shard,
            hash: lower_hash(&self.hash),
            block_number: quantity_u64(&self.block_number)?,
            block_hash: self.block_hash.as_deref().map(lower_hash).unwrap_or_default(),
            transaction_index: quantity_u64(&self.transaction_index)?,
            from: canonical_address(&self.from)?,
            kind: self.kind,
            delegator_address: optional_address(self.msg.delegator_address.as_deref())?,
            validator_address: optional_address(self.msg.validator_address.as_deref())?,
            amount: self.msg.amount.as_ref().map(quantity_decimal).transpose()?,
            gas: quantity_u64(&self.gas)?,
            gas_price: quantity_decimal(&self.gas_price)?,
            nonce: quantity_u64(&self.nonce)?,
            timestamp,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub block_number: Value,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub transaction_index: Value,
    #[serde(default)]
    pub log_index: Value,
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    pub fn normalize(self) -> Result<Log, RpcError> {
        Ok(Log {
            address: canonical_address(&self.address)?,
            topics: self.topics.iter().map(|t| lower_hash(t)).collect(),
            data: if self.data.is_empty() {
                "0x".to_string()
            } else {
                self.data.to_ascii_lowercase()
            },
            block_number: quantity_u64(&self.block_number)?,
            block_hash: self.block_hash.as_deref().map(lower_hash).unwrap_or_default(),
            transaction_hash: self
                .transaction_hash
                .as_deref()
                .map(lower_hash)
                .unwrap_or_default(),
            transaction_index: quantity_u64(&self.transaction_index)?,
            log_index: quantity_u64(&self.log_index)?,
            removed: self.removed,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReceipt {
    pub transaction_hash: String,
    #[serde(default)]
    pub block_number: Value,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub gas_used: Value,
    #[serde(default)]
    pub logs: Vec<RawLog>,
}

impl RawReceipt {
    pub fn normalize(self) -> Result<Receipt, RpcError> {
        let contract_address = match self.contract_address.as_deref() {
            Some(a) if a != crate::types::ZERO_ADDRESS => optional_address(Some(a))?,
            _ => None,
        };
        Ok(Receipt {
            transaction_hash: lower_hash(&self.transaction_hash),
            block_number: quantity_u64(&self.block_number)?,
            status: self.status.as_ref().map(quantity_u64).transpose()?,
            contract_address,
            gas_used: quantity_u64(&self.gas_used)?,
            logs: self
                .logs
                .into_iter()
                .map(RawLog::normalize)
                .collect::<Result<_, _>>()?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTraceAction {
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub creation_method: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub gas: Value,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub init: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTraceResult {
    #[serde(default)]
    pub gas_used: Value,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTrace {
    #[serde(default)]
    pub action: RawTraceAction,
    #[serde(default)]
    pub result: Option<RawTraceResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub block_number: Value,
}

/// Flatten block traces into internal transactions.
///
/// `suicide` traces are dropped. `index` is the position of the trace within
/// its transaction after dropping.
pub fn flatten_traces(traces: Vec<RawTrace>) -> Result<Vec<InternalTransaction>, RpcError> {
    let mut positions: HashMap<String, u32> = HashMap::new();
    let mut flattened = Vec::with_capacity(traces.len());

    for trace in traces {
        if trace.kind == "suicide" {
            continue;
        }

        let transaction_hash = trace
            .transaction_hash
            .as_deref()
            .map(lower_hash)
            .unwrap_or_default();
        let position = positions.entry(transaction_hash.clone()).or_insert(0);
        let index = *position;
        *position += 1;

        let result = trace.result.unwrap_or_default();
        let is_create = trace.kind == "create";
        let kind = if is_create {
            trace
                .action
                .creation_method
                .clone()
                .unwrap_or_else(|| "create".to_string())
        } else {
            trace
                .action
                .call_type
                .clone()
                .unwrap_or_else(|| trace.kind.clone())
        };

        let (to, input, deployed_code) = if is_create {
            (
                result.address.as_deref(),
                trace.action.init.clone(),
                result.code.clone(),
            )
        } else {
            (trace.action.to.as_deref(), trace.action.input.clone(), None)
        };

        flattened.push(InternalTransaction {
            transaction_hash,
            index,
            block_number: quantity_u64(&trace.block_number)?,
            from: optional_address(trace.action.from.as_deref())?.unwrap_or_default(),
            to: optional_address(to)?.unwrap_or_default(),
            value: quantity_decimal(&trace.action.value)?,
            gas: quantity_u64(&trace.action.gas)?,
            gas_used: quantity_u64(&result.gas_used)?,
            input: input.unwrap_or_else(|| "0x".to_string()),
            output: result.output.unwrap_or_else(|| "0x".to_string()),
            kind: kind.to_ascii_lowercase(),
            error: trace.error,
            deployed_code,
        });
    }

    Ok(flattened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quantity_formats() {
        assert_eq!(quantity_u64(&json!(42)).unwrap(), 42);
        assert_eq!(quantity_u64(&json!("0x2a")).unwrap(), 42);
        assert_eq!(quantity_u64(&json!("42")).unwrap(), 42);
        assert_eq!(quantity_u64(&Value::Null).unwrap(), 0);
        assert_eq!(
            quantity_decimal(&json!("0xde0b6b3a7640000")).unwrap(),
            "1000000000000000000"
        );
        assert!(quantity_u64(&json!("0x10000000000000000")).is_err());
        assert!(quantity_u64(&json!(true)).is_err());
    }

    #[test]
    fn test_large_json_number_is_exact() {
        let value: Value = serde_json::from_str("1234567890123456789012345").unwrap();
        assert_eq!(
            quantity_u256(&value).unwrap(),
            U256::from_dec_str("1234567890123456789012345").unwrap()
        );
        assert_eq!(quantity_decimal(&value).unwrap(), "1234567890123456789012345");

        let tx: Value = serde_json::from_str(r#"{"value": 100000000000000000000000}"#).unwrap();
        assert_eq!(quantity_decimal(&tx["value"]).unwrap(), "100000000000000000000000");

        for rejected in ["1.5", "-3", "1e21"] {
            let value: Value = serde_json::from_str(rejected).unwrap();
            assert!(quantity_u256(&value).is_err(), "{rejected} accepted");
        }
    }

    #[test]
    fn test_canonical_address_hex() {
        assert_eq!(
            canonical_address("0xAbCdEf0123456789aBcDeF0123456789AbCdEf01").unwrap(),
            "0xabcdef0123456789abcdef0123456789abcdef01"
        );
        assert_eq!(canonical_address("").unwrap(), "");
        assert!(canonical_address("0x1234").is_err());
    }

    #[test]
    fn test_canonical_address_bech32() {
        use bech32::{ToBase32, Variant};
        let bytes = hex::decode("7c41e0668b551f4f902cfaec05b5bdca68b124ce").unwrap();
        let encoded = bech32::encode("one", bytes.to_base32(), Variant::Bech32).unwrap();
        assert!(encoded.starts_with("one1"));
        assert_eq!(
            canonical_address(&encoded).unwrap(),
            "0x7c41e0668b551f4f902cfaec05b5bdca68b124ce"
        );
    }

    #[test]
    fn test_flatten_traces_drops_suicide_and_indexes_per_tx() {
        let traces: Vec<RawTrace> = serde_json::from_value(json!([
            {
                "type": "call",
                "action": {"callType": "call", "from": "0x1111111111111111111111111111111111111111",
                           "to": "0x2222222222222222222222222222222222222222", "value": "0x0",
                           "gas": "0x100", "input": "0xa9059cbb"},
                "result": {"gasUsed": "0x50", "output": "0x"},
                "transactionHash": "0xAA", "blockNumber": 10
            },
            {
                "type": "suicide",
                "action": {},
                "transactionHash": "0xaa", "blockNumber": 10
            },
            {
                "type": "create",
                "action": {"creationMethod": "create2", "from": "0x2222222222222222222222222222222222222222",
                           "value": "0x0", "gas": "0x100", "init": "0x6080"},
                "result": {"gasUsed": "0x10", "address": "0x3333333333333333333333333333333333333333",
                           "code": "0x6080abcd"},
                "transactionHash": "0xaa", "blockNumber": 10
            }
        ]))
        .unwrap();

        let flat = flatten_traces(traces).unwrap();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].kind, "call");
        assert_eq!(flat[0].index, 0);
        assert_eq!(flat[0].transaction_hash, "0xaa");
        assert_eq!(flat[1].kind, "create2");
        assert_eq!(flat[1].index, 1);
        assert_eq!(flat[1].to, "0x3333333333333333333333333333333333333333");
        assert_eq!(flat[1].deployed_code.as_deref(), Some("0x6080abcd"));
        assert!(flat[1].is_contract_creation());
    }

    #[test]
    fn test_block_normalisation_with_full_transactions() {
        let raw: RawBlock = serde_json::from_value(json!({
            "number": 5,
            "hash": "0xB1",
            "parentHash": "0xB0",
            "miner": "0x1111111111111111111111111111111111111111",
            "timestamp": 1700000000,
            "gasLimit": 80000000,
            "gasUsed": 21000,
            "size": 900,
            "epoch": 3,
            "transactions": [{
                "hash": "0xT1", "blockNumber": 5, "blockHash": "0xb1", "transactionIndex": 0,
                "from": "0x1111111111111111111111111111111111111111",
                "to": "0x2222222222222222222222222222222222222222",
                "value": 1000000000000000000u64, "gas": 21000, "gasPrice": 100000000000u64,
                "input": "0x", "nonce": 1
            }],
            "stakingTransactions": [{
                "hash": "0xS1", "blockNumber": 5, "transactionIndex": 0, "type": "CollectRewards",
                "from": "0x1111111111111111111111111111111111111111",
                "msg": {"delegatorAddress": "0x1111111111111111111111111111111111111111"},
                "gas": 25000, "gasPrice": 100000000000u64, "nonce": 2
            }]
        }))
        .unwrap();

        let normalized = raw.normalize(0).unwrap();
        assert_eq!(normalized.block.number, 5);
        assert_eq!(normalized.block.transactions, vec!["0xt1".to_string()]);
        assert_eq!(normalized.block.staking_transactions, vec!["0xs1".to_string()]);
        assert_eq!(normalized.transactions[0].value, "1000000000000000000");
        assert_eq!(normalized.transactions[0].timestamp, 1700000000);
        assert!(normalized.staking_transactions[0].is_collect_rewards());
        assert_eq!(normalized.staking_transactions[0].amount, None);
    }

    #[test]
    fn test_full_transaction_keeps_large_value() {
        let raw: RawBlock = serde_json::from_str(
            r#"{
                "number": 7, "hash": "0xb7", "timestamp": 1700000000,
                "transactions": [{
                    "hash": "0xt7", "blockNumber": 7, "blockHash": "0xb7", "transactionIndex": 0,
                    "from": "0x1111111111111111111111111111111111111111",
                    "to": "0x2222222222222222222222222222222222222222",
                    "value": 1234567890123456789012345, "gas": 21000, "gasPrice": 100000000000,
                    "input": "0x", "nonce": 0
                }]
            }"#,
        )
        .unwrap();

        let normalized = raw.normalize(0).unwrap();
        assert_eq!(normalized.transactions[0].value, "1234567890123456789012345");
    }
}
