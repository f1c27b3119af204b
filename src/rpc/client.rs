//! Typed chain procedures over a [`Transport`].

use std::collections::HashSet;
use std::sync::Arc;

use primitive_types::U256;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::types::{
    canonical_address, flatten_traces, quantity_u256, quantity_u64, BlockWithTransactions,
    RawBlock, RawLog, RawReceipt, RawTrace, RawTransaction,
};
use super::{EndpointPool, RpcError, Transport};
use crate::types::{InternalTransaction, Log, Receipt, ShardId, Transaction, TransactionCountKind};

const LOG_TARGET: &str = "shardex::rpc::client";

#[derive(Debug, Clone, Default)]
pub struct ChainClientConfig {
    /// Blocks whose traces are known to be unavailable on this chain.
    /// `trace_block` returns an empty result for them.
    pub trace_deny_list: HashSet<u64>,
}

/// Log query. `None` fields are omitted from the request.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub address: Option<Vec<String>>,
    pub topics: Option<Vec<Option<String>>>,
}

#[derive(Clone)]
pub struct ChainClient {
    shard: ShardId,
    transport: Arc<dyn Transport>,
    config: ChainClientConfig,
}

impl ChainClient {
    pub fn new(shard: ShardId, transport: Arc<dyn Transport>, config: ChainClientConfig) -> Self {
        Self {
            shard,
            transport,
            config,
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        self.transport.pool()
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let value = self.transport.request(method, params).await?;
        serde_json::from_value(value).map_err(|e| RpcError::decode(method, e))
    }

    /// Current head height.
    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let value: Value = self.request("hmyv2_blockNumber", json!([])).await?;
        quantity_u64(&value)
    }

    /// Inclusive range of blocks with full transaction and staking transaction bodies.
    pub async fn get_blocks(&self, from: u64, to: u64) -> Result<Vec<BlockWithTransactions>, RpcError> {
        let raw: Option<Vec<RawBlock>> = self
            .request(
                "hmyv2_getBlocks",
                json!([from, to, {"withSigners": false, "fullTx": true, "inclStaking": true}]),
            )
            .await?;
        raw.unwrap_or_default()
            .into_iter()
            .map(|b| b.normalize(self.shard))
            .collect()
    }

    pub async fn get_block_by_number(&self, number: u64) -> Result<Option<BlockWithTransactions>, RpcError> {
        let raw: Option<RawBlock> = self
            .request(
                "hmyv2_getBlockByNumber",
                json!([number, {"fullTx": true, "inclTx": true, "inclStaking": true}]),
            )
            .await?;
        raw.map(|b| b.normalize(self.shard)).transpose()
    }

    pub async fn get_transaction_by_hash(&self, hash: &str) -> Result<Option<Transaction>, RpcError> {
        let raw: Option<RawTransaction> = self
            .request("hmyv2_getTransactionByHash", json!([hash]))
            .await?;
        raw.map(|tx| tx.normalize(self.shard, 0)).transpose()
    }

    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, RpcError> {
        let mut query = json!({
            "fromBlock": format!("{:#x}", filter.from_block),
            "toBlock": format!("{:#x}", filter.to_block),
        });
        if let Some(address) = &filter.address {
            query["address"] = json!(address);
        }
        if let Some(topics) = &filter.topics {
            query["topics"] = json!(topics);
        }

        let raw: Option<Vec<RawLog>> = self.request("eth_getLogs", json!([query])).await?;
        raw.unwrap_or_default()
            .into_iter()
            .map(RawLog::normalize)
            .collect()
    }

    /// Balance in the chain's base unit.
    pub async fn get_balance(&self, address: &str) -> Result<U256, RpcError> {
        let value: Value = self.request("hmyv2_getBalance", json!([address])).await?;
        quantity_u256(&value)
    }

    pub async fn get_transactions_count(
        &self,
        address: &str,
        kind: TransactionCountKind,
    ) -> Result<u64, RpcError> {
        let value: Value = self
            .request("hmyv2_getTransactionsCount", json!([address, kind.as_str()]))
            .await?;
        quantity_u64(&value)
    }

    pub async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<Receipt>, RpcError> {
        let raw: Option<RawReceipt> = self
            .request("hmyv2_getTransactionReceipt", json!([hash]))
            .await?;
        raw.map(RawReceipt::normalize).transpose()
    }

    /// Flattened traces of every transaction in the block.
    pub async fn trace_block(&self, number: u64) -> Result<Vec<InternalTransaction>, RpcError> {
        if self.config.trace_deny_list.contains(&number) {
            tracing::debug!(
                target: LOG_TARGET,
                shard = self.shard,
                block = number,
                "Skipping trace for denied block"
            );
            return Ok(Vec::new());
        }

        let raw: Option<Vec<RawTrace>> = self
            .request("trace_block", json!([format!("{number:#x}")]))
            .await?;
        flatten_traces(raw.unwrap_or_default())
    }

    /// `eth_call` against the latest state. Returns the raw hex output.
    pub async fn call(&self, to: &str, data: &str) -> Result<String, RpcError> {
        self.request("eth_call", json!([{"to": to, "data": data}, "latest"]))
            .await
    }

    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        let value: Value = self.request("eth_chainId", json!([])).await?;
        quantity_u64(&value)
    }

    /// Normalise an address returned by any method.
    pub fn canonical_address(address: &str) -> Result<String, RpcError> {
        canonical_address(address)
    }
}
