//! Block range pipeline.
//!
//! For every range: fetch blocks with bodies, resolve `CollectRewards`
//! amounts from receipts, persist blocks and transactions, trace the blocks
//! holding contract interactions, persist internal transactions and register
//! newly created contracts.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::try_join_all;

use super::address_collector::AddressCollector;
use super::discovery::contract_from_trace;
use super::sync_loop::RangeIndexer;
use crate::rpc::ChainClient;
use crate::storage::Storage;
use crate::types::{
    AddressRelationKind, Contract, IndexerKind, InternalTransaction, StakingTransaction,
    Transaction,
};

const LOG_TARGET: &str = "shardex::etl::blocks";

/// `0x` plus a 4-byte selector. Shorter inputs are plain transfers.
const MIN_TRACED_INPUT_LEN: usize = 10;

#[derive(Debug, Clone)]
pub struct BlockIndexerConfig {
    /// Addresses whose transactions are stored but never traced.
    pub ignore_list: HashSet<String>,
    /// Internal transactions are written in chunks of this size.
    pub internal_chunk_size: usize,
}

impl Default for BlockIndexerConfig {
    fn default() -> Self {
        Self {
            ignore_list: HashSet::new(),
            internal_chunk_size: 100,
        }
    }
}

pub struct BlockIndexer {
    client: ChainClient,
    storage: Arc<dyn Storage>,
    config: BlockIndexerConfig,
}

impl BlockIndexer {
    pub fn new(client: ChainClient, storage: Arc<dyn Storage>, mut config: BlockIndexerConfig) -> Self {
        config.ignore_list = config
            .ignore_list
            .iter()
            .map(|a| a.to_ascii_lowercase())
            .collect();
        config.internal_chunk_size = config.internal_chunk_size.max(1);
        Self {
            client,
            storage,
            config,
        }
    }

    fn is_ignored(&self, tx: &Transaction) -> bool {
        self.config.ignore_list.contains(&tx.from)
            || tx
                .to
                .as_ref()
                .is_some_and(|to| self.config.ignore_list.contains(to))
    }

    fn needs_trace(&self, tx: &Transaction) -> bool {
        tx.input.len() > MIN_TRACED_INPUT_LEN && !self.is_ignored(tx)
    }

    async fn resolve_rewards(&self, tx: &mut StakingTransaction) -> Result<()> {
        if !tx.is_collect_rewards() {
            return Ok(());
        }
        let receipt = self.client.get_transaction_receipt(&tx.hash).await?;
        tx.amount = match receipt.as_ref().and_then(|r| r.logs.first()) {
            Some(log) => Some(shardex_common::hex_to_decimal(&log.data)?),
            None => None,
        };
        Ok(())
    }

    /// Traces of `block`, keeping only those of the given transactions.
    async fn trace(&self, block: u64, hashes: HashSet<String>) -> Result<Vec<InternalTransaction>> {
        let traces = self.client.trace_block(block).await?;
        Ok(traces
            .into_iter()
            .filter(|t| hashes.contains(&t.transaction_hash))
            .collect())
    }
}

#[async_trait]
impl RangeIndexer for BlockIndexer {
    fn kind(&self) -> IndexerKind {
        IndexerKind::Blocks
    }

    fn client(&self) -> &ChainClient {
        &self.client
    }

    fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn index_range(
        &self,
        from: u64,
        to: u64,
        collector: &Mutex<AddressCollector>,
    ) -> Result<Option<u64>> {
        let fetched = self.client.get_blocks(from, to).await?;
        let Some(highest) = fetched.iter().map(|b| b.block.number).max() else {
            return Ok(None);
        };

        let mut blocks = Vec::with_capacity(fetched.len());
        let mut transactions = Vec::new();
        let mut staking = Vec::new();
        for body in fetched {
            blocks.push(body.block);
            transactions.extend(body.transactions);
            staking.extend(body.staking_transactions);
        }

        try_join_all(staking.iter_mut().map(|tx| self.resolve_rewards(tx))).await?;

        self.storage.add_blocks(&blocks)?;
        self.storage.add_transactions(&transactions)?;
        self.storage.add_staking_transactions(&staking)?;

        {
            let mut collector = collector.lock().unwrap_or_else(|p| p.into_inner());
            for tx in &transactions {
                collector.add(
                    tx.block_number,
                    &tx.hash,
                    AddressRelationKind::Transaction,
                    std::iter::once(tx.from.as_str()).chain(tx.to.as_deref()),
                );
            }
            for tx in &staking {
                collector.add(
                    tx.block_number,
                    &tx.hash,
                    AddressRelationKind::StakingTransaction,
                    [
                        Some(tx.from.as_str()),
                        tx.delegator_address.as_deref(),
                        tx.validator_address.as_deref(),
                    ]
                    .into_iter()
                    .flatten(),
                );
            }
        }

        let mut traced: BTreeMap<u64, HashSet<String>> = BTreeMap::new();
        for tx in transactions.iter().filter(|tx| self.needs_trace(tx)) {
            traced
                .entry(tx.block_number)
                .or_default()
                .insert(tx.hash.clone());
        }

        let internal: Vec<InternalTransaction> =
            try_join_all(traced.into_iter().map(|(block, hashes)| self.trace(block, hashes)))
                .await?
                .into_iter()
                .flatten()
                .collect();

        if !internal.is_empty() {
            {
                let mut collector = collector.lock().unwrap_or_else(|p| p.into_inner());
                for trace in &internal {
                    collector.add(
                        trace.block_number,
                        &trace.transaction_hash,
                        AddressRelationKind::InternalTransaction,
                        [trace.from.as_str(), trace.to.as_str()],
                    );
                }
            }

            for chunk in internal.chunks(self.config.internal_chunk_size) {
                self.storage.add_internal_transactions(chunk)?;
            }

            let contracts: Vec<Contract> = internal.iter().filter_map(contract_from_trace).collect();
            if !contracts.is_empty() {
                let added = self.storage.add_contracts(&contracts)?;
                tracing::debug!(
                    target: LOG_TARGET,
                    shard = self.client.shard(),
                    from,
                    to,
                    discovered = contracts.len(),
                    added,
                    "Registered contracts"
                );
            }
        }

        tracing::trace!(
            target: LOG_TARGET,
            shard = self.client.shard(),
            from,
            to,
            blocks = blocks.len(),
            transactions = transactions.len(),
            staking_transactions = staking.len(),
            internal_transactions = internal.len(),
            "Indexed block range"
        );

        Ok(Some(highest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{ChainClientConfig, RpcError};
    use crate::storage::{Comparator, Filter, SqliteStorage};
    use crate::testing::ScriptedTransport;
    use serde_json::{json, Value};

    const ALICE: &str = "0x00000000000000000000000000000000000000a1";
    const BOB: &str = "0x00000000000000000000000000000000000000b2";
    const VALIDATOR: &str = "0x00000000000000000000000000000000000000c3";
    const CREATED: &str = "0x00000000000000000000000000000000000000d4";

    fn raw_block(number: u64) -> Value {
        json!({
            "number": number,
            "hash": format!("0xb{number}"),
            "parentHash": format!("0xb{}", number.saturating_sub(1)),
            "miner": ALICE,
            "timestamp": 1_700_000_000 + number,
            "transactions": [
                {
                    "hash": format!("0xpay{number}"),
                    "blockNumber": number,
                    "transactionIndex": 0,
                    "from": ALICE,
                    "to": BOB,
                    "value": 5,
                    "input": "0x"
                },
                {
                    "hash": format!("0xdeploy{number}"),
                    "blockNumber": number,
                    "transactionIndex": 1,
                    "from": ALICE,
                    "to": null,
                    "value": 0,
                    "input": "0x6080604052348015600f57600080fd5b50"
                }
            ],
            "stakingTransactions": [
                {
                    "hash": format!("0xrewards{number}"),
                    "blockNumber": number,
                    "transactionIndex": 0,
                    "from": ALICE,
                    "type": "CollectRewards",
                    "msg": {"delegatorAddress": ALICE}
                },
                {
                    "hash": format!("0xdelegate{number}"),
                    "blockNumber": number,
                    "transactionIndex": 1,
                    "from": ALICE,
                    "type": "Delegate",
                    "msg": {"delegatorAddress": ALICE, "validatorAddress": VALIDATOR, "amount": 100}
                }
            ]
        })
    }

    fn transport() -> ScriptedTransport {
        ScriptedTransport::new(0)
            .with_handler("hmyv2_getBlocks", |params| {
                let from = params[0].as_u64().unwrap();
                let to = params[1].as_u64().unwrap();
                Ok(json!((from..=to).map(raw_block).collect::<Vec<_>>()))
            })
            .with_handler("hmyv2_getTransactionReceipt", |params| {
                Ok(json!({
                    "transactionHash": params[0],
                    "blockNumber": 1,
                    "status": 1,
                    "logs": [{"address": ALICE, "topics": [], "data": "0x3e8"}]
                }))
            })
            .with_handler("trace_block", |params| {
                let number = u64::from_str_radix(params[0].as_str().unwrap().trim_start_matches("0x"), 16).unwrap();
                Ok(json!([
                    {
                        "type": "create",
                        "action": {"from": ALICE, "value": "0x0", "gas": "0x10", "init": "0x60806040"},
                        "result": {"address": CREATED, "code": "0x6080", "gasUsed": "0x5"},
                        "transactionHash": format!("0xdeploy{number}"),
                        "blockNumber": number
                    },
                    {
                        "type": "call",
                        "action": {"callType": "call", "from": CREATED, "to": BOB, "value": "0x1", "gas": "0x10", "input": "0x"},
                        "result": {"gasUsed": "0x1", "output": "0x"},
                        "transactionHash": format!("0xdeploy{number}"),
                        "blockNumber": number
                    },
                    {
                        "type": "call",
                        "action": {"callType": "call", "from": ALICE, "to": BOB, "value": "0x5", "gas": "0x10", "input": "0x"},
                        "result": {"gasUsed": "0x1", "output": "0x"},
                        "transactionHash": format!("0xpay{number}"),
                        "blockNumber": number
                    }
                ]))
            })
    }

    fn indexer(transport: ScriptedTransport, config: BlockIndexerConfig) -> BlockIndexer {
        BlockIndexer::new(
            ChainClient::new(0, Arc::new(transport), ChainClientConfig::default()),
            Arc::new(SqliteStorage::in_memory(0).unwrap()),
            config,
        )
    }

    #[tokio::test]
    async fn test_index_range_persists_everything() {
        let indexer = indexer(transport(), BlockIndexerConfig::default());
        let collector = Mutex::new(AddressCollector::new());

        let reached = indexer.index_range(3, 4, &collector).await.unwrap();
        assert_eq!(reached, Some(4));

        let storage = indexer.storage();
        assert_eq!(storage.get_blocks(&Filter::new()).unwrap().len(), 2);
        assert_eq!(storage.get_transactions(&Filter::new()).unwrap().len(), 4);

        let staking = storage
            .get_staking_transactions(&Filter::new().with("hash", Comparator::Eq, "0xrewards3"))
            .unwrap();
        assert_eq!(staking[0].amount.as_deref(), Some("1000"));

        // Only the deploy transaction has a selector-length input.
        let internal = storage.get_internal_transactions(&Filter::new()).unwrap();
        assert_eq!(internal.len(), 4);
        assert!(internal.iter().all(|t| t.transaction_hash.starts_with("0xdeploy")));

        let contracts = storage.get_contracts(&Filter::new()).unwrap();
        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].address, CREATED);
        assert_eq!(contracts[0].block_number, 3);

        let relations = collector.lock().unwrap().drain();
        assert!(relations
            .iter()
            .any(|r| r.address == VALIDATOR && r.kind == AddressRelationKind::StakingTransaction));
        assert!(relations
            .iter()
            .any(|r| r.address == CREATED && r.kind == AddressRelationKind::InternalTransaction));
    }

    #[tokio::test]
    async fn test_ignore_list_skips_tracing() {
        let transport = transport();
        let config = BlockIndexerConfig {
            ignore_list: [ALICE.to_ascii_uppercase().replace("0X", "0x")].into_iter().collect(),
            ..Default::default()
        };
        let indexer = indexer(transport, config);
        let collector = Mutex::new(AddressCollector::new());

        indexer.index_range(1, 1, &collector).await.unwrap();

        let storage = indexer.storage();
        assert_eq!(storage.get_transactions(&Filter::new()).unwrap().len(), 2);
        assert!(storage.get_internal_transactions(&Filter::new()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_range_reaches_nothing() {
        let transport = ScriptedTransport::new(0).with_result("hmyv2_getBlocks", json!([]));
        let indexer = indexer(transport, BlockIndexerConfig::default());
        let collector = Mutex::new(AddressCollector::new());

        assert_eq!(indexer.index_range(9, 9, &collector).await.unwrap(), None);
        assert!(collector.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trace_failure_fails_range() {
        let transport = transport().with_handler("trace_block", |_| {
            Err(RpcError::Protocol {
                code: -32000,
                message: "trace unavailable".to_string(),
            })
        });
        let indexer = indexer(transport, BlockIndexerConfig::default());
        let collector = Mutex::new(AddressCollector::new());

        assert!(indexer.index_range(1, 1, &collector).await.is_err());
        // Blocks are idempotent and stay for the retry.
        assert_eq!(indexer.storage().get_blocks(&Filter::new()).unwrap().len(), 1);
    }
}
