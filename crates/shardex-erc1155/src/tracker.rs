//! ERC1155 multi-token tracker.
//!
//! `TransferBatch` logs fan out into one [`ContractEvent`] per `(id, value)`
//! pair, so every stored event carries a single token id.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use primitive_types::U256;
use shardex::abi::{AbiValue, ContractCaller, DecodedLog};
use shardex::etl::tracker::{drain_dirty, is_zero_address, ReconcileReport, TokenTracker};
use shardex::etl::Fingerprint;
use shardex::rpc::ChainClient;
use shardex::types::{Contract, ContractEvent, ContractEventType, Log, TokenStandard};
use shardex_common::{decimal_to_u256, MetadataResolver};

use crate::abi::erc1155_abi;
use crate::identification::{fetch_metadata, fingerprint};
use crate::storage::{Erc1155Balance, Erc1155Storage, Erc1155Token};

const LOG_TARGET: &str = "shardex_erc1155::tracker";

#[derive(Debug, Clone)]
pub struct Erc1155TrackerConfig {
    pub batch_size: usize,
}

impl Default for Erc1155TrackerConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    TransferSingle,
    TransferBatch,
    ApprovalForAll,
}

impl EventKind {
    fn name(self) -> &'static str {
        match self {
            Self::TransferSingle => "TransferSingle",
            Self::TransferBatch => "TransferBatch",
            Self::ApprovalForAll => "ApprovalForAll",
        }
    }
}

pub struct Erc1155Tracker {
    storage: Arc<Erc1155Storage>,
    caller: ContractCaller,
    resolver: MetadataResolver,
    fingerprint: Fingerprint,
    topics: [(String, EventKind); 3],
    config: Erc1155TrackerConfig,
}

impl Erc1155Tracker {
    pub fn new(
        storage: Arc<Erc1155Storage>,
        client: ChainClient,
        resolver: MetadataResolver,
        config: Erc1155TrackerConfig,
    ) -> Result<Self> {
        let abi = Arc::new(erc1155_abi());
        let topics = [
            (abi.topic("TransferSingle")?, EventKind::TransferSingle),
            (abi.topic("TransferBatch")?, EventKind::TransferBatch),
            (abi.topic("ApprovalForAll")?, EventKind::ApprovalForAll),
        ];
        Ok(Self {
            caller: ContractCaller::new(abi, client),
            fingerprint: fingerprint(),
            storage,
            resolver,
            topics,
            config,
        })
    }

    pub fn storage(&self) -> &Arc<Erc1155Storage> {
        &self.storage
    }

    fn event_kind(&self, log: &Log) -> Option<EventKind> {
        let topic0 = log.topic0()?.to_ascii_lowercase();
        self.topics
            .iter()
            .find(|(topic, _)| *topic == topic0)
            .map(|(_, kind)| *kind)
    }

    fn decode_events(&self, token: &str, log: &Log) -> Result<Vec<ContractEvent>> {
        let Some(kind) = self.event_kind(log) else {
            return Ok(Vec::new());
        };
        let decoded = self
            .caller
            .abi()
            .decode_log(kind.name(), &log.data, &log.topics)?;

        let event = |from: String,
                     to: String,
                     token_id: Option<U256>,
                     value: String,
                     event_type: ContractEventType| {
            ContractEvent {
                token: token.to_string(),
                from,
                to,
                value,
                token_id: token_id.map(|id| id.to_string()),
                standard: TokenStandard::Erc1155,
                event_type,
                block_number: log.block_number,
                transaction_hash: log.transaction_hash.clone(),
                transaction_index: log.transaction_index,
                log_index: log.log_index,
            }
        };

        match kind {
            EventKind::TransferSingle => {
                let id = uint(&decoded, "id")?;
                let value = uint(&decoded, "value")?;
                Ok(vec![event(
                    address(&decoded, "from")?,
                    address(&decoded, "to")?,
                    Some(id),
                    value.to_string(),
                    ContractEventType::Transfer,
                )])
            }
            EventKind::TransferBatch => {
                let from = address(&decoded, "from")?;
                let to = address(&decoded, "to")?;
                let ids = decoded
                    .uint_array("ids")
                    .ok_or_else(|| anyhow!("TransferBatch without ids"))?;
                let values = decoded
                    .uint_array("values")
                    .ok_or_else(|| anyhow!("TransferBatch without values"))?;
                if ids.len() != values.len() {
                    bail!(
                        "TransferBatch with {} ids and {} values",
                        ids.len(),
                        values.len()
                    );
                }
                Ok(ids
                    .into_iter()
                    .zip(values)
                    .map(|(id, value)| {
                        event(
                            from.clone(),
                            to.clone(),
                            Some(id),
                            value.to_string(),
                            ContractEventType::Transfer,
                        )
                    })
                    .collect())
            }
            EventKind::ApprovalForAll => {
                let approved = decoded.bool("approved").unwrap_or(false);
                Ok(vec![event(
                    address(&decoded, "account")?,
                    address(&decoded, "operator")?,
                    None,
                    u8::from(approved).to_string(),
                    ContractEventType::ApprovalForAll,
                )])
            }
        }
    }

    async fn reconcile_balance(&self, balance: Erc1155Balance) -> Result<()> {
        let id = decimal_to_u256(&balance.token_id)?;
        let result = self
            .caller
            .call(
                &balance.token,
                "balanceOfBatch",
                &[
                    AbiValue::Array(vec![AbiValue::address(&balance.owner)]),
                    AbiValue::Array(vec![AbiValue::uint(id)]),
                ],
            )
            .await
            .with_context(|| {
                format!(
                    "balanceOfBatch({}, {}) on {}",
                    balance.owner, balance.token_id, balance.token
                )
            })?;
        let amount = result
            .as_array()
            .and_then(|values| values.first())
            .and_then(AbiValue::as_uint)
            .ok_or_else(|| anyhow!("balanceOfBatch returned no balance"))?;

        self.storage.set_balance(
            &balance.owner,
            &balance.token,
            &balance.token_id,
            &amount.to_string(),
        )?;

        self.fill_asset_metadata(&balance.token, &balance.token_id, id)
            .await
    }

    async fn fill_asset_metadata(&self, token: &str, token_id: &str, id: U256) -> Result<()> {
        let has_metadata = self
            .storage
            .get_asset(token, token_id)?
            .is_some_and(|asset| asset.metadata.is_some());
        if has_metadata {
            return Ok(());
        }

        let uri = match self.caller.call(token, "uri", &[AbiValue::uint(id)]).await {
            Ok(value) => value.as_string(),
            Err(e) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    token = %token,
                    token_id = %token_id,
                    error = %e,
                    "uri failed"
                );
                None
            }
        };
        let Some(uri) = uri else {
            return Ok(());
        };

        let metadata = self
            .resolver
            .resolve_for_token(&uri, id)
            .await
            .map(|doc| doc.to_string());
        self.storage
            .set_asset_metadata(token, token_id, &uri, metadata.as_deref())
    }

    pub fn refresh_aggregates(&self, token: &str) -> Result<()> {
        let holders = self.storage.holder_count(token)?;
        self.storage.update_holders(token, holders)
    }
}

fn address(decoded: &DecodedLog, field: &str) -> Result<String> {
    decoded
        .address(field)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{} without {field}", decoded.name))
}

fn uint(decoded: &DecodedLog, field: &str) -> Result<U256> {
    decoded
        .uint(field)
        .ok_or_else(|| anyhow!("{} without {field}", decoded.name))
}

#[async_trait]
impl TokenTracker for Erc1155Tracker {
    fn standard(&self) -> TokenStandard {
        TokenStandard::Erc1155
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    async fn add_contract(&self, contract: &Contract) -> Result<bool> {
        if !self.fingerprint.matches(&contract.bytecode) {
            return Ok(false);
        }

        let metadata = fetch_metadata(&self.caller, &self.resolver, &contract.address).await?;
        let inserted = self.storage.insert_token(&Erc1155Token {
            address: contract.address.clone(),
            name: metadata.name,
            symbol: metadata.symbol,
            contract_uri: metadata.contract_uri,
            metadata: Some(metadata.document.to_string()),
            holders: 0,
            transaction_count: 0,
            last_synced_block: contract.block_number.checked_sub(1),
            block_number: contract.block_number,
        })?;

        if inserted {
            tracing::info!(
                target: LOG_TARGET,
                address = %contract.address,
                block = contract.block_number,
                "Registered ERC1155 collection"
            );
        }
        Ok(true)
    }

    fn tokens(&self) -> Result<Vec<String>> {
        self.storage.token_addresses()
    }

    async fn track_events(&self, token: &str, logs: &[Log]) -> Result<Vec<ContractEvent>> {
        let mut events = Vec::new();

        for log in logs {
            let decoded = match self.decode_events(token, log) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        token = %token,
                        tx = %log.transaction_hash,
                        error = %e,
                        "Undecodable log"
                    );
                    continue;
                }
            };

            for event in decoded {
                if event.event_type == ContractEventType::Transfer {
                    if is_zero_address(&event.from) || is_zero_address(&event.to) {
                        continue;
                    }
                    if let Some(id) = &event.token_id {
                        self.storage
                            .mark_dirty(&event.from, token, id, event.block_number)?;
                        self.storage
                            .mark_dirty(&event.to, token, id, event.block_number)?;
                    }
                }
                events.push(event);
            }
        }

        if !events.is_empty() {
            self.storage
                .increment_transaction_count(token, events.len() as u64)?;
        }
        Ok(events)
    }

    fn last_synced_block(&self, token: &str) -> Result<Option<u64>> {
        self.storage.last_synced_block(token)
    }

    fn set_last_synced_block(&self, token: &str, block: u64) -> Result<()> {
        self.storage.set_last_synced_block(token, block)
    }

    async fn on_finish(&self) -> Result<ReconcileReport> {
        let touched = Mutex::new(BTreeSet::new());

        let report = drain_dirty(
            TokenStandard::Erc1155,
            self.config.batch_size,
            |offset, limit| self.storage.dirty_balances(offset, limit),
            |balance: Erc1155Balance| {
                if let Ok(mut touched) = touched.lock() {
                    touched.insert(balance.token.clone());
                }
                self.reconcile_balance(balance)
            },
        )
        .await?;

        let touched = touched
            .into_inner()
            .map_err(|_| anyhow!("touched token set poisoned"))?;
        for token in &touched {
            if let Err(e) = self.refresh_aggregates(token) {
                tracing::warn!(target: LOG_TARGET, token = %token, error = %e, "Aggregate refresh failed");
            }
        }

        if report.updated + report.failed > 0 {
            tracing::info!(
                target: LOG_TARGET,
                updated = report.updated,
                failed = report.failed,
                tokens = touched.len(),
                "Reconciled balances"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardex::rpc::ChainClientConfig;
    use shardex::testing::{address_topic, string_output, word, ScriptedTransport};
    use shardex::types::ZERO_ADDRESS;
    use shardex_common::MetadataResolverConfig;

    const COLLECTION: &str = "0x00000000000000000000000000000000000000c9";
    const OPERATOR: &str = "0x00000000000000000000000000000000000000ee";
    const ALICE: &str = "0x00000000000000000000000000000000000000a1";
    const BOB: &str = "0x00000000000000000000000000000000000000b0";
    const TRANSFER_SINGLE: &str = "0xc3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62";
    const TRANSFER_BATCH: &str = "0x4a39dc06d4c0dbc64b70af90fd698a233a518aa5d07e595d983b8c0526c8f7fb";
    const APPROVAL_FOR_ALL: &str = "0x17307eab39ab6107e8899845ad3d59bd9653f200f220920489ca2b5937696c31";

    fn tracker(transport: ScriptedTransport) -> Erc1155Tracker {
        let client = ChainClient::new(0, Arc::new(transport), ChainClientConfig::default());
        Erc1155Tracker::new(
            Arc::new(Erc1155Storage::in_memory().unwrap()),
            client,
            MetadataResolver::new(MetadataResolverConfig::default()).unwrap(),
            Erc1155TrackerConfig::default(),
        )
        .unwrap()
    }

    fn transfer_topics(topic0: &str, from: &str, to: &str) -> Vec<String> {
        vec![
            topic0.to_string(),
            address_topic(OPERATOR),
            address_topic(from),
            address_topic(to),
        ]
    }

    fn transfer_single(from: &str, to: &str, id: u64, value: u64, block: u64) -> Log {
        Log {
            address: COLLECTION.to_string(),
            topics: transfer_topics(TRANSFER_SINGLE, from, to),
            data: format!("0x{id:064x}{value:064x}"),
            block_number: block,
            transaction_hash: format!("0x{block:064x}"),
            ..Default::default()
        }
    }

    /// `balanceOfBatch([owner], [id])` call data.
    fn balance_of_batch(owner: &str, id: u64) -> String {
        format!(
            "0x4e1273f4{}{}{}{}{}{}",
            word("40"),
            word("80"),
            word("1"),
            word(owner),
            word("1"),
            word(&format!("{id:x}"))
        )
    }

    fn balances_output(value: u64) -> String {
        format!("0x{}{}{value:064x}", word("20"), word("1"))
    }

    #[tokio::test]
    async fn test_transfer_batch_expands_per_id() {
        let tracker = tracker(ScriptedTransport::new(0));
        let log = Log {
            address: COLLECTION.to_string(),
            topics: transfer_topics(TRANSFER_BATCH, ALICE, BOB),
            data: format!(
                "0x{}{}{}{}{}{}{}{}",
                word("40"),
                word("a0"),
                word("2"),
                word("1"),
                word("2"),
                word("2"),
                word("5"),
                word("6"),
            ),
            block_number: 12,
            ..Default::default()
        };

        let events = tracker.track_events(COLLECTION, &[log]).await.unwrap();
        let pairs: Vec<_> = events
            .iter()
            .map(|e| (e.token_id.clone().unwrap(), e.value.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("1".to_string(), "5".to_string()),
                ("2".to_string(), "6".to_string())
            ]
        );
        assert!(events.iter().all(|e| e.event_type == ContractEventType::Transfer));
        // Both sides for both ids.
        assert_eq!(tracker.storage().dirty_count().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_approval_for_all_revoked() {
        let tracker = tracker(ScriptedTransport::new(0));
        let log = Log {
            address: COLLECTION.to_string(),
            topics: vec![
                APPROVAL_FOR_ALL.to_string(),
                address_topic(ALICE),
                address_topic(OPERATOR),
            ],
            data: format!("0x{}", word("0")),
            block_number: 3,
            ..Default::default()
        };

        let events = tracker.track_events(COLLECTION, &[log]).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, ContractEventType::ApprovalForAll);
        assert_eq!(events[0].from, ALICE);
        assert_eq!(events[0].to, OPERATOR);
        assert_eq!(events[0].value, "0");
    }

    #[tokio::test]
    async fn test_on_finish_reconciles_balances_and_metadata() {
        let uri = "data:application/json,%7B%22name%22%3A%22Sword%22%7D";
        let transport = ScriptedTransport::new(0)
            .with_call(COLLECTION, &balance_of_batch(ALICE, 3), &balances_output(7))
            .with_call(COLLECTION, &balance_of_batch(BOB, 3), &balances_output(2))
            .with_call(COLLECTION, &format!("0x0e89341c{}", word("3")), &string_output(uri));
        let tracker = tracker(transport);

        let events = tracker
            .track_events(
                COLLECTION,
                &[
                    transfer_single(ZERO_ADDRESS, ALICE, 3, 9, 4),
                    transfer_single(ALICE, BOB, 3, 2, 5),
                ],
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 1);

        let report = tracker.on_finish().await.unwrap();
        assert_eq!(report, ReconcileReport { updated: 2, failed: 0 });

        let alice = tracker.storage().get_balance(ALICE, COLLECTION, "3").unwrap().unwrap();
        assert_eq!(alice.balance, "7");
        assert!(!alice.need_update);
        let bob = tracker.storage().get_balance(BOB, COLLECTION, "3").unwrap().unwrap();
        assert_eq!(bob.balance, "2");

        let asset = tracker.storage().get_asset(COLLECTION, "3").unwrap().unwrap();
        assert_eq!(asset.token_uri.as_deref(), Some(uri));
        assert_eq!(asset.metadata.as_deref(), Some(r#"{"name":"Sword"}"#));
    }

    #[tokio::test]
    async fn test_failed_balance_read_stays_dirty() {
        let tracker = tracker(ScriptedTransport::new(0));
        tracker
            .track_events(COLLECTION, &[transfer_single(ALICE, BOB, 1, 1, 2)])
            .await
            .unwrap();

        let report = tracker.on_finish().await.unwrap();
        assert_eq!(report, ReconcileReport { updated: 0, failed: 2 });
        assert_eq!(tracker.storage().dirty_count().unwrap(), 2);
    }
}
