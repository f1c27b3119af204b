//! ERC721 collection tracker.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use shardex::abi::{AbiValue, ContractCaller, DecodedLog};
use shardex::etl::tracker::{drain_dirty, is_zero_address, ReconcileReport, TokenTracker};
use shardex::etl::Fingerprint;
use shardex::rpc::ChainClient;
use shardex::types::{Contract, ContractEvent, ContractEventType, Log, TokenStandard, ZERO_ADDRESS};
use shardex_common::{decimal_to_u256, MetadataResolver};

use crate::abi::erc721_abi;
use crate::identification::{fetch_metadata, fingerprint};
use crate::storage::{Erc721Asset, Erc721Storage, Erc721Token};

const LOG_TARGET: &str = "shardex_erc721::tracker";

#[derive(Debug, Clone)]
pub struct Erc721TrackerConfig {
    pub batch_size: usize,
}

impl Default for Erc721TrackerConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

pub struct Erc721Tracker {
    storage: Arc<Erc721Storage>,
    caller: ContractCaller,
    resolver: MetadataResolver,
    fingerprint: Fingerprint,
    topics: [(String, ContractEventType); 3],
    config: Erc721TrackerConfig,
}

impl Erc721Tracker {
    pub fn new(
        storage: Arc<Erc721Storage>,
        client: ChainClient,
        resolver: MetadataResolver,
        config: Erc721TrackerConfig,
    ) -> Result<Self> {
        let abi = Arc::new(erc721_abi());
        let topics = [
            (abi.topic("Transfer")?, ContractEventType::Transfer),
            (abi.topic("Approval")?, ContractEventType::Approval),
            (abi.topic("ApprovalForAll")?, ContractEventType::ApprovalForAll),
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

    pub fn storage(&self) -> &Arc<Erc721Storage> {
        &self.storage
    }

    fn event_type(&self, log: &Log) -> Option<ContractEventType> {
        let topic0 = log.topic0()?.to_ascii_lowercase();
        self.topics
            .iter()
            .find(|(topic, _)| *topic == topic0)
            .map(|(_, kind)| *kind)
    }

    fn decode_event(&self, token: &str, log: &Log) -> Result<Option<ContractEvent>> {
        let Some(event_type) = self.event_type(log) else {
            return Ok(None);
        };
        let decoded = self
            .caller
            .abi()
            .decode_log(event_type.as_str(), &log.data, &log.topics)?;

        let (from, to, token_id, value) = match event_type {
            ContractEventType::Transfer => (
                address(&decoded, "from")?,
                address(&decoded, "to")?,
                Some(token_id(&decoded)?),
                "1".to_string(),
            ),
            ContractEventType::Approval => (
                address(&decoded, "owner")?,
                address(&decoded, "approved")?,
                Some(token_id(&decoded)?),
                "1".to_string(),
            ),
            ContractEventType::ApprovalForAll => {
                let approved = decoded.bool("approved").unwrap_or(false);
                (
                    address(&decoded, "owner")?,
                    address(&decoded, "operator")?,
                    None,
                    u8::from(approved).to_string(),
                )
            }
        };

        Ok(Some(ContractEvent {
            token: token.to_string(),
            from,
            to,
            value,
            token_id,
            standard: TokenStandard::Erc721,
            event_type,
            block_number: log.block_number,
            transaction_hash: log.transaction_hash.clone(),
            transaction_index: log.transaction_index,
            log_index: log.log_index,
        }))
    }

    async fn reconcile_asset(&self, asset: Erc721Asset) -> Result<()> {
        let id = decimal_to_u256(&asset.token_id)?;
        let owner = self
            .caller
            .call(&asset.token, "ownerOf", &[AbiValue::uint(id)])
            .await
            .with_context(|| format!("ownerOf({}) on {}", asset.token_id, asset.token))?;
        let owner = owner
            .as_address()
            .ok_or_else(|| anyhow!("ownerOf returned a non-address value"))?
            .to_string();

        let mut token_uri = None;
        let mut metadata = None;
        if asset.metadata.is_none() {
            match self.caller.call(&asset.token, "tokenURI", &[AbiValue::uint(id)]).await {
                Ok(value) => {
                    if let Some(uri) = value.as_string() {
                        metadata = self.resolver.resolve(&uri).await.map(|doc| doc.to_string());
                        token_uri = Some(uri);
                    }
                }
                Err(e) => tracing::debug!(
                    target: LOG_TARGET,
                    token = %asset.token,
                    token_id = %asset.token_id,
                    error = %e,
                    "tokenURI failed"
                ),
            }
        }

        self.storage.set_asset(
            &asset.token,
            &asset.token_id,
            &owner,
            token_uri.as_deref(),
            metadata.as_deref(),
        )
    }

    pub async fn refresh_aggregates(&self, token: &str) -> Result<()> {
        let total_supply = match self.caller.call(token, "totalSupply", &[]).await {
            Ok(value) => value.as_uint().map(|v| v.to_string()),
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, token = %token, error = %e, "totalSupply failed");
                None
            }
        };
        let holders = self.storage.holder_count(token, ZERO_ADDRESS)?;
        self.storage
            .update_aggregates(token, total_supply.as_deref(), holders)
    }
}

fn address(decoded: &DecodedLog, field: &str) -> Result<String> {
    decoded
        .address(field)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{} without {field}", decoded.name))
}

fn token_id(decoded: &DecodedLog) -> Result<String> {
    decoded
        .uint("tokenId")
        .map(|id| id.to_string())
        .ok_or_else(|| anyhow!("{} without tokenId", decoded.name))
}

#[async_trait]
impl TokenTracker for Erc721Tracker {
    fn standard(&self) -> TokenStandard {
        TokenStandard::Erc721
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    async fn add_contract(&self, contract: &Contract) -> Result<bool> {
        if !self.fingerprint.matches(&contract.bytecode) {
            return Ok(false);
        }

        let (name, symbol) = fetch_metadata(&self.caller, &contract.address).await?;
        let inserted = self.storage.insert_token(&Erc721Token {
            address: contract.address.clone(),
            name,
            symbol,
            total_supply: "0".to_string(),
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
                "Registered ERC721 collection"
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
            let event = match self.decode_event(token, log) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
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

            if event.event_type == ContractEventType::Transfer {
                if is_zero_address(&event.from) || is_zero_address(&event.to) {
                    continue;
                }
                if let Some(id) = &event.token_id {
                    self.storage.mark_dirty(token, id, &event.to, event.block_number)?;
                }
            }
            events.push(event);
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
            TokenStandard::Erc721,
            self.config.batch_size,
            |offset, limit| self.storage.dirty_assets(offset, limit),
            |asset: Erc721Asset| {
                if let Ok(mut touched) = touched.lock() {
                    touched.insert(asset.token.clone());
                }
                self.reconcile_asset(asset)
            },
        )
        .await?;

        let touched = touched
            .into_inner()
            .map_err(|_| anyhow!("touched token set poisoned"))?;
        for token in &touched {
            if let Err(e) = self.refresh_aggregates(token).await {
                tracing::warn!(target: LOG_TARGET, token = %token, error = %e, "Aggregate refresh failed");
            }
        }

        if report.updated + report.failed > 0 {
            tracing::info!(
                target: LOG_TARGET,
                updated = report.updated,
                failed = report.failed,
                tokens = touched.len(),
                "Reconciled assets"
            );
        }
        Ok(report)
    }
}
