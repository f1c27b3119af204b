//! ERC20 token tracker.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use shardex::abi::{Abi, AbiValue, ContractCaller};
use shardex::etl::tracker::{drain_dirty, is_zero_address, ReconcileReport, TokenTracker};
use shardex::etl::Fingerprint;
use shardex::rpc::ChainClient;
use shardex::types::{Contract, ContractEvent, ContractEventType, Log, TokenStandard};

use crate::abi::erc20_abi;
use crate::identification::{fetch_metadata, fingerprint};
use crate::storage::{Erc20Balance, Erc20Storage, Erc20Token};

const LOG_TARGET: &str = "shardex_erc20::tracker";

#[derive(Debug, Clone)]
pub struct Erc20TrackerConfig {
    /// Logs per replay page and dirty balances per reconciliation page.
    pub batch_size: usize,
}

impl Default for Erc20TrackerConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

pub struct Erc20Tracker {
    storage: Arc<Erc20Storage>,
    caller: ContractCaller,
    fingerprint: Fingerprint,
    transfer_topic: String,
    approval_topic: String,
    config: Erc20TrackerConfig,
}

impl Erc20Tracker {
    pub fn new(storage: Arc<Erc20Storage>, client: ChainClient, config: Erc20TrackerConfig) -> Result<Self> {
        let abi = Arc::new(erc20_abi());
        Ok(Self {
            transfer_topic: abi.topic("Transfer")?,
            approval_topic: abi.topic("Approval")?,
            caller: ContractCaller::new(abi, client),
            fingerprint: fingerprint(),
            storage,
            config,
        })
    }

    pub fn storage(&self) -> &Arc<Erc20Storage> {
        &self.storage
    }

    fn abi(&self) -> &Abi {
        self.caller.abi()
    }

    fn decode_event(&self, token: &str, log: &Log) -> Result<Option<ContractEvent>> {
        let Some(topic0) = log.topic0().map(str::to_ascii_lowercase) else {
            return Ok(None);
        };

        let (event_type, decoded, from_field, to_field) = if topic0 == self.transfer_topic {
            (
                ContractEventType::Transfer,
                self.abi().decode_log("Transfer", &log.data, &log.topics)?,
                "from",
                "to",
            )
        } else if topic0 == self.approval_topic {
            (
                ContractEventType::Approval,
                self.abi().decode_log("Approval", &log.data, &log.topics)?,
                "owner",
                "spender",
            )
        } else {
            return Ok(None);
        };

        let from = decoded
            .address(from_field)
            .ok_or_else(|| anyhow!("{} without {from_field}", event_type.as_str()))?;
        let to = decoded
            .address(to_field)
            .ok_or_else(|| anyhow!("{} without {to_field}", event_type.as_str()))?;
        let value = decoded.uint("value").unwrap_or_default();

        Ok(Some(ContractEvent {
            token: token.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            value: value.to_string(),
            token_id: None,
            standard: TokenStandard::Erc20,
            event_type,
            block_number: log.block_number,
            transaction_hash: log.transaction_hash.clone(),
            transaction_index: log.transaction_index,
            log_index: log.log_index,
        }))
    }

    async fn reconcile_balance(&self, balance: Erc20Balance) -> Result<()> {
        let value = self
            .caller
            .call(&balance.token, "balanceOf", &[AbiValue::address(&balance.owner)])
            .await
            .with_context(|| format!("balanceOf({}) on {}", balance.owner, balance.token))?;
        let amount = value
            .as_uint()
            .ok_or_else(|| anyhow!("balanceOf returned a non-numeric value"))?;
        self.storage
            .set_balance(&balance.owner, &balance.token, &amount.to_string())
    }

    /// Recompute holders and re-read the total supply of `token`.
    pub async fn refresh_aggregates(&self, token: &str) -> Result<()> {
        let total_supply = match self.caller.call(token, "totalSupply", &[]).await {
            Ok(value) => value.as_uint().map(|v| v.to_string()),
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, token = %token, error = %e, "totalSupply failed");
                None
            }
        };
        let holders = self.storage.holder_count(token)?;
        self.storage.update_aggregates(
            token,
            total_supply.as_deref(),
            total_supply.as_deref(),
            holders,
        )
    }
}

#[async_trait]
impl TokenTracker for Erc20Tracker {
    fn standard(&self) -> TokenStandard {
        TokenStandard::Erc20
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    async fn add_contract(&self, contract: &Contract) -> Result<bool> {
        if !self.fingerprint.matches(&contract.bytecode) {
            return Ok(false);
        }

        let metadata = fetch_metadata(&self.caller, &contract.address).await?;
        let inserted = self.storage.insert_token(&Erc20Token {
            address: contract.address.clone(),
            name: metadata.name,
            symbol: metadata.symbol,
            decimals: metadata.decimals,
            total_supply: "0".to_string(),
            circulating_supply: "0".to_string(),
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
                "Registered ERC20 token"
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
                // Mints and burns
                if is_zero_address(&event.from) || is_zero_address(&event.to) {
                    continue;
                }
                self.storage.mark_dirty(&event.from, token, event.block_number)?;
                self.storage.mark_dirty(&event.to, token, event.block_number)?;
            }
            events.push(event);
        }

        if !events.is_empty() {
            self.storage
                .increment_transaction_count(token, events.len() as u64)?;
        }
        tracing::debug!(target: LOG_TARGET, token = %token, logs = logs.len(), events = events.len(), "Tracked events");
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
            TokenStandard::Erc20,
            self.config.batch_size,
            |offset, limit| self.storage.dirty_balances(offset, limit),
            |balance: Erc20Balance| {
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
    use shardex::testing::{address_topic, string_output, uint_output, word, ScriptedTransport};
    use shardex::types::ZERO_ADDRESS;

    const TOKEN: &str = "0x00000000000000000000000000000000000000e2";
    const ALICE: &str = "0x00000000000000000000000000000000000000a1";
    const BOB: &str = "0x00000000000000000000000000000000000000b0";
    const TRANSFER: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
    const APPROVAL: &str = "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925";

    fn tracker(transport: ScriptedTransport) -> Erc20Tracker {
        let client = ChainClient::new(0, Arc::new(transport), ChainClientConfig::default());
        Erc20Tracker::new(
            Arc::new(Erc20Storage::in_memory().unwrap()),
            client,
            Erc20TrackerConfig::default(),
        )
        .unwrap()
    }

    fn log(topic: &str, a: &str, b: &str, value: u64, block: u64, index: u64) -> Log {
        Log {
            address: TOKEN.to_string(),
            topics: vec![topic.to_string(), address_topic(a), address_topic(b)],
            data: format!("0x{}", word(&format!("{value:x}"))),
            block_number: block,
            transaction_hash: format!("0x{block:064x}"),
            log_index: index,
            ..Default::default()
        }
    }

    fn token_bytecode() -> String {
        let abi = erc20_abi();
        crate::abi::REQUIRED_SIGNATURES
            .iter()
            .map(|name| abi.selector(name).or_else(|_| abi.topic(name)).unwrap()[2..].to_string())
            .collect::<Vec<_>>()
            .join("5b")
    }

    fn scripted_token() -> ScriptedTransport {
        ScriptedTransport::new(0)
            .with_call(TOKEN, "0x06fdde03", &string_output("Wrapped ONE"))
            .with_call(TOKEN, "0x95d89b41", &string_output("WONE"))
            .with_call(TOKEN, "0x313ce567", &uint_output(18))
    }

    #[tokio::test]
    async fn test_add_contract() {
        let tracker = tracker(scripted_token());
        let contract = Contract {
            address: TOKEN.to_string(),
            block_number: 100,
            bytecode: format!("0x{}", token_bytecode()),
            ..Default::default()
        };
        assert!(tracker.add_contract(&contract).await.unwrap());
        assert_eq!(tracker.tokens().unwrap(), vec![TOKEN.to_string()]);
        assert_eq!(tracker.last_synced_block(TOKEN).unwrap(), Some(99));

        let other = Contract {
            address: "0x00000000000000000000000000000000000000f0".to_string(),
            bytecode: "0x6080604052".to_string(),
            ..Default::default()
        };
        assert!(!tracker.add_contract(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_mint_skipped_and_transfer_flags_both_sides() {
        let tracker = tracker(scripted_token());
        let logs = [
            log(TRANSFER, ZERO_ADDRESS, ALICE, 1_000, 10, 0),
            log(TRANSFER, ALICE, BOB, 250, 11, 0),
        ];

        let events = tracker.track_events(TOKEN, &logs).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from, ALICE);
        assert_eq!(events[0].to, BOB);
        assert_eq!(events[0].value, "250");

        let storage = tracker.storage();
        assert_eq!(storage.dirty_count().unwrap(), 2);
        assert!(storage.get_balance(ALICE, TOKEN).unwrap().unwrap().need_update);
        assert!(storage.get_balance(BOB, TOKEN).unwrap().unwrap().need_update);
    }

    #[tokio::test]
    async fn test_zero_owner_approval_recorded() {
        let tracker = tracker(scripted_token());
        let events = tracker
            .track_events(TOKEN, &[log(APPROVAL, ZERO_ADDRESS, BOB, 5, 12, 3)])
            .await
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, ContractEventType::Approval);
        assert_eq!(events[0].from, ZERO_ADDRESS);
        assert_eq!(tracker.storage().dirty_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_on_finish_reconciles_and_aggregates() {
        let alice_call = format!("0x70a08231{}", word(ALICE));
        let bob_call = format!("0x70a08231{}", word(BOB));
        let transport = scripted_token()
            .with_call(TOKEN, &alice_call, &uint_output(750))
            .with_call(TOKEN, &bob_call, &uint_output(250))
            .with_call(TOKEN, "0x18160ddd", &uint_output(1_000));
        let tracker = tracker(transport);
        tracker
            .add_contract(&Contract {
                address: TOKEN.to_string(),
                block_number: 1,
                bytecode: format!("0x{}", token_bytecode()),
                ..Default::default()
            })
            .await
            .unwrap();
        tracker
            .track_events(TOKEN, &[log(TRANSFER, ALICE, BOB, 250, 11, 0)])
            .await
            .unwrap();

        let report = tracker.on_finish().await.unwrap();
        assert_eq!(report, ReconcileReport { updated: 2, failed: 0 });

        let storage = tracker.storage();
        assert_eq!(storage.get_balance(ALICE, TOKEN).unwrap().unwrap().balance, "750");
        assert_eq!(storage.get_balance(BOB, TOKEN).unwrap().unwrap().balance, "250");
        let token = storage.get_token(TOKEN).unwrap().unwrap();
        assert_eq!(token.holders, 2);
        assert_eq!(token.total_supply, "1000");
        assert_eq!(token.circulating_supply, "1000");
        assert_eq!(token.transaction_count, 1);
    }

    #[tokio::test]
    async fn test_failed_balance_stays_dirty() {
        let bob_call = format!("0x70a08231{}", word(BOB));
        let transport = scripted_token().with_call(TOKEN, &bob_call, &uint_output(250));
        let tracker = tracker(transport);
        tracker
            .track_events(TOKEN, &[log(TRANSFER, ALICE, BOB, 250, 11, 0)])
            .await
            .unwrap();

        let report = tracker.on_finish().await.unwrap();
        assert_eq!(report, ReconcileReport { updated: 1, failed: 1 });
        let dirty = tracker.storage().dirty_balances(0, 10).unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].owner, ALICE);
    }
}
