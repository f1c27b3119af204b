//! Blocks and logs indexed by the sync loops end up as a registered token,
//! reconciled balances and exactly one contract event.

use std::sync::Arc;

use serde_json::{json, Value};
use shardex::etl::{
    BlockIndexer, BlockIndexerConfig, LogIndexer, RecordingDelay, SyncLoop, SyncLoopConfig,
    TokenTracker, TrackerRunner, TrackerRunnerConfig,
};
use shardex::rpc::{ChainClient, ChainClientConfig};
use shardex::storage::{Filter, SqliteStorage, Storage};
use shardex::testing::{address_topic, string_output, uint_output, word, ScriptedTransport};
use shardex::types::{ContractEventType, Log, ZERO_ADDRESS};
use shardex_erc20::{erc20_abi, Erc20Storage, Erc20Tracker, Erc20TrackerConfig, REQUIRED_SIGNATURES};

const TOKEN: &str = "0x00000000000000000000000000000000000000e2";
const DEPLOYER: &str = "0x00000000000000000000000000000000000000d0";
const ALICE: &str = "0x00000000000000000000000000000000000000a1";
const BOB: &str = "0x00000000000000000000000000000000000000b0";

const DEPLOY_BLOCK: u64 = 5;
const TRANSFER_BLOCK: u64 = 8;

fn tx_hash(block: u64) -> String {
    format!("0x{block:064x}")
}

fn runtime_bytecode() -> String {
    let abi = erc20_abi();
    let mut code = String::from("0x608060405234801561001057600080fd5b50");
    for name in REQUIRED_SIGNATURES {
        let hash = abi.selector(name).or_else(|_| abi.topic(name)).unwrap();
        code.push_str(&hash[2..]);
        code.push_str("5b");
    }
    code
}

fn raw_block(number: u64) -> Value {
    let transactions = match number {
        DEPLOY_BLOCK => json!([{
            "hash": tx_hash(number),
            "blockNumber": number,
            "transactionIndex": 0,
            "from": DEPLOYER,
            "to": null,
            "value": 0,
            "input": "0x6080604052348015600f57600080fd5b50"
        }]),
        TRANSFER_BLOCK => json!([{
            "hash": tx_hash(number),
            "blockNumber": number,
            "transactionIndex": 0,
            "from": ALICE,
            "to": TOKEN,
            "value": 0,
            "input": format!("0xa9059cbb{}{}", word(BOB), word("fa"))
        }]),
        _ => json!([]),
    };
    json!({
        "number": number,
        "hash": format!("0x{:064x}", 0xb000 + number),
        "parentHash": format!("0x{:064x}", 0xb000 + number.saturating_sub(1)),
        "miner": DEPLOYER,
        "timestamp": 1_700_000_000 + number,
        "transactions": transactions,
        "stakingTransactions": []
    })
}

fn raw_trace(number: u64) -> Value {
    match number {
        DEPLOY_BLOCK => json!([{
            "type": "create",
            "action": {"from": DEPLOYER, "value": "0x0", "gas": "0x100000", "init": "0x6080604052"},
            "result": {"address": TOKEN, "code": runtime_bytecode(), "gasUsed": "0x5000"},
            "transactionHash": tx_hash(number),
            "blockNumber": number
        }]),
        TRANSFER_BLOCK => json!([{
            "type": "call",
            "action": {"callType": "call", "from": ALICE, "to": TOKEN, "value": "0x0", "gas": "0x10000", "input": "0xa9059cbb"},
            "result": {"gasUsed": "0x100", "output": "0x"},
            "transactionHash": tx_hash(number),
            "blockNumber": number
        }]),
        _ => json!([]),
    }
}

fn transfer_log(from: &str, to: &str, value: u64, block: u64, index: u64) -> Value {
    json!({
        "address": TOKEN,
        "topics": [
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef",
            address_topic(from),
            address_topic(to)
        ],
        "data": format!("0x{}", word(&format!("{value:x}"))),
        "blockNumber": block,
        "transactionHash": tx_hash(block),
        "transactionIndex": 0,
        "logIndex": index
    })
}

fn quantity(value: &Value) -> u64 {
    u64::from_str_radix(value.as_str().unwrap().trim_start_matches("0x"), 16).unwrap()
}

fn chain() -> ScriptedTransport {
    ScriptedTransport::new(0)
        .with_result("eth_chainId", json!("0x63564c40"))
        .with_result("hmyv2_blockNumber", json!(20))
        .with_handler("hmyv2_getBlocks", |params| {
            let from = params[0].as_u64().unwrap();
            let to = params[1].as_u64().unwrap();
            Ok(json!((from..=to).map(raw_block).collect::<Vec<_>>()))
        })
        .with_handler("trace_block", |params| Ok(raw_trace(quantity(&params[0]))))
        .with_handler("eth_getLogs", |params| {
            let from = quantity(&params[0]["fromBlock"]);
            let to = quantity(&params[0]["toBlock"]);
            let logs = [
                (DEPLOY_BLOCK, transfer_log(ZERO_ADDRESS, ALICE, 1_000, DEPLOY_BLOCK, 0)),
                (TRANSFER_BLOCK, transfer_log(ALICE, BOB, 250, TRANSFER_BLOCK, 0)),
            ];
            Ok(json!(logs
                .into_iter()
                .filter(|(block, _)| (from..=to).contains(block))
                .map(|(_, log)| log)
                .collect::<Vec<_>>()))
        })
        .with_call(TOKEN, "0x06fdde03", &string_output("Wrapped ONE"))
        .with_call(TOKEN, "0x95d89b41", &string_output("WONE"))
        .with_call(TOKEN, "0x313ce567", &uint_output(18))
        .with_call(TOKEN, "0x18160ddd", &uint_output(1_000))
        .with_call(TOKEN, &format!("0x70a08231{}", word(ALICE)), &uint_output(750))
        .with_call(TOKEN, &format!("0x70a08231{}", word(BOB)), &uint_output(250))
}

fn sync_config() -> SyncLoopConfig {
    SyncLoopConfig {
        range_width: 10,
        initial_batch_count: 2,
        max_batch_count: 10,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_transfer_flows_from_blocks_to_balances() {
    let client = ChainClient::new(0, Arc::new(chain()), ChainClientConfig::default());
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::in_memory(0).unwrap());

    let mut blocks = SyncLoop::with_delay(
        BlockIndexer::new(client.clone(), storage.clone(), BlockIndexerConfig::default()),
        sync_config(),
        RecordingDelay::new(),
    );
    let mut logs = SyncLoop::with_delay(
        LogIndexer::new(client.clone(), storage.clone()).unwrap(),
        sync_config(),
        RecordingDelay::new(),
    );
    blocks.step().await;
    logs.step().await;

    let contracts = storage.get_contracts(&Filter::new()).unwrap();
    assert_eq!(contracts.len(), 1);
    assert_eq!(contracts[0].address, TOKEN);
    assert_eq!(storage.get_logs(&Filter::new()).unwrap().len(), 2);

    let token_storage = Arc::new(Erc20Storage::in_memory().unwrap());
    let tracker = Arc::new(
        Erc20Tracker::new(token_storage.clone(), client, Erc20TrackerConfig::default()).unwrap(),
    );
    let runner = TrackerRunner::new(
        storage.clone(),
        vec![tracker.clone() as Arc<dyn TokenTracker>],
        TrackerRunnerConfig::default(),
    );

    let cycles = runner.run_once().await;
    assert_eq!(cycles[0].registered, 1);
    assert_eq!(cycles[0].events, 1);
    assert_eq!(cycles[0].reconciled.updated, 2);

    let token = token_storage.get_token(TOKEN).unwrap().unwrap();
    assert_eq!(token.name, "Wrapped ONE");
    assert_eq!(token.symbol, "WONE");
    assert_eq!(token.decimals, 18);
    assert_eq!(token.total_supply, "1000");
    assert_eq!(token.holders, 2);
    assert_eq!(token.last_synced_block, Some(19));

    for (owner, expected) in [(ALICE, "750"), (BOB, "250")] {
        let balance = token_storage.get_balance(owner, TOKEN).unwrap().unwrap();
        assert!(!balance.need_update);
        assert_eq!(balance.balance, expected);
    }

    let events = storage.get_contract_events(&Filter::new()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, ContractEventType::Transfer);
    assert_eq!(events[0].from, ALICE);
    assert_eq!(events[0].to, BOB);

    // Nothing new on a second pass.
    let cycles = runner.run_once().await;
    assert_eq!(cycles[0].registered, 0);
    assert_eq!(cycles[0].events, 0);
    assert_eq!(storage.get_contract_events(&Filter::new()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_replayed_logs_are_idempotent() {
    let client = ChainClient::new(0, Arc::new(chain()), ChainClientConfig::default());
    let token_storage = Arc::new(Erc20Storage::in_memory().unwrap());
    let tracker =
        Erc20Tracker::new(token_storage.clone(), client, Erc20TrackerConfig::default()).unwrap();

    let log = Log {
        address: TOKEN.to_string(),
        topics: vec![
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef".to_string(),
            address_topic(ALICE),
            address_topic(BOB),
        ],
        data: format!("0x{}", word("fa")),
        block_number: TRANSFER_BLOCK,
        transaction_hash: tx_hash(TRANSFER_BLOCK),
        ..Default::default()
    };

    let first = tracker.track_events(TOKEN, &[log.clone()]).await.unwrap();
    let second = tracker.track_events(TOKEN, &[log]).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(token_storage.dirty_count().unwrap(), 2);

    let report = tracker.on_finish().await.unwrap();
    assert_eq!(report.updated, 2);
    assert_eq!(token_storage.dirty_count().unwrap(), 0);
}
