//! A discovered multi-token contract and a stored `TransferBatch` log,
//! driven through the tracker runner on file-backed databases.

use std::sync::Arc;

use shardex::etl::{TokenTracker, TrackerRunner, TrackerRunnerConfig};
use shardex::rpc::{ChainClient, ChainClientConfig};
use shardex::storage::{Filter, SqliteStorage, Storage};
use shardex::testing::{address_topic, string_output, word, ScriptedTransport};
use shardex::types::{Contract, ContractEventType, IndexerKind, Log, TokenStandard};
use shardex_common::{MetadataResolver, MetadataResolverConfig};
use shardex_erc1155::{
    erc1155_abi, Erc1155Storage, Erc1155Tracker, Erc1155TrackerConfig, REQUIRED_SIGNATURES,
};

const COLLECTION: &str = "0x00000000000000000000000000000000000000c9";
const OPERATOR: &str = "0x00000000000000000000000000000000000000ee";
const ALICE: &str = "0x00000000000000000000000000000000000000a1";
const BOB: &str = "0x00000000000000000000000000000000000000b0";
const TRANSFER_BATCH: &str = "0x4a39dc06d4c0dbc64b70af90fd698a233a518aa5d07e595d983b8c0526c8f7fb";

fn runtime_bytecode() -> String {
    let abi = erc1155_abi();
    let mut code = String::from("0x6080604052");
    for name in REQUIRED_SIGNATURES {
        let hash = abi.selector(name).or_else(|_| abi.topic(name)).unwrap();
        code.push_str(&hash[2..]);
    }
    code
}

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

fn chain() -> ScriptedTransport {
    ScriptedTransport::new(0)
        .with_call(
            COLLECTION,
            "0xe8a3d485",
            &string_output(r#"{"name":"Harmony Items","symbol":"ITEMS"}"#),
        )
        .with_call(COLLECTION, &balance_of_batch(ALICE, 1), &balances_output(0))
        .with_call(COLLECTION, &balance_of_batch(ALICE, 2), &balances_output(1))
        .with_call(COLLECTION, &balance_of_batch(BOB, 1), &balances_output(3))
        .with_call(COLLECTION, &balance_of_batch(BOB, 2), &balances_output(4))
}

#[tokio::test]
async fn test_batch_transfer_reconciled_through_runner() {
    let dir = tempfile::tempdir().unwrap();
    let core_path = dir.path().join("shard_0.db");
    let token_path = dir.path().join("erc1155.db");

    let storage: Arc<dyn Storage> =
        Arc::new(SqliteStorage::open(0, core_path.to_str().unwrap()).unwrap());
    storage
        .add_contracts(&[Contract {
            address: COLLECTION.to_string(),
            creator: ALICE.to_string(),
            block_number: 5,
            transaction_hash: format!("0x{:064x}", 5),
            bytecode: runtime_bytecode(),
            ..Default::default()
        }])
        .unwrap();
    storage
        .add_logs(&[Log {
            address: COLLECTION.to_string(),
            topics: vec![
                TRANSFER_BATCH.to_string(),
                address_topic(OPERATOR),
                address_topic(ALICE),
                address_topic(BOB),
            ],
            data: format!(
                "0x{}{}{}{}{}{}{}{}",
                word("40"),
                word("a0"),
                word("2"),
                word("1"),
                word("2"),
                word("2"),
                word("3"),
                word("4"),
            ),
            block_number: 7,
            transaction_hash: format!("0x{:064x}", 7),
            ..Default::default()
        }])
        .unwrap();
    storage.set_last_synced_block(IndexerKind::Logs, 20).unwrap();

    let client = ChainClient::new(0, Arc::new(chain()), ChainClientConfig::default());
    let token_storage = Arc::new(Erc1155Storage::new(token_path.to_str().unwrap()).unwrap());
    let tracker = Arc::new(
        Erc1155Tracker::new(
            token_storage.clone(),
            client,
            MetadataResolver::new(MetadataResolverConfig::default()).unwrap(),
            Erc1155TrackerConfig::default(),
        )
        .unwrap(),
    );
    let runner = TrackerRunner::new(
        storage.clone(),
        vec![tracker as Arc<dyn TokenTracker>],
        TrackerRunnerConfig::default(),
    );

    let cycles = runner.run_once().await;
    assert_eq!(cycles[0].standard, TokenStandard::Erc1155);
    assert_eq!(cycles[0].registered, 1);
    assert_eq!(cycles[0].events, 2);
    assert_eq!(cycles[0].reconciled.updated, 4);

    let token = token_storage.get_token(COLLECTION).unwrap().unwrap();
    assert_eq!(token.name, "Harmony Items");
    assert_eq!(token.symbol, "ITEMS");
    assert_eq!(token.last_synced_block, Some(20));
    // Alice still holds id 2.
    assert_eq!(token.holders, 2);
    assert_eq!(token.transaction_count, 2);

    let bob = token_storage.get_balance(BOB, COLLECTION, "2").unwrap().unwrap();
    assert_eq!(bob.balance, "4");
    assert_eq!(token_storage.dirty_count().unwrap(), 0);

    let events = storage.get_contract_events(&Filter::new()).unwrap();
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|e| e.event_type == ContractEventType::Transfer && e.standard == TokenStandard::Erc1155));
}
