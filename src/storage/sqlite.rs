//! SQLite storage backend. One database file per shard.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, CachedStatement, Connection, OptionalExtension, Row};

use super::filter::{Filter, TableSpec};
use super::Storage;
use crate::types::{
    AddressRelation, Block, Contract, ContractEvent, IndexerKind, IndexerState,
    InternalTransaction, Log, ShardId, StakingTransaction, Transaction,
};

const LOG_TARGET: &str = "shardex::storage::sqlite";

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

const BLOCKS: TableSpec = TableSpec {
    name: "blocks",
    columns: &["number", "hash", "parent_hash", "miner", "timestamp", "epoch"],
    tie_break: "number",
};

const TRANSACTIONS: TableSpec = TableSpec {
    name: "transactions",
    columns: &[
        "hash",
        "eth_hash",
        "block_number",
        "transaction_index",
        "from_address",
        "to_address",
        "timestamp",
    ],
    tie_break: "transaction_index",
};

const STAKING_TRANSACTIONS: TableSpec = TableSpec {
    name: "staking_transactions",
    columns: &[
        "hash",
        "block_number",
        "from_address",
        "kind",
        "delegator_address",
        "validator_address",
        "timestamp",
    ],
    tie_break: "transaction_index",
};

const INTERNAL_TRANSACTIONS: TableSpec = TableSpec {
    name: "internal_transactions",
    columns: &[
        "transaction_hash",
        "block_number",
        "from_address",
        "to_address",
        "kind",
    ],
    tie_break: "trace_index",
};

const LOGS: TableSpec = TableSpec {
    name: "logs",
    columns: &[
        "address",
        "topic0",
        "block_number",
        "transaction_hash",
        "log_index",
    ],
    tie_break: "log_index",
};

const CONTRACTS: TableSpec = TableSpec {
    name: "contracts",
    columns: &["id", "address", "creator", "block_number", "transaction_hash"],
    tie_break: "id",
};

const ADDRESS_RELATIONS: TableSpec = TableSpec {
    name: "address_relations",
    columns: &["address", "block_number", "transaction_hash", "kind"],
    tie_break: "transaction_hash",
};

const CONTRACT_EVENTS: TableSpec = TableSpec {
    name: "contract_events",
    columns: &[
        "id",
        "token",
        "from_address",
        "to_address",
        "token_id",
        "standard",
        "event_type",
        "block_number",
        "transaction_hash",
    ],
    tie_break: "id",
};

pub struct SqliteStorage {
    shard: ShardId,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`. `:memory:` opens a private
    /// in-memory database.
    pub fn open(shard: ShardId, path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create directory: {}", parent.display())
                    })?;
                }
            }
            Connection::open(path).with_context(|| format!("Failed to open database: {path}"))?
        };

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-64000;
             PRAGMA temp_store=MEMORY;
             PRAGMA busy_timeout=5000;",
        )?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply indexer schema")?;

        tracing::info!(target: LOG_TARGET, shard, path, "Indexer database ready");

        Ok(Self {
            shard,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory(shard: ShardId) -> Result<Self> {
        Self::open(shard, ":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("indexer database mutex poisoned"))
    }

    fn insert_batch<T>(
        &self,
        sql: &str,
        items: &[T],
        mut bind: impl FnMut(&mut CachedStatement<'_>, &T) -> rusqlite::Result<usize>,
    ) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(sql)?;
            for item in items {
                inserted += bind(&mut stmt, item)?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn query<T>(
        &self,
        table: &TableSpec,
        select: &str,
        filter: &Filter,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let (clause, params) = filter.to_sql(table)?;
        let sql = format!("{select}{clause}");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), map)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn u64_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)? as u64)
}

fn row_to_block(row: &Row<'_>) -> rusqlite::Result<Block> {
    Ok(Block {
        number: u64_column(row, 0)?,
        shard: row.get(1)?,
        hash: row.get(2)?,
        parent_hash: row.get(3)?,
        miner: row.get(4)?,
        timestamp: u64_column(row, 5)?,
        gas_limit: u64_column(row, 6)?,
        gas_used: u64_column(row, 7)?,
        size: u64_column(row, 8)?,
        epoch: u64_column(row, 9)?,
        transactions: json_column(row, 10)?,
        staking_transactions: json_column(row, 11)?,
    })
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        hash: row.get(0)?,
        shard: row.get(1)?,
        eth_hash: row.get(2)?,
        block_number: u64_column(row, 3)?,
        block_hash: row.get(4)?,
        transaction_index: u64_column(row, 5)?,
        from: row.get(6)?,
        to: row.get(7)?,
        value: row.get(8)?,
        gas: u64_column(row, 9)?,
        gas_price: row.get(10)?,
        input: row.get(11)?,
        nonce: u64_column(row, 12)?,
        timestamp: u64_column(row, 13)?,
    })
}

fn row_to_staking_transaction(row: &Row<'_>) -> rusqlite::Result<StakingTransaction> {
    Ok(StakingTransaction {
        hash: row.get(0)?,
        shard: row.get(1)?,
        block_number: u64_column(row, 2)?,
        block_hash: row.get(3)?,
        transaction_index: u64_column(row, 4)?,
        from: row.get(5)?,
        kind: row.get(6)?,
        delegator_address: row.get(7)?,
        validator_address: row.get(8)?,
        amount: row.get(9)?,
        gas: u64_column(row, 10)?,
        gas_price: row.get(11)?,
        nonce: u64_column(row, 12)?,
        timestamp: u64_column(row, 13)?,
    })
}

fn row_to_internal_transaction(row: &Row<'_>) -> rusqlite::Result<InternalTransaction> {
    Ok(InternalTransaction {
        transaction_hash: row.get(0)?,
        index: row.get(1)?,
        block_number: u64_column(row, 2)?,
        from: row.get(3)?,
        to: row.get(4)?,
        value: row.get(5)?,
        gas: u64_column(row, 6)?,
        gas_used: u64_column(row, 7)?,
        input: row.get(8)?,
        output: row.get(9)?,
        kind: row.get(10)?,
        error: row.get(11)?,
        deployed_code: row.get(12)?,
    })
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<Log> {
    Ok(Log {
        transaction_hash: row.get(0)?,
        log_index: u64_column(row, 1)?,
        address: row.get(2)?,
        topics: json_column(row, 3)?,
        data: row.get(4)?,
        block_number: u64_column(row, 5)?,
        block_hash: row.get(6)?,
        transaction_index: u64_column(row, 7)?,
        removed: row.get(8)?,
    })
}

fn row_to_contract(row: &Row<'_>) -> rusqlite::Result<Contract> {
    Ok(Contract {
        id: row.get(0)?,
        address: row.get(1)?,
        creator: row.get(2)?,
        block_number: u64_column(row, 3)?,
        transaction_hash: row.get(4)?,
        bytecode: row.get(5)?,
        solidity_version: row.get(6)?,
        ipfs_hash: row.get(7)?,
    })
}

fn row_to_address_relation(row: &Row<'_>) -> rusqlite::Result<AddressRelation> {
    Ok(AddressRelation {
        address: row.get(0)?,
        block_number: u64_column(row, 1)?,
        transaction_hash: row.get(2)?,
        kind: parsed_column(row, 3)?,
    })
}

fn row_to_contract_event(row: &Row<'_>) -> rusqlite::Result<ContractEvent> {
    Ok(ContractEvent {
        token: row.get(0)?,
        from: row.get(1)?,
        to: row.get(2)?,
        value: row.get(3)?,
        token_id: row.get(4)?,
        standard: parsed_column(row, 5)?,
        event_type: parsed_column(row, 6)?,
        block_number: u64_column(row, 7)?,
        transaction_hash: row.get(8)?,
        transaction_index: u64_column(row, 9)?,
        log_index: u64_column(row, 10)?,
    })
}

impl Storage for SqliteStorage {
    fn shard(&self) -> ShardId {
        self.shard
    }

    fn add_blocks(&self, blocks: &[Block]) -> Result<usize> {
        self.insert_batch(
            "INSERT OR IGNORE INTO blocks (number, shard, hash, parent_hash, miner, timestamp,
                gas_limit, gas_used, size, epoch, transactions, staking_transactions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            blocks,
            |stmt, b| {
                let transactions = serde_json::to_string(&b.transactions)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                let staking = serde_json::to_string(&b.staking_transactions)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                stmt.execute(params![
                    b.number as i64,
                    b.shard,
                    b.hash,
                    b.parent_hash,
                    b.miner,
                    b.timestamp as i64,
                    b.gas_limit as i64,
                    b.gas_used as i64,
                    b.size as i64,
                    b.epoch as i64,
                    transactions,
                    staking,
                ])
            },
        )
    }

    fn add_transactions(&self, transactions: &[Transaction]) -> Result<usize> {
        self.insert_batch(
            "INSERT OR IGNORE INTO transactions (hash, shard, eth_hash, block_number, block_hash,
                transaction_index, from_address, to_address, value, gas, gas_price, input, nonce, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            transactions,
            |stmt, t| {
                stmt.execute(params![
                    t.hash,
                    t.shard,
                    t.eth_hash,
                    t.block_number as i64,
                    t.block_hash,
                    t.transaction_index as i64,
                    t.from,
                    t.to,
                    t.value,
                    t.gas as i64,
                    t.gas_price,
                    t.input,
                    t.nonce as i64,
                    t.timestamp as i64,
                ])
            },
        )
    }

    fn add_staking_transactions(&self, transactions: &[StakingTransaction]) -> Result<usize> {
        self.insert_batch(
            "INSERT OR IGNORE INTO staking_transactions (hash, shard, block_number, block_hash,
                transaction_index, from_address, kind, delegator_address, validator_address, amount,
                gas, gas_price, nonce, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            transactions,
            |stmt, t| {
                stmt.execute(params![
                    t.hash,
                    t.shard,
                    t.block_number as i64,
                    t.block_hash,
                    t.transaction_index as i64,
                    t.from,
                    t.kind,
                    t.delegator_address,
                    t.validator_address,
                    t.amount,
                    t.gas as i64,
                    t.gas_price,
                    t.nonce as i64,
                    t.timestamp as i64,
                ])
            },
        )
    }

    fn add_internal_transactions(&self, transactions: &[InternalTransaction]) -> Result<usize> {
        self.insert_batch(
            "INSERT OR IGNORE INTO internal_transactions (transaction_hash, trace_index, block_number,
                from_address, to_address, value, gas, gas_used, input, output, kind, error, deployed_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            transactions,
            |stmt, t| {
                stmt.execute(params![
                    t.transaction_hash,
                    t.index,
                    t.block_number as i64,
                    t.from,
                    t.to,
                    t.value,
                    t.gas as i64,
                    t.gas_used as i64,
                    t.input,
                    t.output,
                    t.kind,
                    t.error,
                    t.deployed_code,
                ])
            },
        )
    }

    fn add_logs(&self, logs: &[Log]) -> Result<usize> {
        self.insert_batch(
            "INSERT OR IGNORE INTO logs (transaction_hash, log_index, address, topics, topic0, data,
                block_number, block_hash, transaction_index, removed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            logs,
            |stmt, l| {
                let topics = serde_json::to_string(&l.topics)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                stmt.execute(params![
                    l.transaction_hash,
                    l.log_index as i64,
                    l.address,
                    topics,
                    l.topic0(),
                    l.data,
                    l.block_number as i64,
                    l.block_hash,
                    l.transaction_index as i64,
                    l.removed,
                ])
            },
        )
    }

    fn add_contracts(&self, contracts: &[Contract]) -> Result<usize> {
        self.insert_batch(
            "INSERT OR IGNORE INTO contracts (address, creator, block_number, transaction_hash,
                bytecode, solidity_version, ipfs_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            contracts,
            |stmt, c| {
                stmt.execute(params![
                    c.address,
                    c.creator,
                    c.block_number as i64,
                    c.transaction_hash,
                    c.bytecode,
                    c.solidity_version,
                    c.ipfs_hash,
                ])
            },
        )
    }

    fn add_address_relations(&self, relations: &[AddressRelation]) -> Result<usize> {
        self.insert_batch(
            "INSERT OR IGNORE INTO address_relations (address, block_number, transaction_hash, kind)
             VALUES (?1, ?2, ?3, ?4)",
            relations,
            |stmt, r| {
                stmt.execute(params![
                    r.address,
                    r.block_number as i64,
                    r.transaction_hash,
                    r.kind.as_str(),
                ])
            },
        )
    }

    fn add_contract_events(&self, events: &[ContractEvent]) -> Result<usize> {
        self.insert_batch(
            "INSERT INTO contract_events (token, from_address, to_address, value, token_id, standard,
                event_type, block_number, transaction_hash, transaction_index, log_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            events,
            |stmt, e| {
                stmt.execute(params![
                    e.token,
                    e.from,
                    e.to,
                    e.value,
                    e.token_id,
                    e.standard.as_str(),
                    e.event_type.as_str(),
                    e.block_number as i64,
                    e.transaction_hash,
                    e.transaction_index as i64,
                    e.log_index as i64,
                ])
            },
        )
    }

    fn get_blocks(&self, filter: &Filter) -> Result<Vec<Block>> {
        self.query(
            &BLOCKS,
            "SELECT number, shard, hash, parent_hash, miner, timestamp, gas_limit, gas_used, size,
                epoch, transactions, staking_transactions FROM blocks",
            filter,
            row_to_block,
        )
    }

    fn get_transactions(&self, filter: &Filter) -> Result<Vec<Transaction>> {
        self.query(
            &TRANSACTIONS,
            "SELECT hash, shard, eth_hash, block_number, block_hash, transaction_index, from_address,
                to_address, value, gas, gas_price, input, nonce, timestamp FROM transactions",
            filter,
            row_to_transaction,
        )
    }

    fn get_staking_transactions(&self, filter: &Filter) -> Result<Vec<StakingTransaction>> {
        self.query(
            &STAKING_TRANSACTIONS,
            "SELECT hash, shard, block_number, block_hash, transaction_index, from_address, kind,
                delegator_address, validator_address, amount, gas, gas_price, nonce, timestamp
             FROM staking_transactions",
            filter,
            row_to_staking_transaction,
        )
    }

    fn get_internal_transactions(&self, filter: &Filter) -> Result<Vec<InternalTransaction>> {
        self.query(
            &INTERNAL_TRANSACTIONS,
            "SELECT transaction_hash, trace_index, block_number, from_address, to_address, value,
                gas, gas_used, input, output, kind, error, deployed_code FROM internal_transactions",
            filter,
            row_to_internal_transaction,
        )
    }

    fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        self.query(
            &LOGS,
            "SELECT transaction_hash, log_index, address, topics, data, block_number, block_hash,
                transaction_index, removed FROM logs",
            filter,
            row_to_log,
        )
    }

    fn get_contracts(&self, filter: &Filter) -> Result<Vec<Contract>> {
        self.query(
            &CONTRACTS,
            "SELECT id, address, creator, block_number, transaction_hash, bytecode,
                solidity_version, ipfs_hash FROM contracts",
            filter,
            row_to_contract,
        )
    }

    fn get_address_relations(&self, filter: &Filter) -> Result<Vec<AddressRelation>> {
        self.query(
            &ADDRESS_RELATIONS,
            "SELECT address, block_number, transaction_hash, kind FROM address_relations",
            filter,
            row_to_address_relation,
        )
    }

    fn get_contract_events(&self, filter: &Filter) -> Result<Vec<ContractEvent>> {
        self.query(
            &CONTRACT_EVENTS,
            "SELECT token, from_address, to_address, value, token_id, standard, event_type,
                block_number, transaction_hash, transaction_index, log_index FROM contract_events",
            filter,
            row_to_contract_event,
        )
    }

    fn get_indexer_state(&self, kind: IndexerKind) -> Result<IndexerState> {
        let conn = self.conn()?;
        let last_synced_block: Option<i64> = conn
            .query_row(
                "SELECT last_synced_block FROM indexer_state WHERE shard = ?1 AND kind = ?2",
                params![self.shard, kind.key()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let chain_id: Option<i64> = conn
            .query_row(
                "SELECT chain_id FROM chain_info WHERE shard = ?1",
                params![self.shard],
                |row| row.get(0),
            )
            .optional()?;

        Ok(IndexerState {
            shard: self.shard,
            kind,
            last_synced_block: last_synced_block.map(|b| b as u64),
            chain_id: chain_id.map(|c| c as u64),
        })
    }

    fn set_last_synced_block(&self, kind: IndexerKind, block: u64) -> Result<u64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO indexer_state (shard, kind, last_synced_block) VALUES (?1, ?2, ?3)
             ON CONFLICT(shard, kind) DO UPDATE SET
                last_synced_block = MAX(COALESCE(last_synced_block, 0), excluded.last_synced_block),
                updated_at = strftime('%s', 'now')",
            params![self.shard, kind.key(), block as i64],
        )?;
        let stored: i64 = conn.query_row(
            "SELECT last_synced_block FROM indexer_state WHERE shard = ?1 AND kind = ?2",
            params![self.shard, kind.key()],
            |row| row.get(0),
        )?;
        Ok(stored as u64)
    }

    fn set_chain_id(&self, chain_id: u64) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO chain_info (shard, chain_id) VALUES (?1, ?2)
             ON CONFLICT(shard) DO UPDATE SET chain_id = excluded.chain_id",
            params![self.shard, chain_id as i64],
        )?;
        Ok(())
    }
}
