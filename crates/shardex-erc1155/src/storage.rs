//! SQLite storage for ERC1155 collections, per-id metadata and balances.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

const LOG_TARGET: &str = "shardex_erc1155::storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc1155Token {
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub contract_uri: String,
    /// Contract-level metadata document as JSON text.
    pub metadata: Option<String>,
    pub holders: u64,
    pub transaction_count: u64,
    pub last_synced_block: Option<u64>,
    pub block_number: u64,
}

/// Metadata of one token id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc1155Asset {
    pub token: String,
    pub token_id: String,
    pub token_uri: Option<String>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc1155Balance {
    pub owner: String,
    pub token: String,
    pub token_id: String,
    pub balance: String,
    pub need_update: bool,
    pub last_update_block: Option<u64>,
}

/// Storage for ERC1155 collections and balances
pub struct Erc1155Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Erc1155Storage {
    /// Create or open the database
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-64000;
             PRAGMA temp_store=MEMORY;
             PRAGMA busy_timeout=5000;",
        )?;

        tracing::info!(target: LOG_TARGET, path = %db_path, "SQLite configured: WAL mode, NORMAL sync");

        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tokens (
                address TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                symbol TEXT NOT NULL,
                contract_uri TEXT NOT NULL,
                metadata TEXT,
                holders INTEGER NOT NULL DEFAULT 0,
                transaction_count INTEGER NOT NULL DEFAULT 0,
                last_synced_block INTEGER,
                block_number INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS assets (
                token TEXT NOT NULL,
                token_id TEXT NOT NULL,
                token_uri TEXT,
                metadata TEXT,
                PRIMARY KEY (token, token_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS balances (
                owner TEXT NOT NULL,
                token TEXT NOT NULL,
                token_id TEXT NOT NULL,
                balance TEXT NOT NULL DEFAULT '0',
                need_update INTEGER NOT NULL DEFAULT 1,
                last_update_block INTEGER,
                PRIMARY KEY (owner, token, token_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_balances_need_update ON balances(need_update)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_balances_token ON balances(token, token_id)",
            [],
        )?;

        tracing::info!(target: LOG_TARGET, "Database initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("erc1155 database mutex poisoned"))
    }

    pub fn insert_token(&self, token: &Erc1155Token) -> Result<bool> {
        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO tokens
                (address, name, symbol, contract_uri, metadata, holders, transaction_count,
                 last_synced_block, block_number)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                token.address,
                token.name,
                token.symbol,
                token.contract_uri,
                token.metadata,
                token.holders,
                token.transaction_count,
                token.last_synced_block,
                token.block_number,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_token(&self, address: &str) -> Result<Option<Erc1155Token>> {
        let conn = self.conn()?;
        let token = conn
            .query_row(
                "SELECT address, name, symbol, contract_uri, metadata, holders, transaction_count,
                        last_synced_block, block_number
                 FROM tokens WHERE address = ?1",
                params![address],
                token_from_row,
            )
            .optional()?;
        Ok(token)
    }

    pub fn token_addresses(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT address FROM tokens ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    pub fn last_synced_block(&self, token: &str) -> Result<Option<u64>> {
        let conn = self.conn()?;
        let block = conn
            .query_row(
                "SELECT last_synced_block FROM tokens WHERE address = ?1",
                params![token],
                |row| row.get::<_, Option<u64>>(0),
            )
            .optional()?;
        Ok(block.flatten())
    }

    pub fn set_last_synced_block(&self, token: &str, block: u64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE tokens SET last_synced_block = ?2 WHERE address = ?1",
            params![token, block],
        )?;
        Ok(())
    }

    /// Flag `(owner, token, token_id)` and make sure the id has an asset row.
    pub fn mark_dirty(&self, owner: &str, token: &str, token_id: &str, block: u64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO balances (owner, token, token_id, need_update, last_update_block)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(owner, token, token_id) DO UPDATE SET
                need_update = 1,
                last_update_block = MAX(COALESCE(last_update_block, 0), excluded.last_update_block)",
            params![owner, token, token_id, block],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO assets (token, token_id) VALUES (?1, ?2)",
            params![token, token_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn increment_transaction_count(&self, token: &str, by: u64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE tokens SET transaction_count = transaction_count + ?2 WHERE address = ?1",
            params![token, by],
        )?;
        Ok(())
    }

    pub fn dirty_balances(&self, offset: usize, limit: usize) -> Result<Vec<Erc1155Balance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT owner, token, token_id, balance, need_update, last_update_block
             FROM balances WHERE need_update = 1
             ORDER BY rowid LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], balance_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn dirty_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM balances WHERE need_update = 1",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn set_balance(&self, owner: &str, token: &str, token_id: &str, balance: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE balances SET balance = ?4, need_update = 0
             WHERE owner = ?1 AND token = ?2 AND token_id = ?3",
            params![owner, token, token_id, balance],
        )?;
        Ok(())
    }

    pub fn get_balance(&self, owner: &str, token: &str, token_id: &str) -> Result<Option<Erc1155Balance>> {
        let conn = self.conn()?;
        let balance = conn
            .query_row(
                "SELECT owner, token, token_id, balance, need_update, last_update_block
                 FROM balances WHERE owner = ?1 AND token = ?2 AND token_id = ?3",
                params![owner, token, token_id],
                balance_from_row,
            )
            .optional()?;
        Ok(balance)
    }

    pub fn get_asset(&self, token: &str, token_id: &str) -> Result<Option<Erc1155Asset>> {
        let conn = self.conn()?;
        let asset = conn
            .query_row(
                "SELECT token, token_id, token_uri, metadata FROM assets
                 WHERE token = ?1 AND token_id = ?2",
                params![token, token_id],
                |row| {
                    Ok(Erc1155Asset {
                        token: row.get(0)?,
                        token_id: row.get(1)?,
                        token_uri: row.get(2)?,
                        metadata: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(asset)
    }

    pub fn set_asset_metadata(
        &self,
        token: &str,
        token_id: &str,
        token_uri: &str,
        metadata: Option<&str>,
    ) -> Result<()> {
        self.conn()?.execute(
            "UPDATE assets SET token_uri = ?3, metadata = COALESCE(?4, metadata)
             WHERE token = ?1 AND token_id = ?2",
            params![token, token_id, token_uri, metadata],
        )?;
        Ok(())
    }

    /// Distinct owners with a positive balance of any id of `token`.
    pub fn holder_count(&self, token: &str) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(DISTINCT owner) FROM balances WHERE token = ?1 AND balance != '0'",
            params![token],
            |row| row.get(0),
        )?)
    }

    pub fn update_holders(&self, token: &str, holders: u64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE tokens SET holders = ?2 WHERE address = ?1",
            params![token, holders],
        )?;
        Ok(())
    }
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Erc1155Token> {
    Ok(Erc1155Token {
        address: row.get(0)?,
        name: row.get(1)?,
        symbol: row.get(2)?,
        contract_uri: row.get(3)?,
        metadata: row.get(4)?,
        holders: row.get(5)?,
        transaction_count: row.get(6)?,
        last_synced_block: row.get(7)?,
        block_number: row.get(8)?,
    })
}

fn balance_from_row(row: &Row<'_>) -> rusqlite::Result<Erc1155Balance> {
    Ok(Erc1155Balance {
        owner: row.get(0)?,
        token: row.get(1)?,
        token_id: row.get(2)?,
        balance: row.get(3)?,
        need_update: row.get(4)?,
        last_update_block: row.get(5)?,
    })
}
