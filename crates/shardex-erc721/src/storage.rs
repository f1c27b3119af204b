//! SQLite storage for ERC721 collections and their assets.
//!
//! One row per `(token, token_id)`. The owner written by a Transfer event is
//! provisional until reconciliation confirms it with `ownerOf`.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

const LOG_TARGET: &str = "shardex_erc721::storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc721Token {
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub total_supply: String,
    pub holders: u64,
    pub transaction_count: u64,
    pub last_synced_block: Option<u64>,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc721Asset {
    pub token: String,
    /// Decimal token id.
    pub token_id: String,
    pub owner: String,
    pub token_uri: Option<String>,
    /// Resolved off-chain metadata as JSON text.
    pub metadata: Option<String>,
    pub need_update: bool,
    pub last_update_block: Option<u64>,
}

/// Storage for ERC721 collections and assets
pub struct Erc721Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Erc721Storage {
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
                total_supply TEXT NOT NULL DEFAULT '0',
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
                owner TEXT NOT NULL,
                token_uri TEXT,
                metadata TEXT,
                need_update INTEGER NOT NULL DEFAULT 1,
                last_update_block INTEGER,
                PRIMARY KEY (token, token_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_assets_need_update ON assets(need_update)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_assets_owner ON assets(owner)",
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
            .map_err(|_| anyhow!("erc721 database mutex poisoned"))
    }

    pub fn insert_token(&self, token: &Erc721Token) -> Result<bool> {
        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO tokens
                (address, name, symbol, total_supply, holders, transaction_count,
                 last_synced_block, block_number)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                token.address,
                token.name,
                token.symbol,
                token.total_supply,
                token.holders,
                token.transaction_count,
                token.last_synced_block,
                token.block_number,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_token(&self, address: &str) -> Result<Option<Erc721Token>> {
        let conn = self.conn()?;
        let token = conn
            .query_row(
                "SELECT address, name, symbol, total_supply, holders, transaction_count,
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

    /// Record `owner` as the provisional holder of the asset and flag it.
    pub fn mark_dirty(&self, token: &str, token_id: &str, owner: &str, block: u64) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO assets (token, token_id, owner, need_update, last_update_block)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(token, token_id) DO UPDATE SET
                owner = CASE WHEN excluded.last_update_block >= COALESCE(last_update_block, 0)
                             THEN excluded.owner ELSE owner END,
                need_update = 1,
                last_update_block = MAX(COALESCE(last_update_block, 0), excluded.last_update_block)",
            params![token, token_id, owner, block],
        )?;
        Ok(())
    }

    pub fn increment_transaction_count(&self, token: &str, by: u64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE tokens SET transaction_count = transaction_count + ?2 WHERE address = ?1",
            params![token, by],
        )?;
        Ok(())
    }

    pub fn dirty_assets(&self, offset: usize, limit: usize) -> Result<Vec<Erc721Asset>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT token, token_id, owner, token_uri, metadata, need_update, last_update_block
             FROM assets WHERE need_update = 1
             ORDER BY rowid LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], asset_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn dirty_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM assets WHERE need_update = 1",
            [],
            |row| row.get(0),
        )?)
    }

    /// Store the reconciled owner and metadata and clear the flag.
    ///
    /// `None` for `token_uri` or `metadata` keeps what is stored.
    pub fn set_asset(
        &self,
        token: &str,
        token_id: &str,
        owner: &str,
        token_uri: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<()> {
        self.conn()?.execute(
            "UPDATE assets SET
                owner = ?3,
                token_uri = COALESCE(?4, token_uri),
                metadata = COALESCE(?5, metadata),
                need_update = 0
             WHERE token = ?1 AND token_id = ?2",
            params![token, token_id, owner, token_uri, metadata],
        )?;
        Ok(())
    }

    pub fn get_asset(&self, token: &str, token_id: &str) -> Result<Option<Erc721Asset>> {
        let conn = self.conn()?;
        let asset = conn
            .query_row(
                "SELECT token, token_id, owner, token_uri, metadata, need_update, last_update_block
                 FROM assets WHERE token = ?1 AND token_id = ?2",
                params![token, token_id],
                asset_from_row,
            )
            .optional()?;
        Ok(asset)
    }

    /// Assets of `owner` across all collections.
    pub fn assets_of(&self, owner: &str) -> Result<Vec<Erc721Asset>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT token, token_id, owner, token_uri, metadata, need_update, last_update_block
             FROM assets WHERE owner = ?1 ORDER BY token, rowid",
        )?;
        let rows = stmt.query_map(params![owner], asset_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Distinct owners holding at least one asset of `token`.
    pub fn holder_count(&self, token: &str, zero_address: &str) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(DISTINCT owner) FROM assets WHERE token = ?1 AND owner != ?2",
            params![token, zero_address],
            |row| row.get(0),
        )?)
    }

    pub fn update_aggregates(&self, token: &str, total_supply: Option<&str>, holders: u64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE tokens SET total_supply = COALESCE(?2, total_supply), holders = ?3
             WHERE address = ?1",
            params![token, total_supply, holders],
        )?;
        Ok(())
    }
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Erc721Token> {
    Ok(Erc721Token {
        address: row.get(0)?,
        name: row.get(1)?,
        symbol: row.get(2)?,
        total_supply: row.get(3)?,
        holders: row.get(4)?,
        transaction_count: row.get(5)?,
        last_synced_block: row.get(6)?,
        block_number: row.get(7)?,
    })
}

fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<Erc721Asset> {
    Ok(Erc721Asset {
        token: row.get(0)?,
        token_id: row.get(1)?,
        owner: row.get(2)?,
        token_uri: row.get(3)?,
        metadata: row.get(4)?,
        need_update: row.get(5)?,
        last_update_block: row.get(6)?,
    })
}
