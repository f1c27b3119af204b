//! SQLite storage for ERC20 tokens and holder balances.
//!
//! Balances are never computed from transfer amounts. An event only flags the
//! `(owner, token)` row as needing an update and reconciliation reads the
//! actual balance from the chain, so genesis allocations and rebasing tokens
//! still end up correct.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

const LOG_TARGET: &str = "shardex_erc20::storage";

/// A registered ERC20 token with its aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc20Token {
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    /// Decimal string.
    pub total_supply: String,
    pub circulating_supply: String,
    pub holders: u64,
    pub transaction_count: u64,
    pub last_synced_block: Option<u64>,
    /// Block the contract was created in.
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc20Balance {
    pub owner: String,
    pub token: String,
    pub balance: String,
    pub need_update: bool,
    pub last_update_block: Option<u64>,
}

/// Storage for ERC20 tokens and balances
pub struct Erc20Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Erc20Storage {
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
                decimals INTEGER NOT NULL,
                total_supply TEXT NOT NULL DEFAULT '0',
                circulating_supply TEXT NOT NULL DEFAULT '0',
                holders INTEGER NOT NULL DEFAULT 0,
                transaction_count INTEGER NOT NULL DEFAULT 0,
                last_synced_block INTEGER,
                block_number INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS balances (
                owner TEXT NOT NULL,
                token TEXT NOT NULL,
                balance TEXT NOT NULL DEFAULT '0',
                need_update INTEGER NOT NULL DEFAULT 1,
                last_update_block INTEGER,
                PRIMARY KEY (owner, token)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_balances_need_update ON balances(need_update)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_balances_token ON balances(token)",
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
            .map_err(|_| anyhow!("erc20 database mutex poisoned"))
    }

    /// Insert a token unless one is already registered at the address.
    pub fn insert_token(&self, token: &Erc20Token) -> Result<bool> {
        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO tokens
                (address, name, symbol, decimals, total_supply, circulating_supply,
                 holders, transaction_count, last_synced_block, block_number)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                token.address,
                token.name,
                token.symbol,
                token.decimals,
                token.total_supply,
                token.circulating_supply,
                token.holders,
                token.transaction_count,
                token.last_synced_block,
                token.block_number,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_token(&self, address: &str) -> Result<Option<Erc20Token>> {
        let conn = self.conn()?;
        let token = conn
            .query_row(
                "SELECT address, name, symbol, decimals, total_supply, circulating_supply,
                        holders, transaction_count, last_synced_block, block_number
                 FROM tokens WHERE address = ?1",
                params![address],
                token_from_row,
            )
            .optional()?;
        Ok(token)
    }

    /// Registered token addresses, oldest first.
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

    /// Flag `(owner, token)` for reconciliation, creating the row when needed.
    pub fn mark_dirty(&self, owner: &str, token: &str, block: u64) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO balances (owner, token, need_update, last_update_block)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(owner, token) DO UPDATE SET
                need_update = 1,
                last_update_block = MAX(COALESCE(last_update_block, 0), excluded.last_update_block)",
            params![owner, token, block],
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

    /// A page of rows flagged for reconciliation, in insertion order.
    pub fn dirty_balances(&self, offset: usize, limit: usize) -> Result<Vec<Erc20Balance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT owner, token, balance, need_update, last_update_block
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

    /// Store a reconciled balance and clear its flag.
    pub fn set_balance(&self, owner: &str, token: &str, balance: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE balances SET balance = ?3, need_update = 0 WHERE owner = ?1 AND token = ?2",
            params![owner, token, balance],
        )?;
        Ok(())
    }

    pub fn get_balance(&self, owner: &str, token: &str) -> Result<Option<Erc20Balance>> {
        let conn = self.conn()?;
        let balance = conn
            .query_row(
                "SELECT owner, token, balance, need_update, last_update_block
                 FROM balances WHERE owner = ?1 AND token = ?2",
                params![owner, token],
                balance_from_row,
            )
            .optional()?;
        Ok(balance)
    }

    /// Distinct owners holding a positive balance of `token`.
    pub fn holder_count(&self, token: &str) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(DISTINCT owner) FROM balances WHERE token = ?1 AND balance != '0'",
            params![token],
            |row| row.get(0),
        )?)
    }

    /// Persist aggregates. A `None` supply keeps the stored value.
    pub fn update_aggregates(
        &self,
        token: &str,
        total_supply: Option<&str>,
        circulating_supply: Option<&str>,
        holders: u64,
    ) -> Result<()> {
        self.conn()?.execute(
            "UPDATE tokens SET
                total_supply = COALESCE(?2, total_supply),
                circulating_supply = COALESCE(?3, circulating_supply),
                holders = ?4
             WHERE address = ?1",
            params![token, total_supply, circulating_supply, holders],
        )?;
        Ok(())
    }
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Erc20Token> {
    Ok(Erc20Token {
        address: row.get(0)?,
        name: row.get(1)?,
        symbol: row.get(2)?,
        decimals: row.get(3)?,
        total_supply: row.get(4)?,
        circulating_supply: row.get(5)?,
        holders: row.get(6)?,
        transaction_count: row.get(7)?,
        last_synced_block: row.get(8)?,
        block_number: row.get(9)?,
    })
}

fn balance_from_row(row: &Row<'_>) -> rusqlite::Result<Erc20Balance> {
    Ok(Erc20Balance {
        owner: row.get(0)?,
        token: row.get(1)?,
        balance: row.get(2)?,
        need_update: row.get(3)?,
        last_update_block: row.get(4)?,
    })
}
