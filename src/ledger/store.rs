//! Ledger Storage
//!
//! SQLite backing for the Account Store and the append-only Transaction Log.
//! Referral, achievement and duel rows live in the same database so that a
//! bonus or settlement commits together with the balance changes it causes.
//!
//! Functions here take a `&Connection` and perform no locking or policy; the
//! caller decides the unit of work through [`LedgerStore::write`].

use crate::ledger::error::Result;
use crate::models::{Account, AccountId, Amount, Currency, Transaction, TransactionType};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    token_balance INTEGER NOT NULL DEFAULT 0 CHECK (token_balance >= 0),
    diamond_balance INTEGER NOT NULL DEFAULT 0 CHECK (diamond_balance >= 0),
    tokens_earned INTEGER NOT NULL DEFAULT 0,
    tokens_spent INTEGER NOT NULL DEFAULT 0,
    diamonds_earned INTEGER NOT NULL DEFAULT 0,
    diamonds_spent INTEGER NOT NULL DEFAULT 0,
    daily_streak INTEGER NOT NULL DEFAULT 0,
    last_bonus_date TEXT,
    created_at TEXT NOT NULL,
    closed_at TEXT
);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    currency TEXT NOT NULL,
    signed_amount INTEGER NOT NULL,
    kind TEXT NOT NULL,
    balance_before INTEGER NOT NULL,
    balance_after INTEGER NOT NULL CHECK (balance_after >= 0),
    description TEXT NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    reference TEXT,
    created_at TEXT NOT NULL,
    CHECK (balance_after = balance_before + signed_amount)
);
CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id, id);
CREATE INDEX IF NOT EXISTS idx_transactions_reference ON transactions(reference);

CREATE TRIGGER IF NOT EXISTS transactions_append_only_update
BEFORE UPDATE ON transactions
BEGIN
    SELECT RAISE(ABORT, 'transactions are append-only');
END;
CREATE TRIGGER IF NOT EXISTS transactions_append_only_delete
BEFORE DELETE ON transactions
BEGIN
    SELECT RAISE(ABORT, 'transactions are append-only');
END;

CREATE TABLE IF NOT EXISTS referral_connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    referrer_id INTEGER NOT NULL REFERENCES accounts(id),
    referred_id INTEGER NOT NULL UNIQUE REFERENCES accounts(id),
    bonus_paid INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    CHECK (referrer_id != referred_id)
);
CREATE INDEX IF NOT EXISTS idx_referrals_referrer ON referral_connections(referrer_id);

CREATE TABLE IF NOT EXISTS achievements (
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    achievement_id TEXT NOT NULL,
    reward_tokens INTEGER NOT NULL,
    reward_diamonds INTEGER NOT NULL,
    unlocked_at TEXT NOT NULL,
    PRIMARY KEY (account_id, achievement_id)
);

CREATE TABLE IF NOT EXISTS duels (
    id TEXT PRIMARY KEY,
    challenger_id INTEGER NOT NULL REFERENCES accounts(id),
    opponent_id INTEGER NOT NULL REFERENCES accounts(id),
    wager_amount INTEGER NOT NULL CHECK (wager_amount > 0),
    currency TEXT NOT NULL,
    status TEXT NOT NULL,
    winner_id INTEGER,
    challenger_result INTEGER,
    opponent_result INTEGER,
    created_at TEXT NOT NULL,
    settled_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_duels_challenger ON duels(challenger_id);
CREATE INDEX IF NOT EXISTS idx_duels_opponent ON duels(opponent_id);
";

/// Shared handle to the single authoritative ledger database.
#[derive(Clone)]
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerStore {
    /// Open (or create) the database at `db_path` and initialize tables.
    ///
    /// `":memory:"` opens a private in-memory database.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;

        info!(db_path, "💾 Ledger store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls the whole unit back.
    pub async fn write<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run a read-only query against a consistent snapshot.
    pub async fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().await;
        f(&conn)
    }
}

/// Map an unknown text tag to a conversion error instead of panicking.
pub(crate) fn parse_tag<T>(idx: usize, raw: String, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("unknown tag {raw:?}").into())
    })
}

// =============================================================================
// ACCOUNTS
// =============================================================================

const ACCOUNT_COLUMNS: &str = "id, token_balance, diamond_balance, tokens_earned, tokens_spent, \
     diamonds_earned, diamonds_spent, daily_streak, last_bonus_date, created_at, closed_at";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        token_balance: row.get(1)?,
        diamond_balance: row.get(2)?,
        tokens_earned: row.get(3)?,
        tokens_spent: row.get(4)?,
        diamonds_earned: row.get(5)?,
        diamonds_spent: row.get(6)?,
        daily_streak: row.get(7)?,
        last_bonus_date: row.get(8)?,
        created_at: row.get(9)?,
        closed_at: row.get(10)?,
    })
}

pub(crate) fn get_account(conn: &Connection, id: AccountId) -> Result<Option<Account>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"))?;
    Ok(stmt.query_row([id], account_from_row).optional()?)
}

/// Insert a zero-balance account; returns false if it already existed.
pub(crate) fn insert_account(conn: &Connection, id: AccountId, now: DateTime<Utc>) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO accounts (id, created_at) VALUES (?1, ?2)",
        params![id, now],
    )?;
    Ok(inserted == 1)
}

pub(crate) fn list_account_ids(conn: &Connection) -> Result<Vec<AccountId>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM accounts ORDER BY id ASC")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<AccountId>>>()?;
    Ok(ids)
}

pub(crate) fn close_account(conn: &Connection, id: AccountId, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE accounts SET closed_at = ?2 WHERE id = ?1 AND closed_at IS NULL",
        params![id, now],
    )?;
    Ok(())
}

/// Write a new balance and bump the matching earned/spent counter.
///
/// Only the ledger engine calls this, always next to [`insert_transaction`].
pub(crate) fn apply_balance(
    conn: &Connection,
    id: AccountId,
    currency: Currency,
    new_balance: Amount,
    signed_amount: Amount,
) -> Result<()> {
    let (balance_col, earned_col, spent_col) = match currency {
        Currency::Token => ("token_balance", "tokens_earned", "tokens_spent"),
        Currency::Diamond => ("diamond_balance", "diamonds_earned", "diamonds_spent"),
    };
    let (earned, spent) = if signed_amount >= 0 {
        (signed_amount, 0)
    } else {
        (0, -signed_amount)
    };
    conn.execute(
        &format!(
            "UPDATE accounts SET {balance_col} = ?2, {earned_col} = {earned_col} + ?3, \
             {spent_col} = {spent_col} + ?4 WHERE id = ?1"
        ),
        params![id, new_balance, earned, spent],
    )?;
    Ok(())
}

pub(crate) fn set_streak(
    conn: &Connection,
    id: AccountId,
    daily_streak: u32,
    last_bonus_date: NaiveDate,
) -> Result<()> {
    conn.execute(
        "UPDATE accounts SET daily_streak = ?2, last_bonus_date = ?3 WHERE id = ?1",
        params![id, daily_streak, last_bonus_date],
    )?;
    Ok(())
}

// =============================================================================
// TRANSACTION LOG
// =============================================================================

/// Entry about to be appended; the store assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub(crate) struct NewTransaction<'a> {
    pub account_id: AccountId,
    pub currency: Currency,
    pub signed_amount: Amount,
    pub kind: TransactionType,
    pub balance_before: Amount,
    pub description: &'a str,
    pub idempotency_key: &'a str,
    pub reference: Option<&'a str>,
}

const TRANSACTION_COLUMNS: &str = "id, account_id, currency, signed_amount, kind, balance_before, \
     balance_after, description, idempotency_key, reference, created_at";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        account_id: row.get(1)?,
        currency: parse_tag(2, row.get(2)?, Currency::parse)?,
        signed_amount: row.get(3)?,
        kind: parse_tag(4, row.get(4)?, TransactionType::parse)?,
        balance_before: row.get(5)?,
        balance_after: row.get(6)?,
        description: row.get(7)?,
        idempotency_key: row.get(8)?,
        reference: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub(crate) fn insert_transaction(conn: &Connection, new: &NewTransaction<'_>) -> Result<Transaction> {
    let now = Utc::now();
    let balance_after = new.balance_before + new.signed_amount;
    conn.execute(
        "INSERT INTO transactions (account_id, currency, signed_amount, kind, balance_before, \
         balance_after, description, idempotency_key, reference, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            new.account_id,
            new.currency.as_str(),
            new.signed_amount,
            new.kind.as_str(),
            new.balance_before,
            balance_after,
            new.description,
            new.idempotency_key,
            new.reference,
            now,
        ],
    )?;

    Ok(Transaction {
        id: conn.last_insert_rowid(),
        account_id: new.account_id,
        currency: new.currency,
        signed_amount: new.signed_amount,
        kind: new.kind,
        balance_before: new.balance_before,
        balance_after,
        description: new.description.to_string(),
        idempotency_key: new.idempotency_key.to_string(),
        reference: new.reference.map(str::to_string),
        created_at: now,
    })
}

pub(crate) fn transaction_by_key(conn: &Connection, key: &str) -> Result<Option<Transaction>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE idempotency_key = ?1"
    ))?;
    Ok(stmt.query_row([key], transaction_from_row).optional()?)
}

/// Full history of one account in creation order.
pub(crate) fn transactions_ascending(conn: &Connection, account_id: AccountId) -> Result<Vec<Transaction>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE account_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map([account_id], transaction_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Most recent entries first.
pub(crate) fn recent_transactions(
    conn: &Connection,
    account_id: AccountId,
    limit: usize,
) -> Result<Vec<Transaction>> {
    let limit = limit.clamp(1, 1000) as i64;
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE account_id = ?1 ORDER BY id DESC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![account_id, limit], transaction_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn transactions_by_reference(conn: &Connection, reference: &str) -> Result<Vec<Transaction>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE reference = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map([reference], transaction_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
