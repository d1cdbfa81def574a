//! Ledger Engine
//!
//! The only code path that changes a balance. Each mutation:
//!
//! 1. takes the per-account lock(s) of every account it touches,
//! 2. opens one `BEGIN IMMEDIATE` SQLite transaction,
//! 3. appends a transaction log entry and writes the new balance together.
//!
//! Replaying a mutation with an idempotency key that is already in the log
//! returns the original entry and changes nothing.
//!
//! # Invariants
//!
//! 1. **No Negative Balance**: a debit larger than the balance fails with
//!    `InsufficientFunds` and writes nothing.
//! 2. **Reconciliation**: per account and currency, the signed sum of the log
//!    in creation order equals the stored balance.
//! 3. **No Double-Application**: each idempotency key is posted at most once.

use crate::ledger::duel;
use crate::ledger::error::{LedgerError, Result};
use crate::ledger::locks::AccountLocks;
use crate::ledger::store::{self, LedgerStore, NewTransaction};
use crate::models::{Account, AccountId, Amount, Balances, Currency, Transaction, TransactionType};
use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// A requested balance mutation. `amount` is always positive; direction is
/// given by calling [`Ledger::credit`] or [`Ledger::debit`].
#[derive(Debug, Clone)]
pub struct Posting {
    pub account_id: AccountId,
    pub currency: Currency,
    pub amount: Amount,
    pub kind: TransactionType,
    pub description: String,
    pub idempotency_key: String,
    pub reference: Option<String>,
}

impl Posting {
    pub fn new(
        account_id: AccountId,
        currency: Currency,
        amount: Amount,
        kind: TransactionType,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            currency,
            amount,
            kind,
            description: String::new(),
            idempotency_key: idempotency_key.into(),
            reference: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Credit,
    Debit,
}

/// Result of posting inside a unit of work.
#[derive(Debug, Clone)]
pub(crate) struct Posted {
    pub transaction: Transaction,
    /// The key was already in the log; nothing was written
    pub replayed: bool,
}

/// Append one entry and update the balance it describes.
///
/// Must run inside a unit of work that holds the account's lock.
pub(crate) fn post(conn: &Connection, direction: Direction, posting: &Posting) -> Result<Posted> {
    if posting.amount <= 0 || posting.amount % posting.currency.min_unit() != 0 {
        return Err(LedgerError::InvalidAmount(posting.amount));
    }
    let signed_amount = match direction {
        Direction::Credit => posting.amount,
        Direction::Debit => -posting.amount,
    };

    if let Some(existing) = store::transaction_by_key(conn, &posting.idempotency_key)? {
        let same_operation = existing.account_id == posting.account_id
            && existing.currency == posting.currency
            && existing.signed_amount == signed_amount
            && existing.kind == posting.kind;
        if !same_operation {
            warn!(
                key = %posting.idempotency_key,
                account_id = posting.account_id,
                existing_account = existing.account_id,
                "Idempotency key reused for a different operation"
            );
            return Err(LedgerError::IdempotencyConflict {
                key: posting.idempotency_key.clone(),
            });
        }
        debug!(
            key = %posting.idempotency_key,
            transaction_id = existing.id,
            "Replayed posting; returning existing entry"
        );
        return Ok(Posted {
            transaction: existing,
            replayed: true,
        });
    }

    let Some(account) = store::get_account(conn, posting.account_id)? else {
        error!(
            account_id = posting.account_id,
            key = %posting.idempotency_key,
            kind = posting.kind.as_str(),
            "Posting to unknown account"
        );
        return Err(LedgerError::AccountNotFound(posting.account_id));
    };
    if account.is_closed() {
        return Err(LedgerError::AccountClosed(posting.account_id));
    }

    let balance_before = account.balance(posting.currency);
    let balance_after = balance_before
        .checked_add(signed_amount)
        .ok_or(LedgerError::InvalidAmount(posting.amount))?;
    if balance_after < 0 {
        warn!(
            account_id = posting.account_id,
            currency = %posting.currency,
            balance = balance_before,
            requested = posting.amount,
            "Insufficient funds"
        );
        return Err(LedgerError::InsufficientFunds {
            account_id: posting.account_id,
            currency: posting.currency,
            balance: balance_before,
            requested: posting.amount,
        });
    }

    let transaction = store::insert_transaction(
        conn,
        &NewTransaction {
            account_id: posting.account_id,
            currency: posting.currency,
            signed_amount,
            kind: posting.kind,
            balance_before,
            description: &posting.description,
            idempotency_key: &posting.idempotency_key,
            reference: posting.reference.as_deref(),
        },
    )?;
    store::apply_balance(conn, posting.account_id, posting.currency, balance_after, signed_amount)?;

    info!(
        account_id = posting.account_id,
        currency = %posting.currency,
        amount = signed_amount,
        balance = balance_after,
        kind = posting.kind.as_str(),
        key = %posting.idempotency_key,
        "Posted ledger entry"
    );

    Ok(Posted {
        transaction,
        replayed: false,
    })
}

// =============================================================================
// RECONCILIATION
// =============================================================================

/// Stored vs. log-derived balance of one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyReconciliation {
    pub currency: Currency,
    pub stored: Amount,
    pub derived: Amount,
    pub entries: usize,
    /// Every entry starts where the previous one ended
    pub chain_intact: bool,
}

impl CurrencyReconciliation {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.derived && self.chain_intact
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub account_id: AccountId,
    pub currencies: Vec<CurrencyReconciliation>,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.currencies.iter().all(CurrencyReconciliation::is_consistent)
    }

    pub fn first_mismatch(&self) -> Option<&CurrencyReconciliation> {
        self.currencies.iter().find(|c| !c.is_consistent())
    }
}

fn reconcile_in(conn: &Connection, account_id: AccountId) -> Result<Reconciliation> {
    let account =
        store::get_account(conn, account_id)?.ok_or(LedgerError::AccountNotFound(account_id))?;
    let history = store::transactions_ascending(conn, account_id)?;

    let currencies = Currency::ALL
        .iter()
        .map(|&currency| {
            let mut running: Amount = 0;
            let mut entries = 0;
            let mut chain_intact = true;
            for entry in history.iter().filter(|t| t.currency == currency) {
                entries += 1;
                chain_intact &= entry.balance_before == running && entry.is_consistent();
                running += entry.signed_amount;
            }
            CurrencyReconciliation {
                currency,
                stored: account.balance(currency),
                derived: running,
                entries,
                chain_intact,
            }
        })
        .collect();

    Ok(Reconciliation {
        account_id,
        currencies,
    })
}

// =============================================================================
// LEDGER
// =============================================================================

/// Handle to the ledger. Cheap to clone; construct once and pass it to every
/// collaborator that needs balances.
#[derive(Clone)]
pub struct Ledger {
    store: LedgerStore,
    locks: AccountLocks,
}

impl Ledger {
    pub fn new(store: LedgerStore) -> Self {
        Self {
            store,
            locks: AccountLocks::new(),
        }
    }

    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self::new(LedgerStore::open(db_path)?))
    }

    pub(crate) fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Run `f` as one atomic unit while holding the locks of `accounts`.
    pub(crate) async fn unit<T>(
        &self,
        accounts: &[AccountId],
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.locks.lock(accounts).await;
        self.store.write(f).await
    }

    /// Create the account with zero balances, or return it if it exists.
    pub async fn open_account(&self, account_id: AccountId) -> Result<Account> {
        self.unit(&[account_id], |tx| {
            if store::insert_account(tx, account_id, Utc::now())? {
                info!(account_id, "👤 Account opened");
            }
            store::get_account(tx, account_id)?.ok_or(LedgerError::AccountNotFound(account_id))
        })
        .await
    }

    /// Soft-delete: the account and its history stay, further postings fail.
    ///
    /// Fails with `AccountHasOpenDuels` while the account is in a Pending or
    /// Active duel.
    pub async fn close_account(&self, account_id: AccountId) -> Result<Account> {
        self.unit(&[account_id], |tx| {
            store::get_account(tx, account_id)?.ok_or(LedgerError::AccountNotFound(account_id))?;
            let open = duel::open_duels_of(tx, account_id)?.len();
            if open > 0 {
                warn!(account_id, open, "Refusing to close account with open duels");
                return Err(LedgerError::AccountHasOpenDuels { account_id, open });
            }
            store::close_account(tx, account_id, Utc::now())?;
            info!(account_id, "Account closed");
            store::get_account(tx, account_id)?.ok_or(LedgerError::AccountNotFound(account_id))
        })
        .await
    }

    pub async fn account(&self, account_id: AccountId) -> Result<Account> {
        self.store
            .read(|conn| {
                store::get_account(conn, account_id)?.ok_or(LedgerError::AccountNotFound(account_id))
            })
            .await
    }

    pub async fn credit(&self, posting: Posting) -> Result<Transaction> {
        let posted = self
            .unit(&[posting.account_id], |tx| post(tx, Direction::Credit, &posting))
            .await?;
        Ok(posted.transaction)
    }

    /// Fails with `InsufficientFunds` (and writes nothing) if the balance is short.
    pub async fn debit(&self, posting: Posting) -> Result<Transaction> {
        let posted = self
            .unit(&[posting.account_id], |tx| post(tx, Direction::Debit, &posting))
            .await?;
        Ok(posted.transaction)
    }

    pub async fn balance(&self, account_id: AccountId) -> Result<Balances> {
        Ok(self.account(account_id).await?.balances())
    }

    /// Newest entries first, at most `limit` (clamped to 1..=1000).
    pub async fn history(&self, account_id: AccountId, limit: usize) -> Result<Vec<Transaction>> {
        self.store
            .read(|conn| store::recent_transactions(conn, account_id, limit))
            .await
    }

    pub async fn transaction_by_key(&self, key: &str) -> Result<Option<Transaction>> {
        self.store.read(|conn| store::transaction_by_key(conn, key)).await
    }

    /// Recompute balances from the log and compare with the stored ones.
    pub async fn reconcile_report(&self, account_id: AccountId) -> Result<Reconciliation> {
        let report = self.store.read(|conn| reconcile_in(conn, account_id)).await?;
        if let Some(mismatch) = report.first_mismatch() {
            error!(
                account_id,
                currency = %mismatch.currency,
                stored = mismatch.stored,
                derived = mismatch.derived,
                chain_intact = mismatch.chain_intact,
                "🚨 Reconciliation mismatch; flagged for manual audit"
            );
        }
        Ok(report)
    }

    pub async fn reconcile(&self, account_id: AccountId) -> Result<bool> {
        Ok(self.reconcile_report(account_id).await?.is_consistent())
    }

    /// Like [`Ledger::reconcile`], but a mismatch is an error.
    pub async fn require_reconciled(&self, account_id: AccountId) -> Result<()> {
        let report = self.reconcile_report(account_id).await?;
        match report.first_mismatch() {
            None => Ok(()),
            Some(m) => Err(LedgerError::ReconciliationMismatch {
                account_id,
                currency: m.currency,
                stored: m.stored,
                derived: m.derived,
            }),
        }
    }

    /// Reconcile every account; returns only the inconsistent reports.
    pub async fn audit(&self) -> Result<Vec<Reconciliation>> {
        let ids = self.store.read(store::list_account_ids).await?;
        let mut mismatches = Vec::new();
        for id in ids {
            let report = self.reconcile_report(id).await?;
            if !report.is_consistent() {
                mismatches.push(report);
            }
        }
        info!(mismatches = mismatches.len(), "Ledger audit complete");
        Ok(mismatches)
    }
}
