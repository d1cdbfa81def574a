//! Account Ledger
//!
//! Balances in two currencies, an append-only transaction log, exactly-once
//! bonus issuance and two-party duel escrow over a single SQLite store.
//!
//! Architecture:
//! - `store`: tables and row mapping, no policy
//! - `engine`: the only code that mutates balances; per-account locking
//! - `bonus`: registration, referral, daily streak and achievement rewards
//! - `duel`: wager escrow and settlement

pub mod bonus;
pub mod engine;
pub mod duel;
pub mod error;
pub mod locks;
pub mod store;

#[cfg(test)]
mod bonus_tests;

pub use bonus::{BonusIssuer, DailyClaim, Issuance};
pub use engine::{CurrencyReconciliation, Ledger, Posting, Reconciliation};
pub use duel::DuelEscrow;
pub use error::{LedgerError, Result};
pub use locks::{AccountGuard, AccountLocks};
pub use store::LedgerStore;
