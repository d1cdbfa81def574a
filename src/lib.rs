//! TokenBot Ledger Library
//!
//! Account ledger for the chat bot: token and diamond balances, immutable
//! transaction history, idempotent bonuses and duel escrow. Chat transport,
//! menus and registration dialogs live elsewhere and call into this crate.

pub mod config;
pub mod ledger;
pub mod models;

pub use config::{BonusPolicy, Config};
pub use ledger::{BonusIssuer, DuelEscrow, Ledger, LedgerError};
