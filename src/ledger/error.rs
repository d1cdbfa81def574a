use crate::models::{format_amount, AccountId, Amount, Currency, DuelStatus};
use chrono::NaiveDate;
use thiserror::Error;

/// Errors surfaced by ledger operations.
///
/// Every variant except `Database` and `Corrupt` is raised before any write,
/// so the caller can rely on "error => nothing changed".
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(
        "insufficient {currency} funds on account {account_id}: balance {}, requested {}",
        format_amount(*.balance),
        format_amount(*.requested)
    )]
    InsufficientFunds {
        account_id: AccountId,
        currency: Currency,
        balance: Amount,
        requested: Amount,
    },
    #[error("daily bonus already claimed by account {account_id} for {date}")]
    AlreadyClaimed { account_id: AccountId, date: NaiveDate },
    #[error("account {0} not found")]
    AccountNotFound(AccountId),
    #[error("account {0} is closed")]
    AccountClosed(AccountId),
    #[error("account {account_id} has {open} open duel(s); settle or cancel them first")]
    AccountHasOpenDuels { account_id: AccountId, open: usize },
    #[error("duel {0} not found")]
    DuelNotFound(String),
    #[error("reconciliation mismatch on account {account_id} ({currency}): stored {stored}, derived {derived}")]
    ReconciliationMismatch {
        account_id: AccountId,
        currency: Currency,
        stored: Amount,
        derived: Amount,
    },
    #[error("duel {duel_id} cannot {action} from {from}")]
    InvalidStateTransition {
        duel_id: String,
        from: DuelStatus,
        action: &'static str,
    },
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Amount),
    #[error("account {account_id} is not a valid participant: {reason}")]
    InvalidParticipant {
        account_id: AccountId,
        reason: &'static str,
    },
    #[error("invalid referral {referrer_id} -> {referred_id}: {reason}")]
    InvalidReferral {
        referrer_id: AccountId,
        referred_id: AccountId,
        reason: &'static str,
    },
    #[error("idempotency key {key:?} already used for a different operation")]
    IdempotencyConflict { key: String },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt ledger data: {0}")]
    Corrupt(String),
}

impl LedgerError {
    /// Rejections of the request itself, as opposed to hard failures: unknown
    /// accounts, storage errors, corrupt rows and reconciliation mismatches.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientFunds { .. }
                | LedgerError::AlreadyClaimed { .. }
                | LedgerError::InvalidAmount(_)
                | LedgerError::InvalidParticipant { .. }
                | LedgerError::InvalidReferral { .. }
                | LedgerError::InvalidStateTransition { .. }
                | LedgerError::AccountHasOpenDuels { .. }
                | LedgerError::AccountClosed(_)
                | LedgerError::DuelNotFound(_)
                | LedgerError::IdempotencyConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
