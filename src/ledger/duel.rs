//! Duel Escrow
//!
//! Two-party wagers with true escrow: each stake is debited when the
//! participant enters, and the pot leaves escrow exactly once, either to the
//! winner on settlement or back to the payers on cancellation.
//!
//! State machine: `Pending -> Active -> {Settled | Cancelled}`, with
//! `Pending -> Cancelled` also allowed. No transition is reversible.
//!
//! Every escrow movement references the duel id, so the escrowed amount of a
//! duel is always derivable from the transaction log.

use crate::ledger::engine::{post, Direction, Ledger, Posting};
use crate::ledger::error::{LedgerError, Result};
use crate::ledger::store::{self, parse_tag};
use crate::models::{AccountId, Amount, Currency, Duel, DuelStatus, TransactionType};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};
use uuid::Uuid;

pub fn entry_key(duel_id: &str, account_id: AccountId) -> String {
    format!("duel:{duel_id}:entry:{account_id}")
}

pub fn payout_key(duel_id: &str) -> String {
    format!("duel:{duel_id}:payout")
}

pub fn refund_key(duel_id: &str, account_id: AccountId) -> String {
    format!("duel:{duel_id}:refund:{account_id}")
}

#[derive(Clone)]
pub struct DuelEscrow {
    ledger: Ledger,
}

impl DuelEscrow {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Open a duel under a fresh id and escrow the challenger's stake.
    pub async fn create_duel(
        &self,
        challenger_id: AccountId,
        opponent_id: AccountId,
        wager_amount: Amount,
        currency: Currency,
    ) -> Result<Duel> {
        let duel_id = Uuid::new_v4().to_string();
        self.create_duel_with_id(&duel_id, challenger_id, opponent_id, wager_amount, currency)
            .await
    }

    /// Like [`DuelEscrow::create_duel`] with a caller-chosen id; retrying with
    /// the same id and terms returns the existing duel.
    pub async fn create_duel_with_id(
        &self,
        duel_id: &str,
        challenger_id: AccountId,
        opponent_id: AccountId,
        wager_amount: Amount,
        currency: Currency,
    ) -> Result<Duel> {
        // Both stakes together must fit an Amount
        if wager_amount <= 0 || wager_amount.checked_mul(2).is_none() {
            return Err(LedgerError::InvalidAmount(wager_amount));
        }
        if challenger_id == opponent_id {
            return Err(LedgerError::InvalidParticipant {
                account_id: opponent_id,
                reason: "cannot duel yourself",
            });
        }

        self.ledger
            .unit(&[challenger_id, opponent_id], |tx| {
                if let Some(existing) = get_duel(tx, duel_id)? {
                    let same_terms = existing.challenger_id == challenger_id
                        && existing.opponent_id == opponent_id
                        && existing.wager_amount == wager_amount
                        && existing.currency == currency;
                    if !same_terms {
                        return Err(LedgerError::IdempotencyConflict {
                            key: duel_id.to_string(),
                        });
                    }
                    return Ok(existing);
                }
                let opponent = store::get_account(tx, opponent_id)?
                    .ok_or(LedgerError::AccountNotFound(opponent_id))?;
                if opponent.is_closed() {
                    return Err(LedgerError::AccountClosed(opponent_id));
                }

                let duel = Duel {
                    id: duel_id.to_string(),
                    challenger_id,
                    opponent_id,
                    wager_amount,
                    currency,
                    status: DuelStatus::Pending,
                    winner_id: None,
                    challenger_result: None,
                    opponent_result: None,
                    created_at: Utc::now(),
                    settled_at: None,
                };
                insert_duel(tx, &duel)?;
                post(tx, Direction::Debit, &stake_posting(&duel, challenger_id))?;

                info!(
                    duel_id,
                    challenger_id,
                    opponent_id,
                    wager = wager_amount,
                    currency = %currency,
                    "⚔️ Duel created"
                );
                Ok(duel)
            })
            .await
    }

    /// Escrow the opponent's stake and activate the duel.
    ///
    /// If the opponent cannot afford it the duel stays `Pending` with the
    /// challenger's stake still escrowed.
    pub async fn accept_duel(&self, duel_id: &str) -> Result<Duel> {
        self.with_duel(duel_id, |tx, mut duel| match duel.status {
            DuelStatus::Active => Ok(duel),
            DuelStatus::Pending => {
                let posted = post(tx, Direction::Debit, &stake_posting(&duel, duel.opponent_id))?;
                if posted.replayed {
                    warn!(duel_id, "Opponent stake already escrowed; completing activation");
                }
                duel.status = DuelStatus::Active;
                save_duel(tx, &duel)?;
                info!(duel_id, opponent_id = duel.opponent_id, "Duel accepted");
                Ok(duel)
            }
            from => Err(invalid_transition(&duel.id, from, "accept")),
        })
        .await
    }

    /// Pay the full pot to `winner_id` and close the duel.
    ///
    /// Valid only from `Active`. A duel found `Active` with its payout
    /// already in the log only gets its status written; the winner is never
    /// paid twice.
    pub async fn settle_duel(
        &self,
        duel_id: &str,
        winner_id: AccountId,
        challenger_result: i64,
        opponent_result: i64,
    ) -> Result<Duel> {
        self.with_duel(duel_id, |tx, mut duel| {
            if !duel.is_participant(winner_id) {
                return Err(LedgerError::InvalidParticipant {
                    account_id: winner_id,
                    reason: "winner must be a duel participant",
                });
            }
            let status = duel.status;
            match status {
                DuelStatus::Settled if duel.winner_id == Some(winner_id) => Ok(duel),
                DuelStatus::Active => {
                    let pot = duel
                        .pot()
                        .ok_or_else(|| LedgerError::Corrupt(format!("duel {} pot overflows", duel.id)))?;
                    let posting = Posting::new(
                        winner_id,
                        duel.currency,
                        pot,
                        TransactionType::DuelPayout,
                        payout_key(&duel.id),
                    )
                    .with_description(format!("Duel {} winnings", duel.id))
                    .with_reference(duel.id.clone());
                    let posted = post(tx, Direction::Credit, &posting)?;
                    if posted.replayed {
                        warn!(duel_id, "Payout already posted; completing settlement");
                    }

                    duel.status = DuelStatus::Settled;
                    duel.winner_id = Some(winner_id);
                    duel.challenger_result = Some(challenger_result);
                    duel.opponent_result = Some(opponent_result);
                    duel.settled_at = Some(Utc::now());
                    save_duel(tx, &duel)?;

                    info!(duel_id, winner_id, pot, "🏁 Duel settled");
                    Ok(duel)
                }
                from => Err(invalid_transition(&duel.id, from, "settle")),
            }
        })
        .await
    }

    /// Refund every escrowed stake to its payer and close the duel.
    pub async fn cancel_duel(&self, duel_id: &str) -> Result<Duel> {
        self.with_duel(duel_id, |tx, mut duel| match duel.status {
            DuelStatus::Cancelled => Ok(duel),
            DuelStatus::Pending | DuelStatus::Active => {
                for payer in [duel.challenger_id, duel.opponent_id] {
                    let Some(entry) = store::transaction_by_key(tx, &entry_key(&duel.id, payer))? else {
                        continue;
                    };
                    let posting = Posting::new(
                        payer,
                        entry.currency,
                        -entry.signed_amount,
                        TransactionType::DuelRefund,
                        refund_key(&duel.id, payer),
                    )
                    .with_description(format!("Duel {} cancelled, stake refunded", duel.id))
                    .with_reference(duel.id.clone());
                    post(tx, Direction::Credit, &posting)?;
                }

                duel.status = DuelStatus::Cancelled;
                duel.settled_at = Some(Utc::now());
                save_duel(tx, &duel)?;
                info!(duel_id, "Duel cancelled; stakes refunded");
                Ok(duel)
            }
            from => Err(invalid_transition(&duel.id, from, "cancel")),
        })
        .await
    }

    pub async fn duel(&self, duel_id: &str) -> Result<Duel> {
        self.ledger
            .store()
            .read(|conn| get_duel(conn, duel_id)?.ok_or_else(|| LedgerError::DuelNotFound(duel_id.to_string())))
            .await
    }

    /// Duels involving `account_id` that have not reached a terminal state.
    pub async fn open_duels_of(&self, account_id: AccountId) -> Result<Vec<Duel>> {
        self.ledger
            .store()
            .read(|conn| open_duels_of(conn, account_id))
            .await
    }

    /// Amount currently held in escrow for a duel, derived from the log.
    pub async fn escrow_balance(&self, duel_id: &str) -> Result<Amount> {
        self.ledger
            .store()
            .read(|conn| {
                let entries = store::transactions_by_reference(conn, duel_id)?;
                Ok(-entries.iter().map(|t| t.signed_amount).sum::<Amount>())
            })
            .await
    }

    /// Lock both participants, then re-read the duel inside the unit of work.
    async fn with_duel<T>(
        &self,
        duel_id: &str,
        f: impl FnOnce(&rusqlite::Transaction<'_>, Duel) -> Result<T>,
    ) -> Result<T> {
        let participants = self.duel(duel_id).await?;
        self.ledger
            .unit(&[participants.challenger_id, participants.opponent_id], |tx| {
                let duel = get_duel(tx, duel_id)?
                    .ok_or_else(|| LedgerError::DuelNotFound(duel_id.to_string()))?;
                f(tx, duel)
            })
            .await
    }
}

fn stake_posting(duel: &Duel, payer: AccountId) -> Posting {
    Posting::new(
        payer,
        duel.currency,
        duel.wager_amount,
        TransactionType::DuelEntry,
        entry_key(&duel.id, payer),
    )
    .with_description(format!("Duel {} stake", duel.id))
    .with_reference(duel.id.clone())
}

fn invalid_transition(duel_id: &str, from: DuelStatus, action: &'static str) -> LedgerError {
    warn!(duel_id, from = %from, action, "Rejected duel transition");
    LedgerError::InvalidStateTransition {
        duel_id: duel_id.to_string(),
        from,
        action,
    }
}

// =============================================================================
// DUEL ROWS
// =============================================================================

const DUEL_COLUMNS: &str = "id, challenger_id, opponent_id, wager_amount, currency, status, winner_id, \
     challenger_result, opponent_result, created_at, settled_at";

fn duel_from_row(row: &Row<'_>) -> rusqlite::Result<Duel> {
    Ok(Duel {
        id: row.get(0)?,
        challenger_id: row.get(1)?,
        opponent_id: row.get(2)?,
        wager_amount: row.get(3)?,
        currency: parse_tag(4, row.get(4)?, Currency::parse)?,
        status: parse_tag(5, row.get(5)?, DuelStatus::parse)?,
        winner_id: row.get(6)?,
        challenger_result: row.get(7)?,
        opponent_result: row.get(8)?,
        created_at: row.get(9)?,
        settled_at: row.get(10)?,
    })
}

fn get_duel(conn: &Connection, duel_id: &str) -> Result<Option<Duel>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {DUEL_COLUMNS} FROM duels WHERE id = ?1"))?;
    Ok(stmt.query_row([duel_id], duel_from_row).optional()?)
}

fn insert_duel(conn: &Connection, duel: &Duel) -> Result<()> {
    conn.execute(
        "INSERT INTO duels (id, challenger_id, opponent_id, wager_amount, currency, status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            duel.id,
            duel.challenger_id,
            duel.opponent_id,
            duel.wager_amount,
            duel.currency.as_str(),
            duel.status.as_str(),
            duel.created_at,
        ],
    )?;
    Ok(())
}

fn save_duel(conn: &Connection, duel: &Duel) -> Result<()> {
    conn.execute(
        "UPDATE duels SET status = ?2, winner_id = ?3, challenger_result = ?4, \
         opponent_result = ?5, settled_at = ?6 WHERE id = ?1",
        params![
            duel.id,
            duel.status.as_str(),
            duel.winner_id,
            duel.challenger_result,
            duel.opponent_result,
            duel.settled_at,
        ],
    )?;
    Ok(())
}

/// Pending and Active duels the account takes part in, oldest first.
pub(crate) fn open_duels_of(conn: &Connection, account_id: AccountId) -> Result<Vec<Duel>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {DUEL_COLUMNS} FROM duels \
         WHERE challenger_id = ?1 OR opponent_id = ?1 \
         ORDER BY created_at ASC"
    ))?;
    let rows = stmt
        .query_map([account_id], duel_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows.into_iter().filter(|d| !d.status.is_terminal()).collect())
}
