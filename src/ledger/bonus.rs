//! Bonus Issuer
//!
//! Policy layer over the ledger engine for registration, referral, daily streak
//! and achievement rewards. Each award is one atomic unit: the credits and
//! the bookkeeping row (referral flag, streak, achievement) commit together.
//! Every credit carries a deterministic idempotency key, so re-running an
//! award after an ambiguous failure completes it instead of paying twice.

use crate::config::BonusPolicy;
use crate::ledger::engine::{post, Direction, Ledger, Posting};
use crate::ledger::error::{LedgerError, Result};
use crate::ledger::store;
use crate::models::{
    AccountId, Achievement, Amount, Currency, ReferralConnection, Transaction, TransactionType,
};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Outcome of an exactly-once award.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Issuance<T> {
    /// This call paid the award
    Granted(T),
    /// An earlier call already paid it; nothing new happened
    AlreadyGranted(T),
}

impl<T> Issuance<T> {
    pub fn is_granted(&self) -> bool {
        matches!(self, Issuance::Granted(_))
    }

    pub fn get(&self) -> &T {
        match self {
            Issuance::Granted(v) | Issuance::AlreadyGranted(v) => v,
        }
    }
}

/// A successful daily claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyClaim {
    pub date: NaiveDate,
    pub streak: u32,
    pub amount: Amount,
    pub transaction: Transaction,
}

pub fn registration_key(account_id: AccountId) -> String {
    format!("reg:{account_id}")
}

pub fn daily_key(account_id: AccountId, date: NaiveDate) -> String {
    format!("daily:{account_id}:{date}")
}

#[derive(Clone)]
pub struct BonusIssuer {
    ledger: Ledger,
    policy: BonusPolicy,
}

impl BonusIssuer {
    pub fn new(ledger: Ledger, policy: BonusPolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn policy(&self) -> &BonusPolicy {
        &self.policy
    }

    /// Starting grant; keyed by account so repeated registrations pay once.
    pub async fn award_registration_bonus(&self, account_id: AccountId) -> Result<Issuance<Transaction>> {
        let posting = Posting::new(
            account_id,
            Currency::Token,
            self.policy.registration_bonus,
            TransactionType::RegistrationBonus,
            registration_key(account_id),
        )
        .with_description("Registration bonus");

        let posted = self
            .ledger
            .unit(&[account_id], |tx| post(tx, Direction::Credit, &posting))
            .await?;

        if posted.replayed {
            Ok(Issuance::AlreadyGranted(posted.transaction))
        } else {
            info!(account_id, amount = posted.transaction.signed_amount, "🎉 Registration bonus granted");
            Ok(Issuance::Granted(posted.transaction))
        }
    }

    // =========================================================================
    // REFERRALS
    // =========================================================================

    /// Record who referred `referred_id`, without paying anything yet.
    pub async fn register_referral(
        &self,
        referrer_id: AccountId,
        referred_id: AccountId,
    ) -> Result<ReferralConnection> {
        self.ledger
            .unit(&[referrer_id, referred_id], |tx| {
                connection_for(tx, referrer_id, referred_id)
            })
            .await
    }

    /// Pay both sides of a referral exactly once.
    ///
    /// The two credits and the `bonus_paid` flip commit together. If a
    /// previous run left one credit in the log with the flag still false,
    /// its posting replays and only the missing half is written.
    pub async fn award_referral_bonus(
        &self,
        referrer_id: AccountId,
        referred_id: AccountId,
    ) -> Result<Issuance<ReferralConnection>> {
        let policy = &self.policy;
        self.ledger
            .unit(&[referrer_id, referred_id], |tx| {
                let connection = connection_for(tx, referrer_id, referred_id)?;
                if connection.bonus_paid {
                    return Ok(Issuance::AlreadyGranted(connection));
                }

                let reference = format!("referral:{}", connection.id);
                let referrer_posting = Posting::new(
                    referrer_id,
                    policy.referral_currency,
                    policy.referrer_bonus,
                    TransactionType::ReferralBonus,
                    format!("{reference}:referrer"),
                )
                .with_description(format!("Referral bonus for inviting {referred_id}"))
                .with_reference(reference.clone());
                let referred_posting = Posting::new(
                    referred_id,
                    policy.referral_currency,
                    policy.referred_bonus,
                    TransactionType::ReferralBonus,
                    format!("{reference}:referred"),
                )
                .with_description(format!("Referral bonus for joining via {referrer_id}"))
                .with_reference(reference);

                let referrer_posted = post(tx, Direction::Credit, &referrer_posting)?;
                let referred_posted = post(tx, Direction::Credit, &referred_posting)?;
                if referrer_posted.replayed || referred_posted.replayed {
                    warn!(
                        connection_id = connection.id,
                        "Completing partially applied referral bonus"
                    );
                }

                mark_referral_paid(tx, connection.id)?;
                info!(referrer_id, referred_id, "🤝 Referral bonus granted");

                Ok(Issuance::Granted(ReferralConnection {
                    bonus_paid: true,
                    ..connection
                }))
            })
            .await
    }

    pub async fn referrals_of(&self, referrer_id: AccountId) -> Result<Vec<ReferralConnection>> {
        self.ledger
            .store()
            .read(|conn| referrals_of(conn, referrer_id))
            .await
    }

    // =========================================================================
    // DAILY STREAK
    // =========================================================================

    /// Claim the daily bonus for `today`.
    ///
    /// Consecutive days grow the streak; any gap resets it to 1. A second
    /// claim for the same day fails with `AlreadyClaimed` and changes nothing.
    pub async fn claim_daily_bonus(&self, account_id: AccountId, today: NaiveDate) -> Result<DailyClaim> {
        let policy = &self.policy;
        self.ledger
            .unit(&[account_id], |tx| {
                let account = store::get_account(tx, account_id)?
                    .ok_or(LedgerError::AccountNotFound(account_id))?;

                // A claim dated before the last one is treated like a same-day repeat.
                if account.last_bonus_date.is_some_and(|last| last >= today) {
                    return Err(LedgerError::AlreadyClaimed {
                        account_id,
                        date: today,
                    });
                }

                let streak = match account.last_bonus_date {
                    Some(last) if today.pred_opt() == Some(last) => account.daily_streak + 1,
                    _ => 1,
                };
                let amount = policy.daily_amount(streak);

                let posting = Posting::new(
                    account_id,
                    policy.daily_currency,
                    amount,
                    TransactionType::DailyBonus,
                    daily_key(account_id, today),
                )
                .with_description(format!("Daily bonus, day {streak} of streak"));
                let posted = post(tx, Direction::Credit, &posting)?;
                if posted.replayed {
                    warn!(account_id, %today, "Daily bonus already posted; completing streak write");
                }

                store::set_streak(tx, account_id, streak, today)?;
                info!(account_id, streak, amount, "📅 Daily bonus claimed");

                Ok(DailyClaim {
                    date: today,
                    streak,
                    amount: posted.transaction.signed_amount,
                    transaction: posted.transaction,
                })
            })
            .await
    }

    /// Convenience for callers without their own clock.
    pub async fn claim_daily_bonus_now(&self, account_id: AccountId) -> Result<DailyClaim> {
        self.claim_daily_bonus(account_id, Utc::now().date_naive()).await
    }

    // =========================================================================
    // ACHIEVEMENTS
    // =========================================================================

    /// Unlock an achievement and pay its rewards once. Zero rewards are not posted.
    pub async fn award_achievement(
        &self,
        account_id: AccountId,
        achievement_id: &str,
        reward_tokens: Amount,
        reward_diamonds: Amount,
    ) -> Result<Issuance<Achievement>> {
        for reward in [reward_tokens, reward_diamonds] {
            if reward < 0 {
                return Err(LedgerError::InvalidAmount(reward));
            }
        }

        self.ledger
            .unit(&[account_id], |tx| {
                if let Some(existing) = get_achievement(tx, account_id, achievement_id)? {
                    return Ok(Issuance::AlreadyGranted(existing));
                }
                store::get_account(tx, account_id)?.ok_or(LedgerError::AccountNotFound(account_id))?;

                let achievement = Achievement {
                    account_id,
                    achievement_id: achievement_id.to_string(),
                    reward_tokens,
                    reward_diamonds,
                    unlocked_at: Utc::now(),
                };
                insert_achievement(tx, &achievement)?;

                for (currency, amount) in [
                    (Currency::Token, reward_tokens),
                    (Currency::Diamond, reward_diamonds),
                ] {
                    if amount == 0 {
                        continue;
                    }
                    let posting = Posting::new(
                        account_id,
                        currency,
                        amount,
                        TransactionType::AchievementReward,
                        format!("achievement:{account_id}:{achievement_id}:{currency}"),
                    )
                    .with_description(format!("Achievement unlocked: {achievement_id}"));
                    post(tx, Direction::Credit, &posting)?;
                }

                info!(account_id, achievement_id, "🏆 Achievement unlocked");
                Ok(Issuance::Granted(achievement))
            })
            .await
    }

    pub async fn achievements_of(&self, account_id: AccountId) -> Result<Vec<Achievement>> {
        self.ledger
            .store()
            .read(|conn| achievements_of(conn, account_id))
            .await
    }
}

// =============================================================================
// REFERRAL ROWS
// =============================================================================

const REFERRAL_COLUMNS: &str = "id, referrer_id, referred_id, bonus_paid, created_at";

fn referral_from_row(row: &Row<'_>) -> rusqlite::Result<ReferralConnection> {
    Ok(ReferralConnection {
        id: row.get(0)?,
        referrer_id: row.get(1)?,
        referred_id: row.get(2)?,
        bonus_paid: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Look up the connection for `referred_id`, creating it if absent.
fn connection_for(
    conn: &Connection,
    referrer_id: AccountId,
    referred_id: AccountId,
) -> Result<ReferralConnection> {
    if referrer_id == referred_id {
        return Err(LedgerError::InvalidReferral {
            referrer_id,
            referred_id,
            reason: "an account cannot refer itself",
        });
    }
    for id in [referrer_id, referred_id] {
        store::get_account(conn, id)?.ok_or(LedgerError::AccountNotFound(id))?;
    }

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {REFERRAL_COLUMNS} FROM referral_connections WHERE referred_id = ?1"
    ))?;
    match stmt.query_row([referred_id], referral_from_row).optional()? {
        Some(existing) if existing.referrer_id == referrer_id => Ok(existing),
        Some(_) => Err(LedgerError::InvalidReferral {
            referrer_id,
            referred_id,
            reason: "account already has a different referrer",
        }),
        None => {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO referral_connections (referrer_id, referred_id, bonus_paid, created_at) \
                 VALUES (?1, ?2, 0, ?3)",
                params![referrer_id, referred_id, now],
            )?;
            info!(referrer_id, referred_id, "Referral connection recorded");
            Ok(ReferralConnection {
                id: conn.last_insert_rowid(),
                referrer_id,
                referred_id,
                bonus_paid: false,
                created_at: now,
            })
        }
    }
}

fn mark_referral_paid(conn: &Connection, connection_id: i64) -> Result<()> {
    let updated = conn.execute(
        "UPDATE referral_connections SET bonus_paid = 1 WHERE id = ?1 AND bonus_paid = 0",
        [connection_id],
    )?;
    if updated != 1 {
        return Err(LedgerError::Corrupt(format!(
            "referral connection {connection_id} flag flip touched {updated} rows"
        )));
    }
    Ok(())
}

fn referrals_of(conn: &Connection, referrer_id: AccountId) -> Result<Vec<ReferralConnection>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {REFERRAL_COLUMNS} FROM referral_connections WHERE referrer_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map([referrer_id], referral_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// =============================================================================
// ACHIEVEMENT ROWS
// =============================================================================

const ACHIEVEMENT_COLUMNS: &str =
    "account_id, achievement_id, reward_tokens, reward_diamonds, unlocked_at";

fn achievement_from_row(row: &Row<'_>) -> rusqlite::Result<Achievement> {
    Ok(Achievement {
        account_id: row.get(0)?,
        achievement_id: row.get(1)?,
        reward_tokens: row.get(2)?,
        reward_diamonds: row.get(3)?,
        unlocked_at: row.get(4)?,
    })
}

fn get_achievement(
    conn: &Connection,
    account_id: AccountId,
    achievement_id: &str,
) -> Result<Option<Achievement>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ACHIEVEMENT_COLUMNS} FROM achievements WHERE account_id = ?1 AND achievement_id = ?2"
    ))?;
    Ok(stmt
        .query_row(params![account_id, achievement_id], achievement_from_row)
        .optional()?)
}

fn insert_achievement(conn: &Connection, achievement: &Achievement) -> Result<()> {
    conn.execute(
        "INSERT INTO achievements (account_id, achievement_id, reward_tokens, reward_diamonds, unlocked_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            achievement.account_id,
            achievement.achievement_id,
            achievement.reward_tokens,
            achievement.reward_diamonds,
            achievement.unlocked_at,
        ],
    )?;
    Ok(())
}

fn achievements_of(conn: &Connection, account_id: AccountId) -> Result<Vec<Achievement>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ACHIEVEMENT_COLUMNS} FROM achievements WHERE account_id = ?1 ORDER BY unlocked_at ASC"
    ))?;
    let rows = stmt
        .query_map([account_id], achievement_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

