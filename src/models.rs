//! Ledger Data Model
//!
//! Typed records for the account ledger: balances in two currencies, the
//! immutable transaction log, referral connections, unlocked achievements and
//! two-party duels. Every amount is fixed-point so that sums reconcile exactly.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Stable external user identifier (the chat platform's user id).
pub type AccountId = i64;

/// Fixed-point amount in minor units (1.00 == 100).
pub type Amount = i64;

/// Conversion factor: 1 whole unit = 100 minor units
pub const AMOUNT_SCALE: Amount = 100;

/// Convert f64 to fixed-point Amount.
#[inline]
pub fn to_amount(value: f64) -> Amount {
    (value * AMOUNT_SCALE as f64).round() as Amount
}

/// Parse a non-negative decimal string ("12", "12.5", "12.50") into minor units.
///
/// Returns `None` for signs, more than two fractional digits, or overflow.
pub fn parse_amount(raw: &str) -> Option<Amount> {
    let raw = raw.trim();
    let (whole, frac) = match raw.split_once('.') {
        Some((w, f)) => (w, f),
        None => (raw, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if frac.len() > 2 || !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole: Amount = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac: Amount = match frac.len() {
        0 => 0,
        1 => frac.parse::<Amount>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    whole.checked_mul(AMOUNT_SCALE)?.checked_add(frac)
}

/// Render minor units as a decimal string with two places.
pub fn format_amount(amount: Amount) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let scale = AMOUNT_SCALE as u64;
    format!("{}{}.{:02}", sign, abs / scale, abs % scale)
}

// =============================================================================
// CURRENCY
// =============================================================================

/// The two ledger currencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    /// Internal, non-withdrawable token
    Token,
    /// External, redeemable unit
    Diamond,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Token, Currency::Diamond];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Token => "token",
            Currency::Diamond => "diamond",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "token" | "tokens" => Some(Currency::Token),
            "diamond" | "diamonds" => Some(Currency::Diamond),
            _ => None,
        }
    }

    /// Smallest amount this currency can hold, in minor units.
    ///
    /// Tokens are divisible to the cent; diamonds only exist whole.
    pub fn min_unit(&self) -> Amount {
        match self {
            Currency::Token => 1,
            Currency::Diamond => AMOUNT_SCALE,
        }
    }

    /// Round a computed amount to the nearest minimum unit, never below one unit.
    pub fn round_to_unit(&self, raw: f64) -> Amount {
        let unit = self.min_unit() as f64;
        let units = (raw / unit).round().max(1.0);
        (units * unit) as Amount
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ACCOUNT
// =============================================================================

/// Current balances of one account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub token_balance: Amount,
    pub diamond_balance: Amount,
}

impl Balances {
    pub fn of(&self, currency: Currency) -> Amount {
        match currency {
            Currency::Token => self.token_balance,
            Currency::Diamond => self.diamond_balance,
        }
    }
}

/// Per-user balance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub token_balance: Amount,
    pub diamond_balance: Amount,
    pub tokens_earned: Amount,
    pub tokens_spent: Amount,
    pub diamonds_earned: Amount,
    pub diamonds_spent: Amount,
    pub daily_streak: u32,
    pub last_bonus_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    /// Soft-delete marker; closed accounts keep their history
    pub closed_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn balances(&self) -> Balances {
        Balances {
            token_balance: self.token_balance,
            diamond_balance: self.diamond_balance,
        }
    }

    pub fn balance(&self, currency: Currency) -> Amount {
        self.balances().of(currency)
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

// =============================================================================
// TRANSACTION
// =============================================================================

/// What caused a balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    RegistrationBonus,
    ReferralBonus,
    DailyBonus,
    AchievementReward,
    ShopPurchase,
    DuelEntry,
    DuelPayout,
    DuelRefund,
    ExternalDeposit,
    ExternalWithdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::RegistrationBonus => "registration_bonus",
            TransactionType::ReferralBonus => "referral_bonus",
            TransactionType::DailyBonus => "daily_bonus",
            TransactionType::AchievementReward => "achievement_reward",
            TransactionType::ShopPurchase => "shop_purchase",
            TransactionType::DuelEntry => "duel_entry",
            TransactionType::DuelPayout => "duel_payout",
            TransactionType::DuelRefund => "duel_refund",
            TransactionType::ExternalDeposit => "external_deposit",
            TransactionType::ExternalWithdrawal => "external_withdrawal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registration_bonus" => Some(TransactionType::RegistrationBonus),
            "referral_bonus" => Some(TransactionType::ReferralBonus),
            "daily_bonus" => Some(TransactionType::DailyBonus),
            "achievement_reward" => Some(TransactionType::AchievementReward),
            "shop_purchase" => Some(TransactionType::ShopPurchase),
            "duel_entry" => Some(TransactionType::DuelEntry),
            "duel_payout" => Some(TransactionType::DuelPayout),
            "duel_refund" => Some(TransactionType::DuelRefund),
            "external_deposit" => Some(TransactionType::ExternalDeposit),
            "external_withdrawal" => Some(TransactionType::ExternalWithdrawal),
            _ => None,
        }
    }
}

/// Immutable log entry for one balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Monotonic; creation order of the log
    pub id: i64,
    pub account_id: AccountId,
    pub currency: Currency,
    pub signed_amount: Amount,
    pub kind: TransactionType,
    pub balance_before: Amount,
    pub balance_after: Amount,
    pub description: String,
    pub idempotency_key: String,
    /// Duel id or referral connection id the entry belongs to
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn is_consistent(&self) -> bool {
        self.balance_before.checked_add(self.signed_amount) == Some(self.balance_after)
    }
}

// =============================================================================
// BONUS RECORDS
// =============================================================================

/// Unique (referrer, referred) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralConnection {
    pub id: i64,
    pub referrer_id: AccountId,
    pub referred_id: AccountId,
    pub bonus_paid: bool,
    pub created_at: DateTime<Utc>,
}

/// One unlocked achievement of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Achievement {
    pub account_id: AccountId,
    pub achievement_id: String,
    pub reward_tokens: Amount,
    pub reward_diamonds: Amount,
    pub unlocked_at: DateTime<Utc>,
}

// =============================================================================
// DUEL
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuelStatus {
    Pending,
    Active,
    Settled,
    Cancelled,
}

impl DuelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuelStatus::Pending => "pending",
            DuelStatus::Active => "active",
            DuelStatus::Settled => "settled",
            DuelStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DuelStatus::Pending),
            "active" => Some(DuelStatus::Active),
            "settled" => Some(DuelStatus::Settled),
            "cancelled" => Some(DuelStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DuelStatus::Settled | DuelStatus::Cancelled)
    }
}

impl std::fmt::Display for DuelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two-party wager held in escrow until settlement or cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duel {
    pub id: String,
    pub challenger_id: AccountId,
    pub opponent_id: AccountId,
    pub wager_amount: Amount,
    pub currency: Currency,
    pub status: DuelStatus,
    pub winner_id: Option<AccountId>,
    pub challenger_result: Option<i64>,
    pub opponent_result: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Duel {
    pub fn is_participant(&self, account_id: AccountId) -> bool {
        account_id == self.challenger_id || account_id == self.opponent_id
    }

    /// Full pot once both stakes are escrowed; `None` if it does not fit an `Amount`.
    pub fn pot(&self) -> Option<Amount> {
        self.wager_amount.checked_mul(2)
    }
}
