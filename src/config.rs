//! Ledger Configuration
//!
//! Bonus amounts live in one [`BonusPolicy`] so every caller pays the same
//! figures. The policy can be loaded from a TOML file and individual fields
//! overridden through the environment.

use crate::models::{format_amount, to_amount, Amount, Currency};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Reward amounts and daily streak shape, in minor units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BonusPolicy {
    /// Starting grant credited once per new account
    pub registration_bonus: Amount,
    pub referrer_bonus: Amount,
    pub referred_bonus: Amount,
    pub referral_currency: Currency,
    /// Day-one amount of the daily bonus
    pub daily_base: Amount,
    /// Growth factor per consecutive day
    pub daily_multiplier: f64,
    /// Exponent ceiling: streaks beyond `cap + 1` days pay the same as `cap + 1`
    pub daily_streak_cap: u32,
    pub daily_currency: Currency,
}

impl Default for BonusPolicy {
    fn default() -> Self {
        Self {
            registration_bonus: to_amount(50.0),
            referrer_bonus: to_amount(25.0),
            referred_bonus: to_amount(10.0),
            referral_currency: Currency::Token,
            daily_base: to_amount(5.0),
            daily_multiplier: 1.2,
            daily_streak_cap: 6,
            daily_currency: Currency::Token,
        }
    }
}

impl BonusPolicy {
    /// Load a policy from a TOML file; missing fields keep their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read bonus policy {}", path.display()))?;
        let policy: BonusPolicy =
            toml::from_str(&raw).with_context(|| format!("parse bonus policy {}", path.display()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Apply `REGISTRATION_BONUS`, `REFERRAL_BONUS_*` and `DAILY_*` overrides.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_amount("REGISTRATION_BONUS")? {
            self.registration_bonus = v;
        }
        if let Some(v) = env_amount("REFERRAL_BONUS_REFERRER")? {
            self.referrer_bonus = v;
        }
        if let Some(v) = env_amount("REFERRAL_BONUS_REFERRED")? {
            self.referred_bonus = v;
        }
        if let Some(v) = env_amount("DAILY_BONUS_BASE")? {
            self.daily_base = v;
        }
        if let Ok(raw) = env::var("DAILY_BONUS_MULTIPLIER") {
            self.daily_multiplier = raw
                .trim()
                .parse::<f64>()
                .context("Invalid DAILY_BONUS_MULTIPLIER")?;
        }
        if let Ok(raw) = env::var("DAILY_STREAK_CAP") {
            self.daily_streak_cap = raw.trim().parse::<u32>().context("Invalid DAILY_STREAK_CAP")?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("registration_bonus", self.registration_bonus),
            ("referrer_bonus", self.referrer_bonus),
            ("referred_bonus", self.referred_bonus),
            ("daily_base", self.daily_base),
        ] {
            if value <= 0 {
                bail!("{name} must be positive, got {value}");
            }
        }
        let unit = self.referral_currency.min_unit();
        for (name, value) in [
            ("referrer_bonus", self.referrer_bonus),
            ("referred_bonus", self.referred_bonus),
        ] {
            if value % unit != 0 {
                bail!(
                    "{name} {} is not a whole number of {} units",
                    format_amount(value),
                    self.referral_currency
                );
            }
        }
        if !(self.daily_multiplier.is_finite() && self.daily_multiplier >= 1.0) {
            bail!(
                "daily_multiplier must be finite and >= 1.0, got {}",
                self.daily_multiplier
            );
        }
        Ok(())
    }

    /// Daily bonus for a streak (1-based): `base * multiplier ^ min(streak - 1, cap)`.
    pub fn daily_amount(&self, streak: u32) -> Amount {
        let exponent = streak.saturating_sub(1).min(self.daily_streak_cap);
        let raw = self.daily_base as f64 * self.daily_multiplier.powi(exponent as i32);
        self.daily_currency.round_to_unit(raw)
    }
}

fn env_amount(var: &str) -> Result<Option<Amount>> {
    match env::var(var) {
        Ok(raw) => {
            let value = crate::models::parse_amount(&raw)
                .with_context(|| format!("Invalid {var}: {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub policy: BonusPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            env::var("LEDGER_DB_PATH").unwrap_or_else(|_| "./tokenbot_ledger.db".to_string());

        let policy = match env::var("LEDGER_POLICY_PATH") {
            Ok(path) if !path.trim().is_empty() => BonusPolicy::from_toml_file(path.trim())?,
            _ => BonusPolicy::default(),
        }
        .apply_env_overrides()?;

        Ok(Self {
            database_path,
            policy,
        })
    }
}
