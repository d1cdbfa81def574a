//! Bonus issuer tests: exactly-once awards and daily streak rules.

use crate::config::BonusPolicy;
use crate::ledger::bonus::{BonusIssuer, Issuance};
use crate::ledger::engine::{Ledger, Posting};
use crate::ledger::error::LedgerError;
use crate::models::{Currency, TransactionType};
use chrono::NaiveDate;
use std::sync::Arc;
use tempfile::TempDir;

fn test_policy() -> BonusPolicy {
    BonusPolicy {
        registration_bonus: 10_000,
        referrer_bonus: 2_500,
        referred_bonus: 1_000,
        referral_currency: Currency::Token,
        daily_base: 500,
        daily_multiplier: 1.5,
        daily_streak_cap: 3,
        daily_currency: Currency::Token,
    }
}

fn make_issuer() -> (BonusIssuer, Ledger, TempDir) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");
    let ledger = Ledger::open(path.to_str().unwrap()).unwrap();
    let issuer = BonusIssuer::new(ledger.clone(), test_policy());
    (issuer, ledger, dir)
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

async fn count_of_kind(ledger: &Ledger, account_id: i64, kind: TransactionType) -> usize {
    ledger
        .history(account_id, 1000)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.kind == kind)
        .count()
}

// =============================================================================
// REGISTRATION
// =============================================================================

#[tokio::test]
async fn test_registration_bonus_granted_once() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();

    let first = issuer.award_registration_bonus(1).await.unwrap();
    assert!(first.is_granted());
    assert_eq!(first.get().idempotency_key, "reg:1");

    let second = issuer.award_registration_bonus(1).await.unwrap();
    assert!(!second.is_granted());
    assert_eq!(second.get().id, first.get().id);

    assert_eq!(ledger.balance(1).await.unwrap().token_balance, 10_000);
}

#[tokio::test]
async fn test_registration_bonus_requires_account() {
    let (issuer, _ledger, _dir) = make_issuer();
    assert!(matches!(
        issuer.award_registration_bonus(9).await,
        Err(LedgerError::AccountNotFound(9))
    ));
}

// =============================================================================
// REFERRALS
// =============================================================================

#[tokio::test]
async fn test_referral_bonus_pays_both_sides_once() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();
    ledger.open_account(2).await.unwrap();

    let first = issuer.award_referral_bonus(1, 2).await.unwrap();
    assert!(first.is_granted());
    assert!(first.get().bonus_paid);

    let second = issuer.award_referral_bonus(1, 2).await.unwrap();
    assert!(matches!(second, Issuance::AlreadyGranted(ref c) if c.bonus_paid));

    assert_eq!(ledger.balance(1).await.unwrap().token_balance, 2_500);
    assert_eq!(ledger.balance(2).await.unwrap().token_balance, 1_000);

    let referrals = issuer.referrals_of(1).await.unwrap();
    assert_eq!(referrals.len(), 1);
    assert_eq!(referrals[0].referred_id, 2);
    assert!(referrals[0].bonus_paid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_referral_awards_exactly_once() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();
    ledger.open_account(2).await.unwrap();
    let issuer = Arc::new(issuer);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let issuer = issuer.clone();
        handles.push(tokio::spawn(async move { issuer.award_referral_bonus(1, 2).await }));
    }

    let mut granted = 0;
    for h in handles {
        if h.await.unwrap().unwrap().is_granted() {
            granted += 1;
        }
    }

    assert_eq!(granted, 1);
    assert_eq!(count_of_kind(&ledger, 1, TransactionType::ReferralBonus).await, 1);
    assert_eq!(count_of_kind(&ledger, 2, TransactionType::ReferralBonus).await, 1);
    assert_eq!(ledger.balance(1).await.unwrap().token_balance, 2_500);
    assert_eq!(ledger.balance(2).await.unwrap().token_balance, 1_000);
}

#[tokio::test]
async fn test_referral_completes_missing_half_without_recrediting() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();
    ledger.open_account(2).await.unwrap();
    let connection = issuer.register_referral(1, 2).await.unwrap();
    assert!(!connection.bonus_paid);

    // A crashed earlier run left only the referrer credit behind
    ledger
        .credit(
            Posting::new(
                1,
                Currency::Token,
                2_500,
                TransactionType::ReferralBonus,
                format!("referral:{}:referrer", connection.id),
            )
            .with_reference(format!("referral:{}", connection.id)),
        )
        .await
        .unwrap();

    let outcome = issuer.award_referral_bonus(1, 2).await.unwrap();
    assert!(outcome.is_granted());

    assert_eq!(ledger.balance(1).await.unwrap().token_balance, 2_500);
    assert_eq!(ledger.balance(2).await.unwrap().token_balance, 1_000);
    assert_eq!(count_of_kind(&ledger, 1, TransactionType::ReferralBonus).await, 1);
}

#[tokio::test]
async fn test_referral_rejects_self_and_second_referrer() {
    let (issuer, ledger, _dir) = make_issuer();
    for id in 1..=3 {
        ledger.open_account(id).await.unwrap();
    }

    assert!(matches!(
        issuer.award_referral_bonus(1, 1).await,
        Err(LedgerError::InvalidReferral { .. })
    ));

    issuer.register_referral(1, 3).await.unwrap();
    assert!(matches!(
        issuer.award_referral_bonus(2, 3).await,
        Err(LedgerError::InvalidReferral { .. })
    ));
    assert_eq!(ledger.balance(2).await.unwrap().token_balance, 0);
    assert_eq!(ledger.balance(3).await.unwrap().token_balance, 0);
}

#[tokio::test]
async fn test_referral_unknown_account() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();
    assert!(matches!(
        issuer.award_referral_bonus(1, 77).await,
        Err(LedgerError::AccountNotFound(77))
    ));
    assert!(issuer.referrals_of(1).await.unwrap().is_empty());
}

// =============================================================================
// DAILY STREAK
// =============================================================================

#[tokio::test]
async fn test_daily_streak_grows_resets_and_rejects_same_day() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();

    let d1 = issuer.claim_daily_bonus(1, day(1)).await.unwrap();
    assert_eq!(d1.streak, 1);
    assert_eq!(d1.amount, 500);

    let d2 = issuer.claim_daily_bonus(1, day(2)).await.unwrap();
    assert_eq!(d2.streak, 2);
    assert_eq!(d2.amount, 750);

    // Day 3 skipped
    let d4 = issuer.claim_daily_bonus(1, day(4)).await.unwrap();
    assert_eq!(d4.streak, 1);
    assert_eq!(d4.amount, 500);

    let before = ledger.balance(1).await.unwrap();
    let again = issuer.claim_daily_bonus(1, day(4)).await;
    assert!(matches!(again, Err(LedgerError::AlreadyClaimed { account_id: 1, .. })));
    assert_eq!(ledger.balance(1).await.unwrap(), before);
    assert_eq!(before.token_balance, 500 + 750 + 500);

    let account = ledger.account(1).await.unwrap();
    assert_eq!(account.daily_streak, 1);
    assert_eq!(account.last_bonus_date, Some(day(4)));
}

#[tokio::test]
async fn test_daily_amount_stops_growing_at_cap() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();

    let mut amounts = Vec::new();
    for d in 1..=6 {
        amounts.push(issuer.claim_daily_bonus(1, day(d)).await.unwrap().amount);
    }
    // 500 * 1.5^k for k = 0, 1, 2, 3, then capped at k = 3
    assert_eq!(amounts, vec![500, 750, 1125, 1688, 1688, 1688]);
    assert_eq!(ledger.account(1).await.unwrap().daily_streak, 6);
    assert!(ledger.reconcile(1).await.unwrap());
}

#[tokio::test]
async fn test_daily_claim_for_earlier_date_is_rejected() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();
    issuer.claim_daily_bonus(1, day(5)).await.unwrap();

    assert!(matches!(
        issuer.claim_daily_bonus(1, day(4)).await,
        Err(LedgerError::AlreadyClaimed { .. })
    ));
    assert_eq!(ledger.balance(1).await.unwrap().token_balance, 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_daily_claims_pay_once() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();
    let issuer = Arc::new(issuer);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let issuer = issuer.clone();
        handles.push(tokio::spawn(async move { issuer.claim_daily_bonus(1, day(1)).await }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(LedgerError::AlreadyClaimed { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(ledger.balance(1).await.unwrap().token_balance, 500);
}

#[tokio::test]
async fn test_daily_streak_write_completes_after_posted_credit() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();

    // The credit committed but the streak update was lost
    ledger
        .credit(Posting::new(
            1,
            Currency::Token,
            500,
            TransactionType::DailyBonus,
            crate::ledger::bonus::daily_key(1, day(1)),
        ))
        .await
        .unwrap();

    let claim = issuer.claim_daily_bonus(1, day(1)).await.unwrap();
    assert_eq!(claim.streak, 1);
    assert_eq!(ledger.balance(1).await.unwrap().token_balance, 500);
    assert_eq!(ledger.account(1).await.unwrap().last_bonus_date, Some(day(1)));
}

// =============================================================================
// ACHIEVEMENTS
// =============================================================================

#[tokio::test]
async fn test_achievement_unlocks_once() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();

    let first = issuer.award_achievement(1, "first_win", 1_500, 200).await.unwrap();
    assert!(first.is_granted());

    let second = issuer.award_achievement(1, "first_win", 1_500, 200).await.unwrap();
    assert!(!second.is_granted());
    assert_eq!(second.get().unlocked_at, first.get().unlocked_at);

    let balances = ledger.balance(1).await.unwrap();
    assert_eq!(balances.token_balance, 1_500);
    assert_eq!(balances.diamond_balance, 200);
    assert_eq!(count_of_kind(&ledger, 1, TransactionType::AchievementReward).await, 2);
    assert_eq!(issuer.achievements_of(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_zero_reward_is_not_recorded() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();

    issuer.award_achievement(1, "streak_7", 700, 0).await.unwrap();
    let history = ledger.history(1, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].currency, Currency::Token);

    // Both zero: the unlock is still recorded, with no transactions
    let badge = issuer.award_achievement(1, "badge_only", 0, 0).await.unwrap();
    assert!(badge.is_granted());
    assert_eq!(ledger.history(1, 10).await.unwrap().len(), 1);
    assert_eq!(issuer.achievements_of(1).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_achievement_validation() {
    let (issuer, ledger, _dir) = make_issuer();
    assert!(matches!(
        issuer.award_achievement(3, "x", 100, 0).await,
        Err(LedgerError::AccountNotFound(3))
    ));

    ledger.open_account(3).await.unwrap();
    assert!(matches!(
        issuer.award_achievement(3, "x", -1, 0).await,
        Err(LedgerError::InvalidAmount(-1))
    ));
    assert!(issuer.achievements_of(3).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_second_reward_rolls_back_whole_unlock() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();

    // Token credit posts first, then the fractional diamond reward is rejected
    assert!(matches!(
        issuer.award_achievement(1, "x", 100, 150).await,
        Err(LedgerError::InvalidAmount(150))
    ));

    assert_eq!(ledger.balance(1).await.unwrap().token_balance, 0);
    assert!(ledger.history(1, 10).await.unwrap().is_empty());
    assert!(issuer.achievements_of(1).await.unwrap().is_empty());
    assert!(ledger.reconcile(1).await.unwrap());

    // The achievement is still available with a valid reward
    let granted = issuer.award_achievement(1, "x", 100, 100).await.unwrap();
    assert!(granted.is_granted());
}

#[tokio::test]
async fn test_failed_referred_credit_rolls_back_referrer_credit() {
    let (issuer, ledger, _dir) = make_issuer();
    ledger.open_account(1).await.unwrap();
    ledger.open_account(2).await.unwrap();
    ledger.close_account(2).await.unwrap();

    assert!(matches!(
        issuer.award_referral_bonus(1, 2).await,
        Err(LedgerError::AccountClosed(2))
    ));
    assert_eq!(ledger.balance(1).await.unwrap().token_balance, 0);
    assert!(ledger.history(1, 10).await.unwrap().is_empty());
    assert!(issuer.referrals_of(1).await.unwrap().is_empty());
}
