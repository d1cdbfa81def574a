//! Integration tests for the tokenbot-ledger CLI
//!
//! Each test drives the compiled binary against a fresh database in a temp
//! directory and checks the JSON it prints.

use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Every variable `Config::from_env` reads besides the database path.
const POLICY_VARS: [&str; 7] = [
    "LEDGER_POLICY_PATH",
    "REGISTRATION_BONUS",
    "REFERRAL_BONUS_REFERRER",
    "REFERRAL_BONUS_REFERRED",
    "DAILY_BONUS_BASE",
    "DAILY_BONUS_MULTIPLIER",
    "DAILY_STREAK_CAP",
];

fn run(db: &Path, args: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tokenbot-ledger"));
    for var in POLICY_VARS {
        cmd.env_remove(var);
    }
    // Run from the temp dir so dotenv cannot pick up a developer .env
    if let Some(dir) = db.parent() {
        cmd.current_dir(dir);
    }
    cmd.arg("--db")
        .arg(db)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to run tokenbot-ledger")
}

fn run_json(db: &Path, args: &[&str]) -> Value {
    let out = run(db, args);
    assert!(
        out.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).expect("stdout is not JSON")
}

#[test]
fn test_register_credit_debit_balance() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("ledger.db");

    let reg = run_json(&db, &["register", "1"]);
    assert!(reg.get("Granted").is_some());
    let again = run_json(&db, &["register", "1"]);
    assert!(again.get("AlreadyGranted").is_some());

    run_json(&db, &["credit", "1", "12.50", "--key", "dep-1"]);
    run_json(&db, &["credit", "1", "12.50", "--key", "dep-1"]);
    run_json(&db, &["debit", "1", "2.50"]);

    let account = run_json(&db, &["balance", "1"]);
    // 50.00 registration + 12.50 deposit - 2.50 purchase
    assert_eq!(account["token_balance"], 6_000);
    assert_eq!(account["diamond_balance"], 0);

    let history = run_json(&db, &["history", "1", "--limit", "10"]);
    assert_eq!(history.as_array().map(Vec::len), Some(3));
}

#[test]
fn test_overdraft_fails_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("ledger.db");

    run_json(&db, &["open", "7"]);
    run_json(&db, &["credit", "7", "30"]);
    let out = run(&db, &["debit", "7", "50"]);
    assert_eq!(out.status.code(), Some(1), "insufficient funds is a rejection");
    assert!(String::from_utf8_lossy(&out.stderr).contains("balance 30.00, requested 50.00"));

    let account = run_json(&db, &["balance", "7"]);
    assert_eq!(account["token_balance"], 3_000);
}

#[test]
fn test_duel_round_trip_and_audit() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("ledger.db");

    for id in ["1", "2"] {
        run_json(&db, &["open", id]);
        run_json(&db, &["credit", id, "100"]);
    }

    let duel = run_json(&db, &["duel", "create", "1", "2", "20", "--id", "chat-9"]);
    assert_eq!(duel["status"], "pending");
    run_json(&db, &["duel", "accept", "chat-9"]);
    let settled = run_json(&db, &["duel", "settle", "chat-9", "1"]);
    assert_eq!(settled["status"], "settled");
    assert_eq!(settled["winner_id"], 1);

    assert_eq!(run_json(&db, &["balance", "1"])["token_balance"], 12_000);
    assert_eq!(run_json(&db, &["balance", "2"])["token_balance"], 8_000);

    let report = run_json(&db, &["reconcile", "1"]);
    assert_eq!(report["account_id"], 1);
    let mismatches = run_json(&db, &["audit"]);
    assert_eq!(mismatches.as_array().map(Vec::len), Some(0));
}

#[test]
fn test_daily_claim_with_explicit_dates() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("ledger.db");

    run_json(&db, &["open", "3"]);
    let first = run_json(&db, &["daily", "3", "--date", "2024-05-01"]);
    assert_eq!(first["streak"], 1);
    assert_eq!(first["amount"], 500);
    let second = run_json(&db, &["daily", "3", "--date", "2024-05-02"]);
    assert_eq!(second["streak"], 2);
    assert_eq!(second["amount"], 600);

    let dup = run(&db, &["daily", "3", "--date", "2024-05-02"]);
    assert_eq!(dup.status.code(), Some(1));
}

#[test]
fn test_default_policy_and_hard_failure_exit_code() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("ledger.db");

    let policy = run_json(&db, &["policy"]);
    assert_eq!(policy["registration_bonus"], 5_000);
    assert_eq!(policy["daily_streak_cap"], 6);
    assert_eq!(policy["referral_currency"], "token");

    // Unknown account is a hard failure, not a rejection
    let out = run(&db, &["credit", "404", "1"]);
    assert_eq!(out.status.code(), Some(2));
}
