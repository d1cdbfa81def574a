//! tokenbot-ledger: operator CLI for the chat-bot account ledger.
//!
//! Usage:
//!   tokenbot-ledger open 42
//!   tokenbot-ledger credit 42 12.50 --key deposit-991
//!   tokenbot-ledger daily 42
//!   tokenbot-ledger duel create 42 77 5 --id chat-1234
//!   tokenbot-ledger audit
//!
//! Every command prints its result as JSON on stdout. Rejected requests
//! (insufficient funds, invalid transitions, ...) exit with status 1, hard
//! failures (storage errors, reconciliation mismatches) with status 2.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::process::ExitCode;
use tokenbot_ledger::ledger::Posting;
use tokenbot_ledger::models::{parse_amount, AccountId, Amount, Currency, TransactionType};
use tokenbot_ledger::{BonusIssuer, Config, DuelEscrow, Ledger, LedgerError};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "tokenbot-ledger")]
#[command(about = "Token and diamond ledger for chat-bot accounts")]
struct Cli {
    /// Path to the SQLite ledger database
    #[arg(long, env = "LEDGER_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open an account (no-op if it exists)
    Open { account: AccountId },

    /// Show balances and lifetime counters
    Balance { account: AccountId },

    /// Show the newest transactions of an account
    History {
        account: AccountId,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Credit an account
    Credit {
        account: AccountId,
        #[arg(value_parser = parse_amount_arg)]
        amount: Amount,
        #[arg(short, long, default_value = "token", value_parser = parse_currency_arg)]
        currency: Currency,
        #[arg(long, default_value = "external_deposit", value_parser = parse_kind_arg)]
        kind: TransactionType,
        /// Idempotency key; a fresh one is generated when omitted
        #[arg(short, long)]
        key: Option<String>,
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Debit an account; fails if the balance is short
    Debit {
        account: AccountId,
        #[arg(value_parser = parse_amount_arg)]
        amount: Amount,
        #[arg(short, long, default_value = "token", value_parser = parse_currency_arg)]
        currency: Currency,
        #[arg(long, default_value = "shop_purchase", value_parser = parse_kind_arg)]
        kind: TransactionType,
        #[arg(short, long)]
        key: Option<String>,
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Open an account and pay its registration bonus
    Register { account: AccountId },

    /// Claim the daily bonus (today in UTC unless --date is given)
    Daily {
        account: AccountId,
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Record a referral and pay both sides
    Referral {
        referrer: AccountId,
        referred: AccountId,
    },

    /// Unlock an achievement and pay its rewards
    Achievement {
        account: AccountId,
        achievement: String,
        #[arg(long, default_value = "0", value_parser = parse_reward_arg)]
        tokens: Amount,
        #[arg(long, default_value = "0", value_parser = parse_reward_arg)]
        diamonds: Amount,
    },

    /// Two-party wagers
    Duel {
        #[command(subcommand)]
        action: DuelCommands,
    },

    /// Show the bonus policy in effect
    Policy,

    /// Compare stored balances with the transaction log
    Reconcile { account: AccountId },

    /// Reconcile every account; exits non-zero on any mismatch
    Audit,
}

#[derive(Subcommand, Debug)]
enum DuelCommands {
    Create {
        challenger: AccountId,
        opponent: AccountId,
        #[arg(value_parser = parse_amount_arg)]
        wager: Amount,
        #[arg(short, long, default_value = "token", value_parser = parse_currency_arg)]
        currency: Currency,
        /// Caller-chosen duel id, makes the create retry-safe
        #[arg(long)]
        id: Option<String>,
    },
    Accept {
        duel: String,
    },
    Settle {
        duel: String,
        winner: AccountId,
        #[arg(long, default_value = "0")]
        challenger_result: i64,
        #[arg(long, default_value = "0")]
        opponent_result: i64,
    },
    Cancel {
        duel: String,
    },
    Show {
        duel: String,
    },
}

fn parse_amount_arg(raw: &str) -> std::result::Result<Amount, String> {
    match parse_amount(raw) {
        Some(v) if v > 0 => Ok(v),
        _ => Err(format!("expected a positive amount with at most 2 decimals, got {raw:?}")),
    }
}

fn parse_reward_arg(raw: &str) -> std::result::Result<Amount, String> {
    parse_amount(raw).ok_or_else(|| format!("expected an amount with at most 2 decimals, got {raw:?}"))
}

fn parse_currency_arg(raw: &str) -> std::result::Result<Currency, String> {
    Currency::parse(raw).ok_or_else(|| format!("unknown currency {raw:?} (token|diamond)"))
}

fn parse_kind_arg(raw: &str) -> std::result::Result<TransactionType, String> {
    TransactionType::parse(raw).ok_or_else(|| format!("unknown transaction type {raw:?}"))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenbot_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn posting(
    account: AccountId,
    amount: Amount,
    currency: Currency,
    kind: TransactionType,
    key: Option<String>,
    description: String,
) -> Posting {
    let key = key.unwrap_or_else(|| format!("cli:{}", Uuid::new_v4()));
    Posting::new(account, currency, amount, kind, key).with_description(description)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<LedgerError>() {
            Some(rejected) if rejected.is_user_facing() => {
                warn!(error = %rejected, "Request rejected");
                eprintln!("rejected: {rejected}");
                ExitCode::from(1)
            }
            _ => {
                error!(error = %format!("{err:#}"), "💥 Ledger command failed");
                eprintln!("error: {err:#}");
                ExitCode::from(2)
            }
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    let ledger = Ledger::open(&config.database_path)
        .with_context(|| format!("Failed to open ledger at {}", config.database_path))?;
    info!(db = %config.database_path, "📒 Ledger ready");

    let bonuses = BonusIssuer::new(ledger.clone(), config.policy.clone());
    let duels = DuelEscrow::new(ledger.clone());

    match cli.command {
        Commands::Open { account } => print_json(&ledger.open_account(account).await?)?,
        Commands::Balance { account } => print_json(&ledger.account(account).await?)?,
        Commands::History { account, limit } => print_json(&ledger.history(account, limit).await?)?,
        Commands::Credit {
            account,
            amount,
            currency,
            kind,
            key,
            description,
        } => {
            let tx = ledger
                .credit(posting(account, amount, currency, kind, key, description))
                .await?;
            print_json(&tx)?
        }
        Commands::Debit {
            account,
            amount,
            currency,
            kind,
            key,
            description,
        } => {
            let tx = ledger
                .debit(posting(account, amount, currency, kind, key, description))
                .await?;
            print_json(&tx)?
        }
        Commands::Register { account } => {
            ledger.open_account(account).await?;
            print_json(&bonuses.award_registration_bonus(account).await?)?
        }
        Commands::Daily { account, date } => {
            let claim = match date {
                Some(date) => bonuses.claim_daily_bonus(account, date).await?,
                None => bonuses.claim_daily_bonus_now(account).await?,
            };
            print_json(&claim)?
        }
        Commands::Referral { referrer, referred } => {
            print_json(&bonuses.award_referral_bonus(referrer, referred).await?)?
        }
        Commands::Achievement {
            account,
            achievement,
            tokens,
            diamonds,
        } => print_json(
            &bonuses
                .award_achievement(account, &achievement, tokens, diamonds)
                .await?,
        )?,
        Commands::Duel { action } => run_duel(&duels, action).await?,
        Commands::Policy => print_json(bonuses.policy())?,
        Commands::Reconcile { account } => {
            let report = ledger.reconcile_report(account).await?;
            print_json(&report)?;
            if !report.is_consistent() {
                bail!("account {account} does not reconcile");
            }
        }
        Commands::Audit => {
            let mismatches = ledger.audit().await?;
            print_json(&mismatches)?;
            if !mismatches.is_empty() {
                error!(count = mismatches.len(), "🚨 Audit found inconsistent accounts");
                bail!("{} account(s) failed reconciliation", mismatches.len());
            }
        }
    }

    Ok(())
}

async fn run_duel(duels: &DuelEscrow, action: DuelCommands) -> Result<()> {
    let duel = match action {
        DuelCommands::Create {
            challenger,
            opponent,
            wager,
            currency,
            id,
        } => match id {
            Some(id) => {
                duels
                    .create_duel_with_id(&id, challenger, opponent, wager, currency)
                    .await?
            }
            None => duels.create_duel(challenger, opponent, wager, currency).await?,
        },
        DuelCommands::Accept { duel } => duels.accept_duel(&duel).await?,
        DuelCommands::Settle {
            duel,
            winner,
            challenger_result,
            opponent_result,
        } => {
            duels
                .settle_duel(&duel, winner, challenger_result, opponent_result)
                .await?
        }
        DuelCommands::Cancel { duel } => duels.cancel_duel(&duel).await?,
        DuelCommands::Show { duel } => duels.duel(&duel).await?,
    };
    print_json(&duel)
}
