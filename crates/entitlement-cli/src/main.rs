// ============================================================================
// entitlement-db - CLI for inspecting and administering entitlement state
// ============================================================================
// Usage:
//   entitlement-db stats                                  Show database statistics
//   entitlement-db usage [--user U] [--character C]       List usage records
//   entitlement-db check --user U --character C --action chat|call
//   entitlement-db settle --user U --character C --action chat|call --amount N
//   entitlement-db set-policy --character C [--free-messages N] ...
//   entitlement-db set-subscription --user U --character C --status active
//   entitlement-db set-coins --user U --balance N
//   entitlement-db register --user U [--days-ago N]
//   entitlement-db export --format json                   Export full database as JSON
// ============================================================================

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use entitlement_core::db::{
    AccountRecord, CharacterPolicyRecord, SubscriptionRecord, SubscriptionStatus,
};
use entitlement_core::{
    AccessDecision, AccessGate, ActualUsage, EntitlementConfig, EntitlementDb, GatedAction,
    MonthClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Companion entitlement database tool
#[derive(Parser)]
#[command(name = "entitlement-db", version, about = "Inspect and manage companion entitlements")]
struct Cli {
    /// Path to the database file (default: ~/.companion/entitlements.redb)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Chat,
    Call,
}

impl From<ActionArg> for GatedAction {
    fn from(arg: ActionArg) -> Self {
        match arg {
            ActionArg::Chat => GatedAction::Chat,
            ActionArg::Call => GatedAction::Call,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show database statistics (record counts per table)
    Stats,

    /// List usage records with optional filters
    Usage {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        character: Option<String>,
        /// Only records for the current month
        #[arg(long)]
        current: bool,
    },

    /// Resolve the entitlement a user would get right now
    Check {
        #[arg(long)]
        user: String,
        #[arg(long)]
        character: String,
        #[arg(long, value_enum)]
        action: ActionArg,
    },

    /// Check, then record usage for an authorized action
    Settle {
        #[arg(long)]
        user: String,
        #[arg(long)]
        character: String,
        #[arg(long, value_enum)]
        action: ActionArg,
        /// Messages sent, or call minutes
        #[arg(long)]
        amount: f64,
        /// Idempotency key (default: a fresh UUID)
        #[arg(long)]
        action_id: Option<String>,
    },

    /// Set per-character policy overrides; unset flags keep their current value
    SetPolicy {
        #[arg(long)]
        character: String,
        #[arg(long)]
        free_messages: Option<u32>,
        #[arg(long)]
        free_call_minutes: Option<u32>,
        #[arg(long)]
        call_coin_per_minute: Option<u64>,
        #[arg(long)]
        fc_overage_coin_per_minute: Option<u64>,
        #[arg(long)]
        chat_coin_cost: Option<u64>,
    },

    /// Create or replace a fan club subscription
    SetSubscription {
        #[arg(long)]
        user: String,
        #[arg(long)]
        character: String,
        /// active, past_due, cancelled, expired
        #[arg(long, default_value = "active")]
        status: String,
        /// Included call minutes remaining this cycle
        #[arg(long, default_value = "0")]
        minutes: f64,
    },

    /// Set a user's coin balance
    SetCoins {
        #[arg(long)]
        user: String,
        #[arg(long)]
        balance: u64,
    },

    /// Register an account (for grace period tracking)
    Register {
        #[arg(long)]
        user: String,
        /// Backdate the account creation by this many days
        #[arg(long, default_value = "0")]
        days_ago: i64,
    },

    /// Export full database contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn parse_status(s: &str) -> Result<SubscriptionStatus> {
    SubscriptionStatus::from_str(s).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown status '{}'. Valid values: active, past_due, cancelled, expired",
            s
        )
    })
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

/// Unix seconds `days_ago` days before `now`
fn backdated_timestamp(now: DateTime<Utc>, days_ago: i64) -> Result<i64> {
    chrono::Duration::try_days(days_ago)
        .and_then(|offset| now.checked_sub_signed(offset))
        .map(|dt| dt.timestamp())
        .ok_or_else(|| anyhow::anyhow!("--days-ago {} is out of range", days_ago))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("entitlement_core=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EntitlementConfig::from_env()?;
    let db_path = cli.db_path.or_else(|| config.db_path.clone());
    let db = Arc::new(EntitlementDb::open(db_path.as_deref())?);

    match cli.command {
        Commands::Stats => cmd_stats(&db),
        Commands::Usage {
            user,
            character,
            current,
        } => cmd_usage(&db, &config, user, character, current),
        Commands::Check {
            user,
            character,
            action,
        } => cmd_check(db, &config, &user, &character, action.into()).await,
        Commands::Settle {
            user,
            character,
            action,
            amount,
            action_id,
        } => cmd_settle(db, &config, &user, &character, action.into(), amount, action_id).await,
        Commands::SetPolicy {
            character,
            free_messages,
            free_call_minutes,
            call_coin_per_minute,
            fc_overage_coin_per_minute,
            chat_coin_cost,
        } => {
            let patch = CharacterPolicyRecord {
                character_id: character,
                free_message_limit: free_messages,
                free_call_minutes,
                call_coin_per_minute,
                fc_overage_call_coin_per_minute: fc_overage_coin_per_minute,
                chat_coin_cost,
            };
            let merged = db.upsert_policy(&patch)?;
            println!("{}", serde_json::to_string_pretty(&merged)?);
            Ok(())
        }
        Commands::SetSubscription {
            user,
            character,
            status,
            minutes,
        } => {
            if !minutes.is_finite() || minutes < 0.0 {
                anyhow::bail!("Included minutes must be a non-negative number, got {}", minutes);
            }
            let sub = SubscriptionRecord {
                user_id: user,
                character_id: character,
                status: parse_status(&status)?,
                included_minutes_remaining: minutes,
                updated_at: Utc::now().timestamp(),
            };
            db.store_subscription(&sub)?;
            println!(
                "Subscription {}/{} is now {} with {:.2} included minutes",
                sub.user_id,
                sub.character_id,
                sub.status.as_str(),
                sub.included_minutes_remaining
            );
            Ok(())
        }
        Commands::SetCoins { user, balance } => {
            db.set_coin_balance(&user, balance)?;
            println!("Coin balance for {} set to {}", user, balance);
            Ok(())
        }
        Commands::Register { user, days_ago } => {
            let created_at = backdated_timestamp(Utc::now(), days_ago)?;
            db.store_account(&AccountRecord {
                user_id: user.clone(),
                created_at,
            })?;
            println!("Registered {} (created {})", user, format_timestamp(created_at));
            Ok(())
        }
        Commands::Export { format } => cmd_export(&db, &format),
    }
}

fn cmd_stats(db: &EntitlementDb) -> Result<()> {
    let stats = db.stats()?;

    println!("=== Companion Entitlement Database Stats ===");
    println!("Database: {}", db.path().display());
    println!();
    println!("Usage records:  {}", stats.usage_records);
    println!(
        "Subscriptions:  {} ({} active)",
        stats.subscriptions, stats.active_subscriptions
    );
    println!("Coin balances:  {}", stats.coin_balances);
    println!("Policies:       {}", stats.policies);
    println!("Accounts:       {}", stats.accounts);
    println!("Settlements:    {}", stats.settlements);

    Ok(())
}

fn cmd_usage(
    db: &EntitlementDb,
    config: &EntitlementConfig,
    user: Option<String>,
    character: Option<String>,
    current_only: bool,
) -> Result<()> {
    let month_key = MonthClock::new(config.reference_utc_offset_hours)?.current_month_key();
    let records: Vec<_> = db
        .list_usage()?
        .into_iter()
        .filter(|r| user.as_deref().map_or(true, |u| r.user_id == u))
        .filter(|r| character.as_deref().map_or(true, |c| r.character_id == c))
        .filter(|r| !current_only || r.is_current(&month_key))
        .collect();

    if records.is_empty() {
        println!("No usage records found.");
        return Ok(());
    }

    println!(
        "{:<24}  {:<24}  {:<8}  {:>8}  {:>10}  {}",
        "USER", "CHARACTER", "MONTH", "MESSAGES", "CALL MIN", "UPDATED AT"
    );
    println!("{}", "-".repeat(104));

    for record in &records {
        let marker = if record.is_current(&month_key) { "" } else { " (stale)" };
        println!(
            "{:<24}  {:<24}  {:<8}  {:>8}  {:>10.2}  {}{}",
            record.user_id,
            record.character_id,
            record.month_key,
            record.messages_sent,
            record.call_minutes_used,
            format_timestamp(record.updated_at),
            marker
        );
    }

    println!("\nTotal: {} records (current month: {})", records.len(), month_key);
    Ok(())
}

async fn check(
    gate: &AccessGate,
    user: &str,
    character: &str,
    action: GatedAction,
) -> Result<AccessDecision> {
    let decision = match action {
        GatedAction::Chat => gate.check_chat(user, character).await?,
        GatedAction::Call => gate.check_call(user, character).await?,
    };
    Ok(decision)
}

async fn cmd_check(
    db: Arc<EntitlementDb>,
    config: &EntitlementConfig,
    user: &str,
    character: &str,
    action: GatedAction,
) -> Result<()> {
    let gate = AccessGate::new(db, config)?;
    let decision = check(&gate, user, character, action).await?;

    let output = serde_json::json!({
        "decision": decision,
        "label": decision.entitlement.label(),
        "authorized": decision.is_authorized(),
        "coin_cost": decision.entitlement.coin_cost(),
        "prompt": decision.upgrade_prompt(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_settle(
    db: Arc<EntitlementDb>,
    config: &EntitlementConfig,
    user: &str,
    character: &str,
    action: GatedAction,
    amount: f64,
    action_id: Option<String>,
) -> Result<()> {
    let actual = match action {
        GatedAction::Chat => {
            if amount.fract() != 0.0 || amount < 0.0 || amount > f64::from(u32::MAX) {
                anyhow::bail!("Message count must be a whole non-negative number, got {}", amount);
            }
            ActualUsage::Messages(amount as u32)
        }
        GatedAction::Call => ActualUsage::CallMinutes(amount),
    };

    let gate = AccessGate::new(db, config)?;
    let decision = check(&gate, user, character, action).await?;
    if !decision.is_authorized() {
        anyhow::bail!(
            "{} is blocked for {}/{}",
            action.display_name(),
            user,
            character
        );
    }

    let action_id = action_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!("Settling {} as {}", action_id, decision.entitlement.label());
    let receipt = gate.settle(&decision, &action_id, actual).await?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

fn cmd_export(db: &EntitlementDb, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": db.stats()?,
        "usage": db.list_usage()?,
        "subscriptions": db.list_subscriptions()?,
        "coin_balances": db.list_coin_balances()?,
        "policies": db.list_policies()?,
        "accounts": db.list_accounts()?,
        "settlements": db.list_settlements()?,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backdated_timestamp() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
        assert_eq!(
            backdated_timestamp(now, 2).unwrap(),
            Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn test_backdated_timestamp_out_of_range_is_error() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
        assert!(backdated_timestamp(now, i64::MAX / 2).is_err());
        assert!(backdated_timestamp(now, 200_000_000).is_err());
    }
}
