// ============================================================================
// EntitlementDb - Embedded Database (redb)
// ============================================================================
// Persistent storage for usage counters, subscriptions, coin balances,
// character policies, accounts, and settlement markers.
// Default path: ~/.companion/entitlements.redb (override via ENTITLEMENT_DB_PATH)
// ============================================================================

pub mod types;

pub use types::{
    AccountRecord, CharacterPolicyRecord, CoinBalanceRecord, DbStats, SettlementRecord,
    SubscriptionRecord, SubscriptionStatus, UsageRecord,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ENV_DB_PATH;
use crate::stores::{
    AccountDirectory, AppliedUsage, CoinBalanceStore, PolicySource, SubscriptionStore, UsageDelta,
    UsageStore, UsageWrite, UsageWriteOutcome,
};
use crate::types::{EntitlementError, EntitlementResult};

// Table definitions
const USAGE: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("usage");
const SUBSCRIPTIONS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("subscriptions");
const COIN_BALANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("coin_balances");
const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("character_policies");
const ACCOUNTS: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts");
const SETTLEMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("settlements");

/// Embedded database for entitlement state. Clones share one handle.
#[derive(Clone)]
pub struct EntitlementDb {
    db: Arc<Database>,
    path: PathBuf,
}

impl EntitlementDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses ENTITLEMENT_DB_PATH or ~/.companion/entitlements.redb
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            p.to_path_buf()
        } else if let Ok(env_path) = std::env::var(ENV_DB_PATH) {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let data_dir = home.join(".companion");
            std::fs::create_dir_all(&data_dir)
                .map_err(|e| anyhow!("Failed to create .companion directory: {}", e))?;
            data_dir.join("entitlements.redb")
        };

        info!("Opening entitlement database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn.open_table(USAGE).map_err(|e| anyhow!("Failed to create usage table: {}", e))?;
            let _ = write_txn.open_table(SUBSCRIPTIONS).map_err(|e| anyhow!("Failed to create subscriptions table: {}", e))?;
            let _ = write_txn.open_table(COIN_BALANCES).map_err(|e| anyhow!("Failed to create coin_balances table: {}", e))?;
            let _ = write_txn.open_table(POLICIES).map_err(|e| anyhow!("Failed to create character_policies table: {}", e))?;
            let _ = write_txn.open_table(ACCOUNTS).map_err(|e| anyhow!("Failed to create accounts table: {}", e))?;
            let _ = write_txn.open_table(SETTLEMENTS).map_err(|e| anyhow!("Failed to create settlements table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        info!("Entitlement database ready");

        Ok(Self {
            db: Arc::new(db),
            path: db_path,
        })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Usage Operations
    // ========================================================================

    /// Stored usage record, exactly as persisted (may be stale).
    /// Undecodable records are logged and reported as absent.
    pub fn get_usage(&self, user_id: &str, character_id: &str) -> Result<Option<UsageRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(USAGE)
            .map_err(|e| anyhow!("Failed to open usage table: {}", e))?;

        let guard = table.get((user_id, character_id))
            .map_err(|e| anyhow!("Failed to get usage: {}", e))?;
        Ok(guard.and_then(|value| decode_usage(value.value(), user_id, character_id)))
    }

    pub fn list_usage(&self) -> Result<Vec<UsageRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(USAGE)
            .map_err(|e| anyhow!("Failed to open usage table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.iter()
            .map_err(|e| anyhow!("Failed to iterate usage: {}", e))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let (user_id, character_id) = key.value();
            if let Some(record) = decode_usage(value.value(), user_id, character_id) {
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Apply one usage write atomically.
    ///
    /// The settlement check, month rollover, counter delta, pool draw-down,
    /// and settlement marker all happen inside one write transaction. redb
    /// admits a single writer at a time, so concurrent writes to the same
    /// key serialize instead of losing updates.
    pub fn apply_usage_write(&self, write: &UsageWrite) -> Result<UsageWriteOutcome> {
        validate_delta(&write.delta)?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;

        match Self::apply_in_txn(&write_txn, write) {
            Ok(UsageWriteOutcome::Duplicate(existing)) => {
                write_txn.abort().map_err(|e| anyhow!("Failed to abort: {}", e))?;
                debug!("Settlement {} already recorded, skipping", existing.action_id);
                Ok(UsageWriteOutcome::Duplicate(existing))
            }
            Ok(applied) => {
                write_txn.commit().map_err(|e| anyhow!("Failed to commit usage write: {}", e))?;
                debug!(
                    "Applied {:?} for {}/{} in {}",
                    write.delta, write.user_id, write.character_id, write.month_key
                );
                Ok(applied)
            }
            Err(e) => {
                if let Err(abort_err) = write_txn.abort() {
                    warn!("Failed to abort usage write: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    fn apply_in_txn(txn: &WriteTransaction, write: &UsageWrite) -> Result<UsageWriteOutcome> {
        let key = (write.user_id.as_str(), write.character_id.as_str());

        // Idempotency marker
        if let Some(marker) = &write.settlement {
            let settlements = txn.open_table(SETTLEMENTS)
                .map_err(|e| anyhow!("Failed to open settlements table: {}", e))?;
            let existing = match settlements.get(marker.action_id.as_str())
                .map_err(|e| anyhow!("Failed to get settlement: {}", e))?
            {
                Some(value) => Some(decode::<SettlementRecord>(value.value(), "settlement")?),
                None => None,
            };
            if let Some(existing) = existing {
                return Ok(UsageWriteOutcome::Duplicate(existing));
            }
        }

        // Usage counters: load-or-create, roll over, add
        let mut usage = {
            let table = txn.open_table(USAGE)
                .map_err(|e| anyhow!("Failed to open usage table: {}", e))?;
            let stored = table.get(key)
                .map_err(|e| anyhow!("Failed to get usage: {}", e))?
                .and_then(|value| decode_usage(value.value(), key.0, key.1));
            UsageRecord::for_month(stored, key.0, key.1, &write.month_key, write.now)
        };

        let mut included_minutes_remaining = None;
        let mut overage_minutes = 0.0;

        match write.delta {
            UsageDelta::Messages(n) => {
                usage.messages_sent = usage.messages_sent.saturating_add(n);
                usage.updated_at = write.now;
                put_usage(txn, key, &usage)?;
            }
            UsageDelta::CallMinutes(minutes) => {
                usage.call_minutes_used += minutes;
                usage.updated_at = write.now;
                put_usage(txn, key, &usage)?;
            }
            UsageDelta::IncludedMinutes(minutes) => {
                let mut table = txn.open_table(SUBSCRIPTIONS)
                    .map_err(|e| anyhow!("Failed to open subscriptions table: {}", e))?;
                let stored = match table.get(key)
                    .map_err(|e| anyhow!("Failed to get subscription: {}", e))?
                {
                    Some(value) => Some(decode::<SubscriptionRecord>(value.value(), "subscription")?),
                    None => None,
                };

                match stored {
                    Some(mut sub) => {
                        let pool = sanitize_minutes(sub.included_minutes_remaining);
                        sub.included_minutes_remaining = (pool - minutes).max(0.0);
                        sub.updated_at = write.now;
                        overage_minutes = (minutes - pool).max(0.0);
                        included_minutes_remaining = Some(sub.included_minutes_remaining);

                        let bytes = encode(&sub, "subscription")?;
                        table.insert(key, bytes.as_slice())
                            .map_err(|e| anyhow!("Failed to insert subscription: {}", e))?;
                    }
                    None => {
                        warn!(
                            "No subscription for {}/{} while drawing {} included minutes",
                            key.0, key.1, minutes
                        );
                        overage_minutes = minutes;
                    }
                }
            }
            UsageDelta::RecordOnly => {}
        }

        if let Some(marker) = &write.settlement {
            let mut marker = marker.clone();
            marker.unbilled_overage_minutes = overage_minutes;
            let bytes = encode(&marker, "settlement")?;
            let mut settlements = txn.open_table(SETTLEMENTS)
                .map_err(|e| anyhow!("Failed to open settlements table: {}", e))?;
            settlements.insert(marker.action_id.as_str(), bytes.as_slice())
                .map_err(|e| anyhow!("Failed to insert settlement: {}", e))?;
        }

        Ok(UsageWriteOutcome::Applied(AppliedUsage {
            usage,
            included_minutes_remaining,
            overage_minutes,
        }))
    }

    // ========================================================================
    // Subscription Operations
    // ========================================================================

    pub fn store_subscription(&self, sub: &SubscriptionRecord) -> Result<()> {
        let value = encode(sub, "subscription")?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(SUBSCRIPTIONS)
                .map_err(|e| anyhow!("Failed to open subscriptions table: {}", e))?;
            table.insert((sub.user_id.as_str(), sub.character_id.as_str()), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert subscription: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored subscription: {}/{}", sub.user_id, sub.character_id);
        Ok(())
    }

    pub fn get_subscription(&self, user_id: &str, character_id: &str) -> Result<Option<SubscriptionRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(SUBSCRIPTIONS)
            .map_err(|e| anyhow!("Failed to open subscriptions table: {}", e))?;

        match table.get((user_id, character_id)).map_err(|e| anyhow!("Failed to get subscription: {}", e))? {
            Some(value) => Ok(Some(decode(value.value(), "subscription")?)),
            None => Ok(None),
        }
    }

    pub fn list_subscriptions(&self) -> Result<Vec<SubscriptionRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(SUBSCRIPTIONS)
            .map_err(|e| anyhow!("Failed to open subscriptions table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.iter()
            .map_err(|e| anyhow!("Failed to iterate subscriptions: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode(value.value(), "subscription")?);
        }
        Ok(results)
    }

    // ========================================================================
    // Coin Balance Operations
    // ========================================================================

    pub fn set_coin_balance(&self, user_id: &str, balance: u64) -> Result<()> {
        let record = CoinBalanceRecord {
            user_id: user_id.to_string(),
            balance,
            updated_at: chrono::Utc::now().timestamp(),
        };
        let value = encode(&record, "coin balance")?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(COIN_BALANCES)
                .map_err(|e| anyhow!("Failed to open coin_balances table: {}", e))?;
            table.insert(user_id, value.as_slice())
                .map_err(|e| anyhow!("Failed to insert coin balance: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored coin balance for {}: {}", user_id, balance);
        Ok(())
    }

    pub fn get_coin_balance(&self, user_id: &str) -> Result<Option<CoinBalanceRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(COIN_BALANCES)
            .map_err(|e| anyhow!("Failed to open coin_balances table: {}", e))?;

        match table.get(user_id).map_err(|e| anyhow!("Failed to get coin balance: {}", e))? {
            Some(value) => Ok(Some(decode(value.value(), "coin balance")?)),
            None => Ok(None),
        }
    }

    pub fn list_coin_balances(&self) -> Result<Vec<CoinBalanceRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(COIN_BALANCES)
            .map_err(|e| anyhow!("Failed to open coin_balances table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate coin balances: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode(value.value(), "coin balance")?);
        }
        Ok(results)
    }

    // ========================================================================
    // Character Policy Operations
    // ========================================================================

    /// Merge the set fields of `patch` into the stored policy
    pub fn upsert_policy(&self, patch: &CharacterPolicyRecord) -> Result<CharacterPolicyRecord> {
        let base = self.get_policy(&patch.character_id)?.unwrap_or_else(|| CharacterPolicyRecord {
            character_id: patch.character_id.clone(),
            ..Default::default()
        });
        let merged = base.merge(patch);
        self.store_policy(&merged)?;
        Ok(merged)
    }

    pub fn store_policy(&self, policy: &CharacterPolicyRecord) -> Result<()> {
        let value = encode(policy, "policy")?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(POLICIES)
                .map_err(|e| anyhow!("Failed to open character_policies table: {}", e))?;
            table.insert(policy.character_id.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert policy: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored policy for character: {}", policy.character_id);
        Ok(())
    }

    pub fn get_policy(&self, character_id: &str) -> Result<Option<CharacterPolicyRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(POLICIES)
            .map_err(|e| anyhow!("Failed to open character_policies table: {}", e))?;

        match table.get(character_id).map_err(|e| anyhow!("Failed to get policy: {}", e))? {
            Some(value) => Ok(Some(decode(value.value(), "policy")?)),
            None => Ok(None),
        }
    }

    pub fn list_policies(&self) -> Result<Vec<CharacterPolicyRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(POLICIES)
            .map_err(|e| anyhow!("Failed to open character_policies table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate policies: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode(value.value(), "policy")?);
        }
        Ok(results)
    }

    // ========================================================================
    // Account Operations
    // ========================================================================

    pub fn store_account(&self, account: &AccountRecord) -> Result<()> {
        let value = encode(account, "account")?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(ACCOUNTS)
                .map_err(|e| anyhow!("Failed to open accounts table: {}", e))?;
            table.insert(account.user_id.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert account: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored account: {}", account.user_id);
        Ok(())
    }

    pub fn get_account(&self, user_id: &str) -> Result<Option<AccountRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(ACCOUNTS)
            .map_err(|e| anyhow!("Failed to open accounts table: {}", e))?;

        match table.get(user_id).map_err(|e| anyhow!("Failed to get account: {}", e))? {
            Some(value) => Ok(Some(decode(value.value(), "account")?)),
            None => Ok(None),
        }
    }

    pub fn list_accounts(&self) -> Result<Vec<AccountRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(ACCOUNTS)
            .map_err(|e| anyhow!("Failed to open accounts table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate accounts: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode(value.value(), "account")?);
        }
        Ok(results)
    }

    // ========================================================================
    // Settlement Operations
    // ========================================================================

    pub fn get_settlement(&self, action_id: &str) -> Result<Option<SettlementRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(SETTLEMENTS)
            .map_err(|e| anyhow!("Failed to open settlements table: {}", e))?;

        match table.get(action_id).map_err(|e| anyhow!("Failed to get settlement: {}", e))? {
            Some(value) => Ok(Some(decode(value.value(), "settlement")?)),
            None => Ok(None),
        }
    }

    pub fn list_settlements(&self) -> Result<Vec<SettlementRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(SETTLEMENTS)
            .map_err(|e| anyhow!("Failed to open settlements table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate settlements: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(decode(value.value(), "settlement")?);
        }
        Ok(results)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;

        let usage_records = read_txn.open_table(USAGE)
            .map_err(|e| anyhow!("Failed to open usage table: {}", e))?
            .len()
            .map_err(|e| anyhow!("Failed to count usage: {}", e))? as usize;
        let coin_balances = read_txn.open_table(COIN_BALANCES)
            .map_err(|e| anyhow!("Failed to open coin_balances table: {}", e))?
            .len()
            .map_err(|e| anyhow!("Failed to count coin balances: {}", e))? as usize;
        let policies = read_txn.open_table(POLICIES)
            .map_err(|e| anyhow!("Failed to open character_policies table: {}", e))?
            .len()
            .map_err(|e| anyhow!("Failed to count policies: {}", e))? as usize;
        let accounts = read_txn.open_table(ACCOUNTS)
            .map_err(|e| anyhow!("Failed to open accounts table: {}", e))?
            .len()
            .map_err(|e| anyhow!("Failed to count accounts: {}", e))? as usize;
        let settlements = read_txn.open_table(SETTLEMENTS)
            .map_err(|e| anyhow!("Failed to open settlements table: {}", e))?
            .len()
            .map_err(|e| anyhow!("Failed to count settlements: {}", e))? as usize;

        let subs = self.list_subscriptions()?;
        let active_subscriptions = subs.iter().filter(|s| s.is_active()).count();

        Ok(DbStats {
            usage_records,
            subscriptions: subs.len(),
            active_subscriptions,
            coin_balances,
            policies,
            accounts,
            settlements,
        })
    }
}

// ============================================================================
// Store trait implementations
// ============================================================================

// redb calls block, so each runs on the blocking pool. This keeps the
// runtime responsive and lets the gate's lookup timeout fire.

#[async_trait]
impl UsageStore for EntitlementDb {
    async fn load_usage(&self, user_id: &str, character_id: &str) -> EntitlementResult<Option<UsageRecord>> {
        let db = self.clone();
        let (user_id, character_id) = (user_id.to_string(), character_id.to_string());
        run_blocking(move || db.get_usage(&user_id, &character_id)).await
    }

    async fn apply_usage(&self, write: UsageWrite) -> EntitlementResult<UsageWriteOutcome> {
        let db = self.clone();
        run_blocking(move || db.apply_usage_write(&write)).await
    }
}

#[async_trait]
impl SubscriptionStore for EntitlementDb {
    async fn load_subscription(
        &self,
        user_id: &str,
        character_id: &str,
    ) -> EntitlementResult<Option<SubscriptionRecord>> {
        let db = self.clone();
        let (user_id, character_id) = (user_id.to_string(), character_id.to_string());
        run_blocking(move || db.get_subscription(&user_id, &character_id)).await
    }
}

#[async_trait]
impl CoinBalanceStore for EntitlementDb {
    async fn load_balance(&self, user_id: &str) -> EntitlementResult<u64> {
        let db = self.clone();
        let user_id = user_id.to_string();
        let record = run_blocking(move || db.get_coin_balance(&user_id)).await?;
        Ok(record.map(|record| record.balance).unwrap_or(0))
    }
}

#[async_trait]
impl PolicySource for EntitlementDb {
    async fn load_policy(&self, character_id: &str) -> EntitlementResult<Option<CharacterPolicyRecord>> {
        let db = self.clone();
        let character_id = character_id.to_string();
        run_blocking(move || db.get_policy(&character_id)).await
    }
}

#[async_trait]
impl AccountDirectory for EntitlementDb {
    async fn load_account(&self, user_id: &str) -> EntitlementResult<Option<AccountRecord>> {
        let db = self.clone();
        let user_id = user_id.to_string();
        run_blocking(move || db.get_account(&user_id)).await
    }
}

/// Run a synchronous storage call on the blocking pool
async fn run_blocking<T, F>(op: F) -> EntitlementResult<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| EntitlementError::StorageUnavailable(format!("Storage task failed: {}", e)))?
        .map_err(EntitlementError::storage)
}

// ============================================================================
// Helpers
// ============================================================================

fn encode<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| anyhow!("Failed to serialize {}: {}", what, e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| anyhow!("Failed to deserialize {}: {}", what, e))
}

/// Corrupt usage bytes are an integrity fault: log and treat as absent
fn decode_usage(bytes: &[u8], user_id: &str, character_id: &str) -> Option<UsageRecord> {
    match decode::<UsageRecord>(bytes, "usage") {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(
                "Discarding unreadable usage record for {}/{}: {}",
                user_id, character_id, e
            );
            None
        }
    }
}

fn put_usage(txn: &WriteTransaction, key: (&str, &str), record: &UsageRecord) -> Result<()> {
    let bytes = encode(record, "usage")?;
    let mut table = txn.open_table(USAGE)
        .map_err(|e| anyhow!("Failed to open usage table: {}", e))?;
    table.insert(key, bytes.as_slice())
        .map_err(|e| anyhow!("Failed to insert usage: {}", e))?;
    Ok(())
}

fn sanitize_minutes(minutes: f64) -> f64 {
    if minutes.is_finite() && minutes > 0.0 {
        minutes
    } else {
        0.0
    }
}

fn validate_delta(delta: &UsageDelta) -> Result<()> {
    match delta {
        UsageDelta::CallMinutes(m) | UsageDelta::IncludedMinutes(m) if !m.is_finite() || *m < 0.0 => {
            Err(anyhow!("Refusing to apply invalid minute delta {}", m))
        }
        _ => Ok(()),
    }
}
