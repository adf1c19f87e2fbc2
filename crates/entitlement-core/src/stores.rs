//! ============================================================================
//! Store Interfaces - Seams between the gate and its backing data
//! ============================================================================
//! The gate only talks to storage through these traits. `EntitlementDb`
//! implements all of them; hosts with their own billing tables can supply
//! their own implementations.
//! ============================================================================

use async_trait::async_trait;

use crate::db::{
    AccountRecord, CharacterPolicyRecord, SettlementRecord, SubscriptionRecord, UsageRecord,
};
use crate::ledger::MonthKey;
use crate::types::EntitlementResult;

/// Source of per-character monetization overrides
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn load_policy(&self, character_id: &str) -> EntitlementResult<Option<CharacterPolicyRecord>>;
}

/// Read-only Fan Club subscription lookup
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn load_subscription(
        &self,
        user_id: &str,
        character_id: &str,
    ) -> EntitlementResult<Option<SubscriptionRecord>>;
}

/// Read-only coin balance lookup
#[async_trait]
pub trait CoinBalanceStore: Send + Sync {
    async fn load_balance(&self, user_id: &str) -> EntitlementResult<u64>;
}

/// Read-only account signup lookup
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn load_account(&self, user_id: &str) -> EntitlementResult<Option<AccountRecord>>;
}

/// What a single atomic usage write changes
#[derive(Debug, Clone, PartialEq)]
pub enum UsageDelta {
    /// Add to `messages_sent`
    Messages(u32),
    /// Add to `call_minutes_used` (free quota)
    CallMinutes(f64),
    /// Draw down the subscription's included minute pool
    IncludedMinutes(f64),
    /// Write only the settlement marker
    RecordOnly,
}

/// One atomic usage write: rollover, delta, and optional settlement marker
#[derive(Debug, Clone)]
pub struct UsageWrite {
    pub user_id: String,
    pub character_id: String,
    pub month_key: MonthKey,
    pub delta: UsageDelta,
    /// Written in the same transaction; an existing marker aborts the write
    pub settlement: Option<SettlementRecord>,
    pub now: i64,
}

/// Result of an applied usage write
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUsage {
    /// Usage record as committed (post-rollover, post-delta)
    pub usage: UsageRecord,
    /// Pool after the write, when the delta touched a subscription
    pub included_minutes_remaining: Option<f64>,
    /// Minutes the included pool could not cover
    pub overage_minutes: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UsageWriteOutcome {
    Applied(AppliedUsage),
    /// The settlement marker already existed; nothing was written
    Duplicate(SettlementRecord),
}

/// Usage counter storage. Every mutation goes through `apply_usage`, which
/// must execute as a single atomic read-modify-write at the storage layer.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn load_usage(&self, user_id: &str, character_id: &str) -> EntitlementResult<Option<UsageRecord>>;

    async fn apply_usage(&self, write: UsageWrite) -> EntitlementResult<UsageWriteOutcome>;
}
