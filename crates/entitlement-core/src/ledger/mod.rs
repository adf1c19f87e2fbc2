//! ============================================================================
//! Usage Ledger - Monthly message/call counters per (user, character)
//! ============================================================================
//! Reads treat a stale month as zero without touching storage. Every write
//! is one atomic `UsageStore::apply_usage` call that rolls the month over,
//! adds the delta, and persists both together.
//! ============================================================================

mod month;

pub use month::{MonthClock, MonthKey, NowFn};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{SettlementRecord, UsageRecord};
use crate::stores::{UsageDelta, UsageStore, UsageWrite, UsageWriteOutcome};
use crate::types::{require_ids, EntitlementError, EntitlementResult};

/// Current-month usage for one (user, character) pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub messages_sent: u32,
    pub call_minutes_used: f64,
}

impl UsageSnapshot {
    fn from_record(record: &UsageRecord) -> Self {
        Self {
            messages_sent: record.messages_sent,
            call_minutes_used: record.call_minutes_used,
        }
    }
}

/// Ledger over a usage store and a month clock
#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn UsageStore>,
    clock: MonthClock,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn UsageStore>, clock: MonthClock) -> Self {
        Self { store, clock }
    }

    pub fn clock(&self) -> &MonthClock {
        &self.clock
    }

    pub fn month_key_now(&self) -> MonthKey {
        self.clock.current_month_key()
    }

    /// Usage for the current month. A record from another month, or one
    /// that fails integrity checks, reads as zero; storage is not modified.
    pub async fn read(&self, user_id: &str, character_id: &str) -> EntitlementResult<UsageSnapshot> {
        require_ids(user_id, character_id)?;
        let month_key = self.month_key_now();

        let stored = self.store.load_usage(user_id, character_id).await?;
        let snapshot = match stored {
            Some(record) if record.is_current(&month_key) => UsageSnapshot::from_record(&record),
            Some(record) => {
                if let Some(fault) = record.integrity_fault() {
                    warn!(
                        "Usage record for {}/{} is invalid ({}); reading as zero",
                        user_id, character_id, fault
                    );
                } else {
                    debug!(
                        "Usage for {}/{} is from {} (now {}); reading as zero",
                        user_id, character_id, record.month_key, month_key
                    );
                }
                UsageSnapshot::default()
            }
            None => UsageSnapshot::default(),
        };

        Ok(snapshot)
    }

    /// Atomically add `delta` messages to the current month
    pub async fn increment_messages(
        &self,
        user_id: &str,
        character_id: &str,
        delta: u32,
    ) -> EntitlementResult<UsageSnapshot> {
        let outcome = self
            .apply(user_id, character_id, UsageDelta::Messages(delta), None)
            .await?;
        Ok(usage_of(&outcome))
    }

    /// Atomically add `minutes` of call time to the current month's free quota
    pub async fn increment_call_minutes(
        &self,
        user_id: &str,
        character_id: &str,
        minutes: f64,
    ) -> EntitlementResult<UsageSnapshot> {
        validate_minutes(minutes)?;
        let outcome = self
            .apply(user_id, character_id, UsageDelta::CallMinutes(minutes), None)
            .await?;
        Ok(usage_of(&outcome))
    }

    /// Atomic write with an idempotency marker. Used by settlement.
    pub(crate) async fn apply(
        &self,
        user_id: &str,
        character_id: &str,
        delta: UsageDelta,
        settlement: Option<SettlementRecord>,
    ) -> EntitlementResult<UsageWriteOutcome> {
        require_ids(user_id, character_id)?;
        if let UsageDelta::CallMinutes(m) | UsageDelta::IncludedMinutes(m) = delta {
            validate_minutes(m)?;
        }

        let now = self.clock.now();
        let month_key = self.clock.month_key_at(now);
        // Marker is stamped with the month the write lands in
        let settlement = settlement.map(|mut marker| {
            marker.month_key = month_key.to_string();
            marker.settled_at = now.timestamp();
            marker
        });
        let write = UsageWrite {
            user_id: user_id.to_string(),
            character_id: character_id.to_string(),
            month_key,
            delta,
            settlement,
            now: now.timestamp(),
        };

        let outcome = self.store.apply_usage(write).await?;
        if let UsageWriteOutcome::Applied(applied) = &outcome {
            info!(
                "Usage for {}/{} in {}: {} messages, {:.2} call minutes",
                user_id,
                character_id,
                applied.usage.month_key,
                applied.usage.messages_sent,
                applied.usage.call_minutes_used
            );
        }
        Ok(outcome)
    }
}

fn usage_of(outcome: &UsageWriteOutcome) -> UsageSnapshot {
    match outcome {
        UsageWriteOutcome::Applied(applied) => UsageSnapshot::from_record(&applied.usage),
        // Plain increments carry no settlement marker, so this arm is unreachable
        UsageWriteOutcome::Duplicate(_) => UsageSnapshot::default(),
    }
}

fn validate_minutes(minutes: f64) -> EntitlementResult<()> {
    if !minutes.is_finite() || minutes < 0.0 {
        return Err(EntitlementError::InvalidUsage(format!(
            "call minutes must be a non-negative number, got {}",
            minutes
        )));
    }
    Ok(())
}
