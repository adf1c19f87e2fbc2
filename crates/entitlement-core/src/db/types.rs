//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ledger::MonthKey;

/// Monthly usage counters for one (user, character) pair.
/// Only meaningful while `month_key` equals the current month key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub character_id: String,
    /// `YYYY-MM` in the reference offset
    pub month_key: String,
    pub messages_sent: u32,
    pub call_minutes_used: f64,
    pub updated_at: i64,
}

impl UsageRecord {
    /// Fresh zeroed record for the given month
    pub fn new(user_id: &str, character_id: &str, month_key: &MonthKey, now: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            character_id: character_id.to_string(),
            month_key: month_key.to_string(),
            messages_sent: 0,
            call_minutes_used: 0.0,
            updated_at: now,
        }
    }

    /// Counters to build on for `month_key`: the stored record if it is
    /// current and sound, otherwise a zeroed record. A stale or faulty
    /// record is reset, never deleted.
    pub fn for_month(
        stored: Option<UsageRecord>,
        user_id: &str,
        character_id: &str,
        month_key: &MonthKey,
        now: i64,
    ) -> Self {
        match stored {
            Some(record) if record.is_current(month_key) => record,
            Some(record) => {
                if let Some(fault) = record.integrity_fault() {
                    warn!(
                        "Resetting usage for {}/{} after integrity fault: {}",
                        user_id, character_id, fault
                    );
                } else {
                    debug!(
                        "Rolling usage for {}/{} from {} to {}",
                        user_id, character_id, record.month_key, month_key
                    );
                }
                Self::new(user_id, character_id, month_key, now)
            }
            None => Self::new(user_id, character_id, month_key, now),
        }
    }

    /// Description of the first integrity fault, if any
    pub fn integrity_fault(&self) -> Option<String> {
        if MonthKey::parse(&self.month_key).is_err() {
            return Some(format!("malformed month key '{}'", self.month_key));
        }
        if !self.call_minutes_used.is_finite() || self.call_minutes_used < 0.0 {
            return Some(format!(
                "invalid call minutes {}",
                self.call_minutes_used
            ));
        }
        None
    }

    /// Whether the counters apply to `month_key`
    pub fn is_current(&self, month_key: &MonthKey) -> bool {
        self.month_key == month_key.as_str() && self.integrity_fault().is_none()
    }
}

/// Fan Club subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "past_due" | "past-due" | "pastdue" => Some(Self::PastDue),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

/// Fan Club subscription for one (user, character) pair.
/// The included minute pool is replenished by the external billing cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub character_id: String,
    pub status: SubscriptionStatus,
    pub included_minutes_remaining: f64,
    pub updated_at: i64,
}

impl SubscriptionRecord {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

/// Coin balance for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinBalanceRecord {
    pub user_id: String,
    pub balance: u64,
    pub updated_at: i64,
}

/// Signup metadata used for the grace period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub user_id: String,
    /// Unix seconds
    pub created_at: i64,
}

/// Per-character monetization overrides. Unset fields fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterPolicyRecord {
    pub character_id: String,
    pub free_message_limit: Option<u32>,
    pub free_call_minutes: Option<u32>,
    pub call_coin_per_minute: Option<u64>,
    pub fc_overage_call_coin_per_minute: Option<u64>,
    pub chat_coin_cost: Option<u64>,
}

impl CharacterPolicyRecord {
    /// Overlay the fields set in `other` on top of this record
    pub fn merge(mut self, other: &CharacterPolicyRecord) -> Self {
        if other.free_message_limit.is_some() {
            self.free_message_limit = other.free_message_limit;
        }
        if other.free_call_minutes.is_some() {
            self.free_call_minutes = other.free_call_minutes;
        }
        if other.call_coin_per_minute.is_some() {
            self.call_coin_per_minute = other.call_coin_per_minute;
        }
        if other.fc_overage_call_coin_per_minute.is_some() {
            self.fc_overage_call_coin_per_minute = other.fc_overage_call_coin_per_minute;
        }
        if other.chat_coin_cost.is_some() {
            self.chat_coin_cost = other.chat_coin_cost;
        }
        self
    }
}

/// Marker written with a settled usage delta, keyed by action id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub action_id: String,
    pub user_id: String,
    pub character_id: String,
    /// Tier label of the authorizing decision, e.g. `FREE`
    pub tier: String,
    pub month_key: String,
    pub messages: u32,
    pub call_minutes: f64,
    pub unbilled_overage_minutes: f64,
    pub settled_at: i64,
}

/// Record counts per table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbStats {
    pub usage_records: usize,
    pub subscriptions: usize,
    pub active_subscriptions: usize,
    pub coin_balances: usize,
    pub policies: usize,
    pub accounts: usize,
    pub settlements: usize,
}
