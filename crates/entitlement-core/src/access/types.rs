//! ============================================================================
//! Access Types - Character policies, entitlement tiers, and decisions
//! ============================================================================
//! Tier names serialize to the wire labels the chat and call services
//! already switch on (`FREE`, `FC_UNLIMITED`, ...).
//! ============================================================================

use serde::{Deserialize, Serialize};

use crate::db::CharacterPolicyRecord;
use crate::ledger::UsageSnapshot;
use crate::types::GatedAction;

/// Free chat messages per character per month
pub const DEFAULT_FREE_MESSAGE_LIMIT: u32 = 10;
/// Free call minutes per character per month
pub const DEFAULT_FREE_CALL_MINUTES: u32 = 5;
/// Coins per call minute for non-subscribers
pub const DEFAULT_CALL_COIN_PER_MINUTE: u64 = 200;
/// Coins per call minute for subscribers past their included pool
pub const DEFAULT_FC_OVERAGE_CALL_COIN_PER_MINUTE: u64 = 100;
/// Coins per chat message past the free quota
pub const DEFAULT_CHAT_COIN_COST: u64 = 10;

/// Shown for every `BLOCKED` decision regardless of cause
pub const BLOCKED_MESSAGE: &str =
    "You've reached your limit. Upgrade to the fan club or top up coins to continue.";

/// Per-character monetization settings, always fully resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterPolicy {
    pub free_message_limit: u32,
    pub free_call_minutes: u32,
    pub call_coin_per_minute: u64,
    pub fc_overage_call_coin_per_minute: u64,
    pub chat_coin_cost: u64,
}

impl Default for CharacterPolicy {
    fn default() -> Self {
        Self {
            free_message_limit: DEFAULT_FREE_MESSAGE_LIMIT,
            free_call_minutes: DEFAULT_FREE_CALL_MINUTES,
            call_coin_per_minute: DEFAULT_CALL_COIN_PER_MINUTE,
            fc_overage_call_coin_per_minute: DEFAULT_FC_OVERAGE_CALL_COIN_PER_MINUTE,
            chat_coin_cost: DEFAULT_CHAT_COIN_COST,
        }
    }
}

impl From<&CharacterPolicyRecord> for CharacterPolicy {
    fn from(record: &CharacterPolicyRecord) -> Self {
        let defaults = CharacterPolicy::default();
        Self {
            free_message_limit: record.free_message_limit.unwrap_or(defaults.free_message_limit),
            free_call_minutes: record.free_call_minutes.unwrap_or(defaults.free_call_minutes),
            call_coin_per_minute: record
                .call_coin_per_minute
                .unwrap_or(defaults.call_coin_per_minute),
            fc_overage_call_coin_per_minute: record
                .fc_overage_call_coin_per_minute
                .unwrap_or(defaults.fc_overage_call_coin_per_minute),
            chat_coin_cost: record.chat_coin_cost.unwrap_or(defaults.chat_coin_cost),
        }
    }
}

/// Chat entitlement tiers, in precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatTier {
    /// New account; quotas are not enforced
    GracePeriod,
    /// Active fan club subscription; unlimited chat
    FcUnlimited,
    /// Within the monthly free quota
    Free {
        messages_used: u32,
        messages_remaining: u32,
    },
    /// Quota exhausted; each message costs coins
    CoinRequired { coin_cost: u64 },
    Blocked,
}

impl ChatTier {
    pub fn label(&self) -> &'static str {
        match self {
            ChatTier::GracePeriod => "GRACE_PERIOD",
            ChatTier::FcUnlimited => "FC_UNLIMITED",
            ChatTier::Free { .. } => "FREE",
            ChatTier::CoinRequired { .. } => "COIN_REQUIRED",
            ChatTier::Blocked => "BLOCKED",
        }
    }

    /// Free messages left; None is unlimited
    pub fn messages_remaining(&self) -> Option<u32> {
        match self {
            ChatTier::GracePeriod | ChatTier::FcUnlimited => None,
            ChatTier::Free {
                messages_remaining, ..
            } => Some(*messages_remaining),
            ChatTier::CoinRequired { .. } | ChatTier::Blocked => Some(0),
        }
    }
}

/// Call entitlement tiers, in precedence order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallTier {
    /// Covered by the subscription's included minute pool
    FcIncluded { included_minutes_remaining: f64 },
    /// Within the monthly free call allowance
    Free { minutes_remaining: f64 },
    /// Billed per minute in coins
    CoinRequired { coin_cost_per_minute: u64 },
    Blocked,
}

impl CallTier {
    pub fn label(&self) -> &'static str {
        match self {
            CallTier::FcIncluded { .. } => "FC_INCLUDED",
            CallTier::Free { .. } => "FREE",
            CallTier::CoinRequired { .. } => "COIN_REQUIRED",
            CallTier::Blocked => "BLOCKED",
        }
    }
}

/// Call tier plus whether the fan club path produced it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CallEntitlement {
    #[serde(flatten)]
    pub tier: CallTier,
    pub is_fanclub: bool,
}

/// Resolved entitlement for one action
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "grant", rename_all = "snake_case")]
pub enum Entitlement {
    Chat(ChatTier),
    Call(CallEntitlement),
}

impl Entitlement {
    pub fn action(&self) -> GatedAction {
        match self {
            Entitlement::Chat(_) => GatedAction::Chat,
            Entitlement::Call(_) => GatedAction::Call,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Entitlement::Chat(tier) => tier.label(),
            Entitlement::Call(call) => call.tier.label(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            Entitlement::Chat(ChatTier::Blocked)
                | Entitlement::Call(CallEntitlement {
                    tier: CallTier::Blocked,
                    ..
                })
        )
    }

    /// Coins the caller must debit (per message, or per call minute)
    pub fn coin_cost(&self) -> Option<u64> {
        match self {
            Entitlement::Chat(ChatTier::CoinRequired { coin_cost }) => Some(*coin_cost),
            Entitlement::Call(CallEntitlement {
                tier: CallTier::CoinRequired {
                    coin_cost_per_minute,
                },
                ..
            }) => Some(*coin_cost_per_minute),
            _ => None,
        }
    }
}

/// Gate output: the entitlement plus the context needed to settle it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub user_id: String,
    pub character_id: String,
    /// Month the inputs were read from
    pub month_key: String,
    /// Unix seconds
    pub decided_at: i64,
    pub entitlement: Entitlement,
    /// Usage the decision was based on
    pub usage: UsageSnapshot,
}

impl AccessDecision {
    /// Whether the caller may perform the action (after any coin debit)
    pub fn is_authorized(&self) -> bool {
        !self.entitlement.is_blocked()
    }

    pub fn action(&self) -> GatedAction {
        self.entitlement.action()
    }

    /// User-facing affordance for this decision. Blocked decisions always
    /// get the same generic text so the reason is never exposed.
    pub fn upgrade_prompt(&self) -> Option<String> {
        match &self.entitlement {
            Entitlement::Chat(ChatTier::GracePeriod) | Entitlement::Chat(ChatTier::FcUnlimited) => None,
            Entitlement::Chat(ChatTier::Free {
                messages_remaining, ..
            }) => Some(format!(
                "{} free message{} left this month. Join the fan club for unlimited chat.",
                messages_remaining,
                if *messages_remaining == 1 { "" } else { "s" }
            )),
            Entitlement::Chat(ChatTier::CoinRequired { coin_cost }) => Some(format!(
                "Free messages used up. This message costs {} coins.",
                coin_cost
            )),
            Entitlement::Call(CallEntitlement {
                tier: CallTier::FcIncluded { .. },
                ..
            }) => None,
            Entitlement::Call(CallEntitlement {
                tier: CallTier::Free { minutes_remaining },
                ..
            }) => Some(format!(
                "{:.0} free call minutes left this month. Join the fan club for included minutes.",
                minutes_remaining.floor()
            )),
            Entitlement::Call(CallEntitlement {
                tier: CallTier::CoinRequired {
                    coin_cost_per_minute,
                },
                ..
            }) => Some(format!(
                "This call costs {} coins per minute.",
                coin_cost_per_minute
            )),
            Entitlement::Chat(ChatTier::Blocked)
            | Entitlement::Call(CallEntitlement {
                tier: CallTier::Blocked,
                ..
            }) => Some(BLOCKED_MESSAGE.to_string()),
        }
    }
}

/// Usage actually consumed by a completed action
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActualUsage {
    Messages(u32),
    CallMinutes(f64),
}

impl ActualUsage {
    pub fn action(&self) -> GatedAction {
        match self {
            ActualUsage::Messages(_) => GatedAction::Chat,
            ActualUsage::CallMinutes(_) => GatedAction::Call,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            ActualUsage::Messages(n) => *n == 0,
            ActualUsage::CallMinutes(m) => *m == 0.0,
        }
    }
}

/// Result of `AccessGate::settle`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementReceipt {
    /// Usage was recorded
    Applied {
        action_id: String,
        usage: UsageSnapshot,
        /// Subscription pool after the write, for `FC_INCLUDED` calls
        included_minutes_remaining: Option<f64>,
        /// Minutes beyond the included pool; recorded, not billed
        unbilled_overage_minutes: f64,
    },
    /// This action id was settled before; nothing changed
    AlreadySettled { action_id: String, settled_at: i64 },
    /// Nothing was consumed (e.g. a call that never connected)
    NoOp,
}
