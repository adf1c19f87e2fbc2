//! ============================================================================
//! Access Module - Usage-gated entitlements for chat and calls
//! ============================================================================
//! Decides which tier a user gets for each action with a character, and
//! records what the action consumed afterwards.
//!
//! ## Chat tiers (first match wins)
//! - **GRACE_PERIOD**: account younger than the grace window
//! - **FC_UNLIMITED**: active fan club subscription
//! - **FREE**: under the monthly free message limit
//! - **COIN_REQUIRED**: enough coins for one message
//! - **BLOCKED**
//!
//! ## Call tiers
//! Subscribers draw on their included minute pool, then pay the fan club
//! overage rate. Everyone else uses the free monthly minutes, then coins.
//!
//! ## Usage
//! ```rust,ignore
//! use entitlement_core::access::{AccessGate, ActualUsage};
//!
//! let gate = AccessGate::new(db, &config)?;
//! let decision = gate.check_chat(&user_id, &character_id).await?;
//! if decision.is_authorized() {
//!     // deliver the message, debit coins if decision.entitlement.coin_cost()
//!     gate.settle(&decision, &message_id, ActualUsage::Messages(1)).await?;
//! }
//! ```
//! ============================================================================

mod gate;
mod policy;
mod resolver;
mod types;

// Re-export public types
pub use gate::{AccessGate, StoreSet};
pub use policy::CharacterPolicyProvider;
pub use resolver::{resolve_call, resolve_chat, CallInputs, ChatInputs};
pub use types::{
    AccessDecision, ActualUsage, CallEntitlement, CallTier, CharacterPolicy, ChatTier,
    Entitlement, SettlementReceipt, BLOCKED_MESSAGE, DEFAULT_CALL_COIN_PER_MINUTE,
    DEFAULT_CHAT_COIN_COST, DEFAULT_FC_OVERAGE_CALL_COIN_PER_MINUTE, DEFAULT_FREE_CALL_MINUTES,
    DEFAULT_FREE_MESSAGE_LIMIT,
};
