//! ============================================================================
//! ENTITLEMENT-CORE: Usage-gated access for companion characters
//! ============================================================================
//! This crate decides what each user may do with each character:
//! - Monthly usage ledger per (user, character), reset on month change
//! - Tier resolution for chat messages and voice calls
//! - Settlement of consumed usage, idempotent per action id
//! - Embedded redb storage for usage, subscriptions, coins, and policies
//! ============================================================================

pub mod access;
pub mod config;
pub mod db;
pub mod ledger;
pub mod stores;
pub mod types;

// Re-export main types for convenience
pub use access::{AccessDecision, AccessGate, ActualUsage, Entitlement, SettlementReceipt};
pub use config::EntitlementConfig;
pub use db::EntitlementDb;
pub use ledger::{MonthClock, MonthKey, UsageLedger, UsageSnapshot};
pub use types::*;
