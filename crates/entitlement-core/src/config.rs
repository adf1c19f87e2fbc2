//! ============================================================================
//! Entitlement Config - Tunables for the gate, ledger, and storage
//! ============================================================================
//! Defaults match production. Every field can be overridden from the
//! environment (or a `.env` file) via [`EntitlementConfig::from_env`].
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Reference timezone for month keys (UTC+9)
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 9;

/// New accounts bypass quota enforcement for this many days
pub const DEFAULT_GRACE_PERIOD_DAYS: i64 = 3;

/// Upper bound on each subscription/coin/usage/account lookup
pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 2_000;

/// Character policy cache lifetime in seconds (5 minutes)
pub const DEFAULT_POLICY_CACHE_SECS: i64 = 300;

pub const ENV_DB_PATH: &str = "ENTITLEMENT_DB_PATH";
pub const ENV_UTC_OFFSET_HOURS: &str = "ENTITLEMENT_UTC_OFFSET_HOURS";
pub const ENV_GRACE_PERIOD_DAYS: &str = "ENTITLEMENT_GRACE_PERIOD_DAYS";
pub const ENV_LOOKUP_TIMEOUT_MS: &str = "ENTITLEMENT_LOOKUP_TIMEOUT_MS";
pub const ENV_POLICY_CACHE_SECS: &str = "ENTITLEMENT_POLICY_CACHE_SECS";

/// Configuration for the entitlement core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementConfig {
    /// Database file; None means `ENTITLEMENT_DB_PATH` or ~/.companion/entitlements.redb
    pub db_path: Option<PathBuf>,
    /// Fixed UTC offset used to compute `YYYY-MM` month keys
    pub reference_utc_offset_hours: i32,
    /// Account age below which chat is unmetered
    pub grace_period_days: i64,
    /// Timeout applied to every input lookup in `check_*`
    pub lookup_timeout_ms: u64,
    /// How long a character policy stays cached
    pub policy_cache_secs: i64,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            reference_utc_offset_hours: DEFAULT_UTC_OFFSET_HOURS,
            grace_period_days: DEFAULT_GRACE_PERIOD_DAYS,
            lookup_timeout_ms: DEFAULT_LOOKUP_TIMEOUT_MS,
            policy_cache_secs: DEFAULT_POLICY_CACHE_SECS,
        }
    }
}

impl EntitlementConfig {
    /// Build config from defaults overridden by environment variables.
    /// A `.env` file in the working directory is loaded first if present.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded: {}", e);
        }

        let mut config = Self::default();

        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            config.db_path = Some(PathBuf::from(path));
        }
        if let Some(v) = parse_env::<i32>(ENV_UTC_OFFSET_HOURS)? {
            config.reference_utc_offset_hours = v;
        }
        if let Some(v) = parse_env::<i64>(ENV_GRACE_PERIOD_DAYS)? {
            config.grace_period_days = v;
        }
        if let Some(v) = parse_env::<u64>(ENV_LOOKUP_TIMEOUT_MS)? {
            config.lookup_timeout_ms = v;
        }
        if let Some(v) = parse_env::<i64>(ENV_POLICY_CACHE_SECS)? {
            config.policy_cache_secs = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the ledger and gate cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(-23..=23).contains(&self.reference_utc_offset_hours) {
            return Err(anyhow!(
                "UTC offset must be within -23..=23 hours, got {}",
                self.reference_utc_offset_hours
            ));
        }
        if self.grace_period_days < 0 {
            return Err(anyhow!(
                "Grace period cannot be negative, got {} days",
                self.grace_period_days
            ));
        }
        if chrono::Duration::try_days(self.grace_period_days).is_none() {
            return Err(anyhow!(
                "Grace period of {} days is out of range",
                self.grace_period_days
            ));
        }
        if self.lookup_timeout_ms == 0 {
            return Err(anyhow!("Lookup timeout must be greater than zero"));
        }
        if self.policy_cache_secs < 0 {
            warn!(
                "Negative policy cache duration {}s; policies will never be cached",
                self.policy_cache_secs
            );
        }
        Ok(())
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    /// Grace window, clamped to the representable range. `validate()`
    /// rejects values that would need clamping.
    pub fn grace_period(&self) -> chrono::Duration {
        if self.grace_period_days <= 0 {
            return chrono::Duration::zero();
        }
        chrono::Duration::try_days(self.grace_period_days).unwrap_or(chrono::Duration::MAX)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("Invalid value for {}: '{}' ({})", key, raw, e)),
        Err(_) => Ok(None),
    }
}
