//! ============================================================================
//! Month Keys - `YYYY-MM` buckets in a fixed reference offset
//! ============================================================================
//! Month keys are compared by string equality only. The offset is fixed (no
//! DST rules), so the same instant always maps to the same key.
//! ============================================================================

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::types::{EntitlementError, EntitlementResult};

/// A validated `YYYY-MM` month key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey(String);

impl MonthKey {
    /// Parse and validate a `YYYY-MM` string
    pub fn parse(raw: &str) -> EntitlementResult<Self> {
        let bytes = raw.as_bytes();
        let well_formed = bytes.len() == 7
            && bytes[4] == b'-'
            && bytes[..4].iter().all(u8::is_ascii_digit)
            && bytes[5..].iter().all(u8::is_ascii_digit);
        if !well_formed {
            return Err(EntitlementError::InvalidRequest(format!(
                "malformed month key '{}'",
                raw
            )));
        }
        let month: u32 = raw[5..]
            .parse()
            .map_err(|_| EntitlementError::InvalidRequest(format!("malformed month key '{}'", raw)))?;
        if !(1..=12).contains(&month) {
            return Err(EntitlementError::InvalidRequest(format!(
                "month out of range in '{}'",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MonthKey {
    type Error = EntitlementError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MonthKey::parse(&value)
    }
}

impl From<MonthKey> for String {
    fn from(key: MonthKey) -> Self {
        key.0
    }
}

/// Time source for a [`MonthClock`]
pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Clock that maps instants to month keys in the reference offset
#[derive(Clone)]
pub struct MonthClock {
    offset: FixedOffset,
    now: NowFn,
}

impl MonthClock {
    /// Clock on system time at the given whole-hour UTC offset
    pub fn new(utc_offset_hours: i32) -> EntitlementResult<Self> {
        Self::with_now(utc_offset_hours, Arc::new(Utc::now))
    }

    /// Clock with an injected time source (tests, replay)
    pub fn with_now(utc_offset_hours: i32, now: NowFn) -> EntitlementResult<Self> {
        let offset = utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                EntitlementError::InvalidConfig(format!(
                    "UTC offset of {} hours is out of range",
                    utc_offset_hours
                ))
            })?;
        Ok(Self { offset, now })
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now)()
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn month_key_at(&self, at: DateTime<Utc>) -> MonthKey {
        MonthKey(at.with_timezone(&self.offset).format("%Y-%m").to_string())
    }

    pub fn current_month_key(&self) -> MonthKey {
        self.month_key_at(self.now())
    }
}

impl fmt::Debug for MonthClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonthClock")
            .field("offset", &self.offset)
            .finish()
    }
}
