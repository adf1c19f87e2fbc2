//! ============================================================================
//! Shared Types - Errors and identifiers used across the entitlement core
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Result alias for the public entitlement API
pub type EntitlementResult<T> = std::result::Result<T, EntitlementError>;

/// Error types surfaced to callers of the gate and ledger.
///
/// Missing character policies and corrupt usage records have no variant here:
/// the former resolve to defaults and the latter are logged and read as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum EntitlementError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Invalid settlement: {0}")]
    InvalidSettlement(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EntitlementError {
    /// Wrap a storage-layer failure
    pub fn storage(err: anyhow::Error) -> Self {
        EntitlementError::StorageUnavailable(format!("{:#}", err))
    }

    /// Whether the caller should retry the whole check/settle call
    pub fn is_transient(&self) -> bool {
        matches!(self, EntitlementError::StorageUnavailable(_))
    }
}

/// The two metered actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatedAction {
    Chat,
    Call,
}

impl GatedAction {
    pub fn display_name(&self) -> &'static str {
        match self {
            GatedAction::Chat => "Chat",
            GatedAction::Call => "Voice Call",
        }
    }
}

/// Reject empty identifiers before they reach storage keys
pub(crate) fn require_ids(user_id: &str, character_id: &str) -> EntitlementResult<()> {
    if user_id.trim().is_empty() {
        return Err(EntitlementError::InvalidRequest("user id is empty".into()));
    }
    if character_id.trim().is_empty() {
        return Err(EntitlementError::InvalidRequest("character id is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_are_transient() {
        let err = EntitlementError::storage(anyhow::anyhow!("disk gone"));
        assert!(err.is_transient());
        assert!(err.to_string().contains("disk gone"));
        assert!(!EntitlementError::InvalidUsage("x".into()).is_transient());
    }

    #[test]
    fn test_require_ids() {
        assert!(require_ids("u1", "c1").is_ok());
        assert!(matches!(
            require_ids("", "c1"),
            Err(EntitlementError::InvalidRequest(_))
        ));
        assert!(matches!(
            require_ids("u1", "  "),
            Err(EntitlementError::InvalidRequest(_))
        ));
    }
}
