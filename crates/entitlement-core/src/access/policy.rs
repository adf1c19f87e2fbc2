//! ============================================================================
//! Character Policy Provider - Cached per-character monetization settings
//! ============================================================================
//! Lookups never fail: a missing record or an unreachable source yields the
//! default policy. Hits are cached to avoid a storage read on every message.
//! ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::CharacterPolicy;
use crate::config::DEFAULT_POLICY_CACHE_SECS;
use crate::stores::PolicySource;

/// Maximum number of entries in the policy cache to prevent unbounded growth
const MAX_CACHE_SIZE: usize = 1000;

/// Cached policy information
#[derive(Debug, Clone)]
struct CachedPolicy {
    policy: CharacterPolicy,
    cached_at: i64,
}

/// Policy lookup with a bounded TTL cache in front of a [`PolicySource`]
pub struct CharacterPolicyProvider {
    source: Arc<dyn PolicySource>,
    cache: Arc<RwLock<HashMap<String, CachedPolicy>>>,
    cache_duration_secs: i64,
}

impl CharacterPolicyProvider {
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self::with_cache_duration(source, DEFAULT_POLICY_CACHE_SECS)
    }

    pub fn with_cache_duration(source: Arc<dyn PolicySource>, cache_duration_secs: i64) -> Self {
        Self {
            source,
            cache: Arc::new(RwLock::new(HashMap::new())),
            cache_duration_secs,
        }
    }

    /// Resolve the policy for a character, falling back to defaults
    pub async fn get(&self, character_id: &str) -> CharacterPolicy {
        let now = chrono::Utc::now().timestamp();

        // Check cache first
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(character_id) {
                if now - cached.cached_at < self.cache_duration_secs {
                    debug!(
                        "Policy cache hit for {} (age: {}s)",
                        character_id,
                        now - cached.cached_at
                    );
                    return cached.policy;
                }
            }
        }

        let policy = match self.source.load_policy(character_id).await {
            Ok(Some(record)) => CharacterPolicy::from(&record),
            Ok(None) => {
                debug!("No policy configured for {}, using defaults", character_id);
                CharacterPolicy::default()
            }
            Err(e) => {
                // Not cached, so the next lookup retries the source
                warn!("Policy lookup for {} failed: {} - using defaults", character_id, e);
                return CharacterPolicy::default();
            }
        };

        if self.cache_duration_secs > 0 {
            let mut cache = self.cache.write().await;
            // Evict oldest entry if cache is at capacity
            if cache.len() >= MAX_CACHE_SIZE && !cache.contains_key(character_id) {
                if let Some(oldest_key) = cache
                    .iter()
                    .min_by_key(|(_, v)| v.cached_at)
                    .map(|(k, _)| k.clone())
                {
                    cache.remove(&oldest_key);
                }
            }
            cache.insert(
                character_id.to_string(),
                CachedPolicy {
                    policy,
                    cached_at: now,
                },
            );
        }

        policy
    }

    /// Drop one character's cached policy (e.g. after an admin edit)
    pub async fn invalidate(&self, character_id: &str) {
        let mut cache = self.cache.write().await;
        if cache.remove(character_id).is_some() {
            info!("Invalidated policy cache for {}", character_id);
        }
    }

    /// Clear the entire cache
    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        let count = cache.len();
        cache.clear();
        info!("Cleared {} cached policies", count);
    }

    /// (total entries, entries still fresh)
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.read().await;
        let now = chrono::Utc::now().timestamp();
        let total = cache.len();
        let valid = cache
            .values()
            .filter(|c| now - c.cached_at < self.cache_duration_secs)
            .count();
        (total, valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CharacterPolicyRecord;
    use crate::types::{EntitlementError, EntitlementResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        record: Option<CharacterPolicyRecord>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PolicySource for CountingSource {
        async fn load_policy(&self, _character_id: &str) -> EntitlementResult<Option<CharacterPolicyRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EntitlementError::StorageUnavailable("down".into()));
            }
            Ok(self.record.clone())
        }
    }

    fn source(record: Option<CharacterPolicyRecord>, fail: bool) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            record,
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_missing_policy_yields_defaults() {
        let provider = CharacterPolicyProvider::new(source(None, false));
        assert_eq!(provider.get("c1").await, CharacterPolicy::default());
    }

    #[tokio::test]
    async fn test_source_failure_yields_defaults_uncached() {
        let src = source(None, true);
        let provider = CharacterPolicyProvider::new(src.clone());
        assert_eq!(provider.get("c1").await, CharacterPolicy::default());
        assert_eq!(provider.get("c1").await, CharacterPolicy::default());
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.cache_stats().await, (0, 0));
    }

    #[tokio::test]
    async fn test_configured_policy_is_cached() {
        let src = source(
            Some(CharacterPolicyRecord {
                character_id: "c1".into(),
                free_message_limit: Some(3),
                ..Default::default()
            }),
            false,
        );
        let provider = CharacterPolicyProvider::new(src.clone());
        assert_eq!(provider.get("c1").await.free_message_limit, 3);
        assert_eq!(provider.get("c1").await.free_message_limit, 3);
        assert_eq!(src.calls.load(Ordering::SeqCst), 1);

        provider.invalidate("c1").await;
        provider.get("c1").await;
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_duration_disables_cache() {
        let src = source(None, false);
        let provider = CharacterPolicyProvider::with_cache_duration(src.clone(), 0);
        provider.get("c1").await;
        provider.get("c1").await;
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let provider = CharacterPolicyProvider::new(source(None, false));
        provider.get("c1").await;
        provider.get("c2").await;
        assert_eq!(provider.cache_stats().await, (2, 2));
        provider.clear().await;
        assert_eq!(provider.cache_stats().await, (0, 0));
    }
}
