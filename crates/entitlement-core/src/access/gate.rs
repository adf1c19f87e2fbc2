//! ============================================================================
//! Access Gate - Gathers inputs, resolves tiers, and settles usage
//! ============================================================================
//! `check_chat` / `check_call` read policy, usage, subscription, coins, and
//! account age concurrently, each bounded by the lookup timeout, then hand
//! them to the pure resolver. `settle` records what the action consumed.
//!
//! Failure policy for reads:
//! - subscription, coin balance, account: fail closed (no entitlement)
//! - usage: fail open (zero usage)
//! - policy: defaults
//! ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::policy::CharacterPolicyProvider;
use super::resolver::{resolve_call, resolve_chat, CallInputs, ChatInputs};
use super::types::{
    AccessDecision, ActualUsage, CallEntitlement, CallTier, CharacterPolicy, Entitlement,
    SettlementReceipt,
};
use crate::config::EntitlementConfig;
use crate::db::{AccountRecord, EntitlementDb, SettlementRecord, SubscriptionRecord};
use crate::ledger::{MonthClock, UsageLedger, UsageSnapshot};
use crate::stores::{
    AccountDirectory, CoinBalanceStore, PolicySource, SubscriptionStore, UsageDelta, UsageStore,
    UsageWriteOutcome,
};
use crate::types::{require_ids, EntitlementError, EntitlementResult};

/// Backing stores for the gate
#[derive(Clone)]
pub struct StoreSet {
    pub policies: Arc<dyn PolicySource>,
    pub usage: Arc<dyn UsageStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub coins: Arc<dyn CoinBalanceStore>,
    pub accounts: Arc<dyn AccountDirectory>,
}

impl StoreSet {
    /// Every store served by one embedded database
    pub fn from_db(db: Arc<EntitlementDb>) -> Self {
        Self {
            policies: db.clone(),
            usage: db.clone(),
            subscriptions: db.clone(),
            coins: db.clone(),
            accounts: db,
        }
    }
}

/// Inputs after the failure policy has been applied
#[derive(Debug, Clone)]
struct GatheredInputs {
    policy: CharacterPolicy,
    usage: UsageSnapshot,
    subscription: Option<SubscriptionRecord>,
    coin_balance: u64,
    in_grace_period: bool,
}

impl GatheredInputs {
    fn subscription_active(&self) -> bool {
        self.subscription.as_ref().map(|s| s.is_active()).unwrap_or(false)
    }

    fn included_minutes_remaining(&self) -> f64 {
        match &self.subscription {
            Some(sub) if sub.is_active() && sub.included_minutes_remaining.is_finite() => {
                sub.included_minutes_remaining.max(0.0)
            }
            _ => 0.0,
        }
    }
}

/// Orchestrates entitlement checks and settlement
pub struct AccessGate {
    policies: CharacterPolicyProvider,
    ledger: UsageLedger,
    subscriptions: Arc<dyn SubscriptionStore>,
    coins: Arc<dyn CoinBalanceStore>,
    accounts: Arc<dyn AccountDirectory>,
    grace_period: chrono::Duration,
    lookup_timeout: Duration,
}

impl AccessGate {
    /// Gate over a single embedded database
    pub fn new(db: Arc<EntitlementDb>, config: &EntitlementConfig) -> EntitlementResult<Self> {
        let clock = MonthClock::new(config.reference_utc_offset_hours)?;
        Ok(Self::with_stores(StoreSet::from_db(db), clock, config))
    }

    /// Gate over arbitrary stores and an explicit clock
    pub fn with_stores(stores: StoreSet, clock: MonthClock, config: &EntitlementConfig) -> Self {
        Self {
            policies: CharacterPolicyProvider::with_cache_duration(
                stores.policies,
                config.policy_cache_secs,
            ),
            ledger: UsageLedger::new(stores.usage, clock),
            subscriptions: stores.subscriptions,
            coins: stores.coins,
            accounts: stores.accounts,
            grace_period: config.grace_period(),
            lookup_timeout: config.lookup_timeout(),
        }
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn policies(&self) -> &CharacterPolicyProvider {
        &self.policies
    }

    // ========================================================================
    // Checks
    // ========================================================================

    /// Decide whether the user may send a chat message to the character
    pub async fn check_chat(&self, user_id: &str, character_id: &str) -> EntitlementResult<AccessDecision> {
        require_ids(user_id, character_id)?;
        let now = self.ledger.clock().now();
        let inputs = self.gather(user_id, character_id, now).await;

        let tier = resolve_chat(&ChatInputs::new(
            &inputs.policy,
            inputs.in_grace_period,
            inputs.subscription_active(),
            inputs.usage.messages_sent,
            inputs.coin_balance,
        ));

        let decision = self.decision(user_id, character_id, now, Entitlement::Chat(tier), inputs.usage);
        info!(
            "Chat access for {}/{}: {} ({} sent this month)",
            user_id,
            character_id,
            tier.label(),
            inputs.usage.messages_sent
        );
        Ok(decision)
    }

    /// Decide whether the user may start a call with the character
    pub async fn check_call(&self, user_id: &str, character_id: &str) -> EntitlementResult<AccessDecision> {
        require_ids(user_id, character_id)?;
        let now = self.ledger.clock().now();
        let inputs = self.gather(user_id, character_id, now).await;

        let call = resolve_call(&CallInputs::new(
            &inputs.policy,
            inputs.subscription_active(),
            inputs.included_minutes_remaining(),
            inputs.usage.call_minutes_used,
            inputs.coin_balance,
        ));

        let decision = self.decision(user_id, character_id, now, Entitlement::Call(call), inputs.usage);
        info!(
            "Call access for {}/{}: {} (fanclub: {}, {:.2} free minutes used)",
            user_id,
            character_id,
            call.tier.label(),
            call.is_fanclub,
            inputs.usage.call_minutes_used
        );
        Ok(decision)
    }

    fn decision(
        &self,
        user_id: &str,
        character_id: &str,
        now: chrono::DateTime<chrono::Utc>,
        entitlement: Entitlement,
        usage: UsageSnapshot,
    ) -> AccessDecision {
        AccessDecision {
            user_id: user_id.to_string(),
            character_id: character_id.to_string(),
            month_key: self.ledger.clock().month_key_at(now).to_string(),
            decided_at: now.timestamp(),
            entitlement,
            usage,
        }
    }

    async fn gather(
        &self,
        user_id: &str,
        character_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> GatheredInputs {
        let (policy, usage, subscription, coins, account) = tokio::join!(
            tokio::time::timeout(self.lookup_timeout, self.policies.get(character_id)),
            self.bounded("usage", self.ledger.read(user_id, character_id)),
            self.bounded("subscription", self.subscriptions.load_subscription(user_id, character_id)),
            self.bounded("coin balance", self.coins.load_balance(user_id)),
            self.bounded("account", self.accounts.load_account(user_id)),
        );

        let policy = policy.unwrap_or_else(|_| {
            warn!("Policy lookup for {} timed out - using defaults", character_id);
            CharacterPolicy::default()
        });

        let usage = usage.unwrap_or_else(|e| {
            warn!(
                "Usage read for {}/{} failed: {} - assuming zero usage",
                user_id, character_id, e
            );
            UsageSnapshot::default()
        });

        let subscription = subscription.unwrap_or_else(|e| {
            warn!(
                "Subscription lookup for {}/{} failed: {} - treating as not subscribed",
                user_id, character_id, e
            );
            None
        });

        let coin_balance = coins.unwrap_or_else(|e| {
            warn!("Coin balance lookup for {} failed: {} - treating as zero", user_id, e);
            0
        });

        let account = account.unwrap_or_else(|e| {
            warn!("Account lookup for {} failed: {} - no grace period", user_id, e);
            None
        });

        GatheredInputs {
            policy,
            usage,
            subscription,
            coin_balance,
            in_grace_period: self.in_grace_period(account.as_ref(), now),
        }
    }

    fn in_grace_period(&self, account: Option<&AccountRecord>, now: chrono::DateTime<chrono::Utc>) -> bool {
        match account {
            Some(account) => now.timestamp() - account.created_at < self.grace_period.num_seconds(),
            None => false,
        }
    }

    async fn bounded<T>(
        &self,
        what: &str,
        lookup: impl Future<Output = EntitlementResult<T>>,
    ) -> EntitlementResult<T> {
        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(result) => result,
            Err(_) => Err(EntitlementError::StorageUnavailable(format!(
                "{} lookup timed out after {:?}",
                what, self.lookup_timeout
            ))),
        }
    }

    // ========================================================================
    // Settlement
    // ========================================================================

    /// Record the usage an authorized action consumed.
    ///
    /// Idempotent per `action_id`: a repeat returns `AlreadySettled` without
    /// touching counters. Zero usage is a no-op and does not consume the id.
    pub async fn settle(
        &self,
        decision: &AccessDecision,
        action_id: &str,
        actual: ActualUsage,
    ) -> EntitlementResult<SettlementReceipt> {
        if action_id.trim().is_empty() {
            return Err(EntitlementError::InvalidRequest("action id is empty".into()));
        }
        if decision.action() != actual.action() {
            return Err(EntitlementError::InvalidSettlement(format!(
                "{} decision cannot settle {} usage",
                decision.action().display_name(),
                actual.action().display_name()
            )));
        }
        if decision.entitlement.is_blocked() {
            return Err(EntitlementError::InvalidSettlement(format!(
                "action {} was blocked and cannot be settled",
                action_id
            )));
        }
        if let ActualUsage::CallMinutes(m) = actual {
            if !m.is_finite() || m < 0.0 {
                return Err(EntitlementError::InvalidUsage(format!(
                    "call minutes must be a non-negative number, got {}",
                    m
                )));
            }
        }
        if actual.is_zero() {
            debug!("Action {} consumed nothing; skipping settlement", action_id);
            return Ok(SettlementReceipt::NoOp);
        }

        let (delta, messages, call_minutes) = match (&decision.entitlement, actual) {
            (Entitlement::Chat(_), ActualUsage::Messages(n)) => (UsageDelta::Messages(n), n, 0.0),
            (
                Entitlement::Call(CallEntitlement {
                    tier: CallTier::FcIncluded { .. },
                    ..
                }),
                ActualUsage::CallMinutes(m),
            ) => (UsageDelta::IncludedMinutes(m), 0, m),
            (Entitlement::Call(CallEntitlement { is_fanclub: true, .. }), ActualUsage::CallMinutes(m)) => {
                (UsageDelta::RecordOnly, 0, m)
            }
            (Entitlement::Call(_), ActualUsage::CallMinutes(m)) => (UsageDelta::CallMinutes(m), 0, m),
            _ => {
                return Err(EntitlementError::InvalidSettlement(
                    "usage does not match the decision".into(),
                ))
            }
        };

        let marker = SettlementRecord {
            action_id: action_id.to_string(),
            user_id: decision.user_id.clone(),
            character_id: decision.character_id.clone(),
            tier: decision.entitlement.label().to_string(),
            month_key: String::new(),
            messages,
            call_minutes,
            unbilled_overage_minutes: 0.0,
            settled_at: 0,
        };

        let outcome = self
            .ledger
            .apply(&decision.user_id, &decision.character_id, delta, Some(marker))
            .await?;

        match outcome {
            UsageWriteOutcome::Applied(applied) => {
                if applied.overage_minutes > 0.0 {
                    warn!(
                        "Call {} for {}/{} ran {:.2} minutes past the included pool; left unbilled",
                        action_id, decision.user_id, decision.character_id, applied.overage_minutes
                    );
                }
                info!(
                    "Settled {} for {}/{} as {}",
                    action_id,
                    decision.user_id,
                    decision.character_id,
                    decision.entitlement.label()
                );
                Ok(SettlementReceipt::Applied {
                    action_id: action_id.to_string(),
                    usage: UsageSnapshot {
                        messages_sent: applied.usage.messages_sent,
                        call_minutes_used: applied.usage.call_minutes_used,
                    },
                    included_minutes_remaining: applied.included_minutes_remaining,
                    unbilled_overage_minutes: applied.overage_minutes,
                })
            }
            UsageWriteOutcome::Duplicate(existing) => {
                if existing.user_id != decision.user_id || existing.character_id != decision.character_id {
                    warn!(
                        "Action id {} already settled for {}/{}; ignoring settle for {}/{}",
                        action_id,
                        existing.user_id,
                        existing.character_id,
                        decision.user_id,
                        decision.character_id
                    );
                } else {
                    info!("Action {} already settled at {}", action_id, existing.settled_at);
                }
                Ok(SettlementReceipt::AlreadySettled {
                    action_id: existing.action_id,
                    settled_at: existing.settled_at,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::types::{ChatTier, BLOCKED_MESSAGE};
    use crate::db::{CharacterPolicyRecord, SubscriptionStatus};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    struct Harness {
        _dir: tempfile::TempDir,
        db: Arc<EntitlementDb>,
        now: Arc<Mutex<DateTime<Utc>>>,
        gate: AccessGate,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(EntitlementDb::open(Some(&dir.path().join("gate.redb"))).unwrap());
        let now = Arc::new(Mutex::new(start()));
        let source = now.clone();
        let clock = MonthClock::with_now(9, Arc::new(move || *source.lock().unwrap())).unwrap();
        let gate = AccessGate::with_stores(
            StoreSet::from_db(db.clone()),
            clock,
            &EntitlementConfig::default(),
        );
        Harness { _dir: dir, db, now, gate }
    }

    fn register(db: &EntitlementDb, user_id: &str, age_days: i64) {
        db.store_account(&AccountRecord {
            user_id: user_id.into(),
            created_at: (start() - chrono::Duration::days(age_days)).timestamp(),
        })
        .unwrap();
    }

    fn subscribe(db: &EntitlementDb, minutes: f64) {
        db.store_subscription(&SubscriptionRecord {
            user_id: "u1".into(),
            character_id: "c1".into(),
            status: SubscriptionStatus::Active,
            included_minutes_remaining: minutes,
            updated_at: 0,
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_new_account_gets_grace_period() {
        let h = harness();
        register(&h.db, "u1", 1);
        for _ in 0..50 {
            h.gate.ledger().increment_messages("u1", "c1", 1).await.unwrap();
        }
        let decision = h.gate.check_chat("u1", "c1").await.unwrap();
        assert_eq!(decision.entitlement.label(), "GRACE_PERIOD");
        assert_eq!(decision.month_key, "2026-10");
    }

    #[tokio::test]
    async fn test_grace_period_ends_after_three_days() {
        let h = harness();
        register(&h.db, "u1", 3);
        let decision = h.gate.check_chat("u1", "c1").await.unwrap();
        assert_eq!(decision.entitlement.label(), "FREE");
    }

    #[tokio::test]
    async fn test_unknown_account_has_no_grace() {
        let h = harness();
        let decision = h.gate.check_chat("ghost", "c1").await.unwrap();
        assert_eq!(decision.entitlement.label(), "FREE");
    }

    #[tokio::test]
    async fn test_policy_override_applies() {
        let h = harness();
        register(&h.db, "u1", 30);
        h.db.store_policy(&CharacterPolicyRecord {
            character_id: "c1".into(),
            free_message_limit: Some(2),
            chat_coin_cost: Some(4),
            ..Default::default()
        })
        .unwrap();
        h.db.set_coin_balance("u1", 4).unwrap();
        h.gate.ledger().increment_messages("u1", "c1", 2).await.unwrap();

        let decision = h.gate.check_chat("u1", "c1").await.unwrap();
        assert_eq!(
            decision.entitlement,
            Entitlement::Chat(ChatTier::CoinRequired { coin_cost: 4 })
        );
    }

    #[tokio::test]
    async fn test_inactive_subscription_is_ignored() {
        let h = harness();
        register(&h.db, "u1", 30);
        h.db.store_subscription(&SubscriptionRecord {
            user_id: "u1".into(),
            character_id: "c1".into(),
            status: SubscriptionStatus::Expired,
            included_minutes_remaining: 60.0,
            updated_at: 0,
        })
        .unwrap();
        h.gate.ledger().increment_call_minutes("u1", "c1", 5.0).await.unwrap();

        let decision = h.gate.check_call("u1", "c1").await.unwrap();
        assert_eq!(
            decision.entitlement,
            Entitlement::Call(CallEntitlement {
                tier: CallTier::Blocked,
                is_fanclub: false
            })
        );
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let h = harness();
        register(&h.db, "u1", 30);
        let decision = h.gate.check_chat("u1", "c1").await.unwrap();

        let first = h.gate.settle(&decision, "msg-1", ActualUsage::Messages(1)).await.unwrap();
        assert!(matches!(first, SettlementReceipt::Applied { .. }));
        let second = h.gate.settle(&decision, "msg-1", ActualUsage::Messages(1)).await.unwrap();
        assert!(matches!(second, SettlementReceipt::AlreadySettled { .. }));

        assert_eq!(h.gate.ledger().read("u1", "c1").await.unwrap().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_blocked_cannot_be_settled() {
        let h = harness();
        register(&h.db, "u1", 30);
        h.gate.ledger().increment_messages("u1", "c1", 10).await.unwrap();
        let decision = h.gate.check_chat("u1", "c1").await.unwrap();
        assert!(!decision.is_authorized());

        let err = h.gate.settle(&decision, "msg-x", ActualUsage::Messages(1)).await.unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidSettlement(_)));
        assert_eq!(h.gate.ledger().read("u1", "c1").await.unwrap().messages_sent, 10);
    }

    #[tokio::test]
    async fn test_mismatched_usage_rejected() {
        let h = harness();
        let decision = h.gate.check_chat("u1", "c1").await.unwrap();
        let err = h.gate.settle(&decision, "a", ActualUsage::CallMinutes(2.0)).await.unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidSettlement(_)));
    }

    #[tokio::test]
    async fn test_zero_minute_call_is_noop() {
        let h = harness();
        let decision = h.gate.check_call("u1", "c1").await.unwrap();
        let receipt = h.gate.settle(&decision, "call-0", ActualUsage::CallMinutes(0.0)).await.unwrap();
        assert_eq!(receipt, SettlementReceipt::NoOp);
        assert!(h.db.get_usage("u1", "c1").unwrap().is_none());
        assert!(h.db.get_settlement("call-0").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_free_call_settles_against_quota() {
        let h = harness();
        let decision = h.gate.check_call("u1", "c1").await.unwrap();
        assert_eq!(decision.entitlement.label(), "FREE");

        // Runs past the free allotment; settled once against the free tier
        h.gate.settle(&decision, "call-1", ActualUsage::CallMinutes(7.0)).await.unwrap();
        let usage = h.gate.ledger().read("u1", "c1").await.unwrap();
        assert_eq!(usage.call_minutes_used, 7.0);

        let next = h.gate.check_call("u1", "c1").await.unwrap();
        assert_eq!(next.entitlement.label(), "BLOCKED");
    }

    #[tokio::test]
    async fn test_fanclub_call_drains_pool_not_quota() {
        let h = harness();
        subscribe(&h.db, 3.0);
        let decision = h.gate.check_call("u1", "c1").await.unwrap();
        assert_eq!(decision.entitlement.label(), "FC_INCLUDED");

        let receipt = h.gate.settle(&decision, "call-fc", ActualUsage::CallMinutes(5.0)).await.unwrap();
        match receipt {
            SettlementReceipt::Applied {
                included_minutes_remaining,
                unbilled_overage_minutes,
                usage,
                ..
            } => {
                assert_eq!(included_minutes_remaining, Some(0.0));
                assert_eq!(unbilled_overage_minutes, 2.0);
                assert_eq!(usage.call_minutes_used, 0.0);
            }
            other => panic!("expected applied, got {:?}", other),
        }
        assert_eq!(
            h.db.get_subscription("u1", "c1").unwrap().unwrap().included_minutes_remaining,
            0.0
        );
    }

    #[tokio::test]
    async fn test_fanclub_overage_call_leaves_quota_untouched() {
        let h = harness();
        subscribe(&h.db, 0.0);
        h.db.set_coin_balance("u1", 150).unwrap();
        let decision = h.gate.check_call("u1", "c1").await.unwrap();
        assert_eq!(decision.entitlement.coin_cost(), Some(100));

        h.gate.settle(&decision, "call-ov", ActualUsage::CallMinutes(4.0)).await.unwrap();
        assert_eq!(h.gate.ledger().read("u1", "c1").await.unwrap().call_minutes_used, 0.0);
        let marker = h.db.get_settlement("call-ov").unwrap().unwrap();
        assert_eq!(marker.tier, "COIN_REQUIRED");
        assert_eq!(marker.call_minutes, 4.0);
        assert_eq!(marker.month_key, "2026-10");
    }

    #[tokio::test]
    async fn test_usage_resets_on_new_month() {
        let h = harness();
        register(&h.db, "u1", 30);
        h.gate.ledger().increment_messages("u1", "c1", 10).await.unwrap();
        assert_eq!(h.gate.check_chat("u1", "c1").await.unwrap().entitlement.label(), "BLOCKED");

        *h.now.lock().unwrap() = Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap();
        let decision = h.gate.check_chat("u1", "c1").await.unwrap();
        assert_eq!(decision.entitlement.label(), "FREE");
        assert_eq!(decision.month_key, "2026-11");
        assert_eq!(decision.usage, UsageSnapshot::default());
    }

    #[tokio::test]
    async fn test_empty_action_id_rejected() {
        let h = harness();
        let decision = h.gate.check_chat("u1", "c1").await.unwrap();
        let err = h.gate.settle(&decision, "  ", ActualUsage::Messages(1)).await.unwrap_err();
        assert!(matches!(err, EntitlementError::InvalidRequest(_)));
    }

    /// Stores with scripted failures; everything else is healthy and empty
    #[derive(Default)]
    struct ScriptedStores {
        usage_fails: bool,
        subscription_fails: bool,
        coins_fail: bool,
        account_fails: bool,
        slow: bool,
        coins: u64,
        messages_sent: u32,
    }

    impl ScriptedStores {
        async fn respond<T>(&self, fail: bool, value: T) -> EntitlementResult<T> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if fail {
                return Err(EntitlementError::StorageUnavailable("connection refused".into()));
            }
            Ok(value)
        }
    }

    #[async_trait::async_trait]
    impl PolicySource for ScriptedStores {
        async fn load_policy(&self, _character_id: &str) -> EntitlementResult<Option<CharacterPolicyRecord>> {
            Ok(None)
        }
    }

    #[async_trait::async_trait]
    impl UsageStore for ScriptedStores {
        async fn load_usage(&self, user_id: &str, character_id: &str) -> EntitlementResult<Option<crate::db::UsageRecord>> {
            let mut record = crate::db::UsageRecord::new(
                user_id,
                character_id,
                &crate::ledger::MonthKey::parse("2026-10").unwrap(),
                0,
            );
            record.messages_sent = self.messages_sent;
            self.respond(self.usage_fails, Some(record)).await
        }

        async fn apply_usage(&self, _write: crate::stores::UsageWrite) -> EntitlementResult<UsageWriteOutcome> {
            Err(EntitlementError::StorageUnavailable("read-only".into()))
        }
    }

    #[async_trait::async_trait]
    impl SubscriptionStore for ScriptedStores {
        async fn load_subscription(&self, user_id: &str, character_id: &str) -> EntitlementResult<Option<SubscriptionRecord>> {
            let sub = SubscriptionRecord {
                user_id: user_id.into(),
                character_id: character_id.into(),
                status: SubscriptionStatus::Active,
                included_minutes_remaining: 30.0,
                updated_at: 0,
            };
            self.respond(self.subscription_fails, Some(sub)).await
        }
    }

    #[async_trait::async_trait]
    impl CoinBalanceStore for ScriptedStores {
        async fn load_balance(&self, _user_id: &str) -> EntitlementResult<u64> {
            self.respond(self.coins_fail, self.coins).await
        }
    }

    #[async_trait::async_trait]
    impl AccountDirectory for ScriptedStores {
        async fn load_account(&self, user_id: &str) -> EntitlementResult<Option<AccountRecord>> {
            let account = AccountRecord {
                user_id: user_id.into(),
                created_at: start().timestamp(),
            };
            self.respond(self.account_fails, Some(account)).await
        }
    }

    fn scripted_gate(stores: ScriptedStores) -> AccessGate {
        let stores = Arc::new(stores);
        let clock = MonthClock::with_now(9, Arc::new(start)).unwrap();
        let config = EntitlementConfig {
            lookup_timeout_ms: 50,
            ..EntitlementConfig::default()
        };
        AccessGate::with_stores(
            StoreSet {
                policies: stores.clone(),
                usage: stores.clone(),
                subscriptions: stores.clone(),
                coins: stores.clone(),
                accounts: stores,
            },
            clock,
            &config,
        )
    }

    #[tokio::test]
    async fn test_healthy_scripted_stores() {
        let gate = scripted_gate(ScriptedStores::default());
        let decision = gate.check_chat("u1", "c1").await.unwrap();
        assert_eq!(decision.entitlement.label(), "GRACE_PERIOD");
    }

    #[tokio::test]
    async fn test_failed_lookups_fail_closed() {
        let gate = scripted_gate(ScriptedStores {
            subscription_fails: true,
            account_fails: true,
            coins_fail: true,
            coins: 1000,
            messages_sent: 10,
            ..Default::default()
        });
        let chat = gate.check_chat("u1", "c1").await.unwrap();
        assert_eq!(chat.entitlement.label(), "BLOCKED");
        assert_eq!(chat.upgrade_prompt().as_deref(), Some(BLOCKED_MESSAGE));
    }

    #[tokio::test]
    async fn test_failed_usage_read_fails_open() {
        let gate = scripted_gate(ScriptedStores {
            usage_fails: true,
            subscription_fails: true,
            account_fails: true,
            messages_sent: 10,
            ..Default::default()
        });
        let chat = gate.check_chat("u1", "c1").await.unwrap();
        assert_eq!(
            chat.entitlement,
            Entitlement::Chat(ChatTier::Free {
                messages_used: 0,
                messages_remaining: 10
            })
        );
    }

    #[tokio::test]
    async fn test_slow_lookups_time_out_closed() {
        let gate = scripted_gate(ScriptedStores {
            slow: true,
            coins: 1000,
            ..Default::default()
        });
        let started = std::time::Instant::now();
        let call = gate.check_call("u1", "c1").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        // No subscription, no coins, zero usage: the free allowance remains
        assert_eq!(
            call.entitlement,
            Entitlement::Call(CallEntitlement {
                tier: CallTier::Free {
                    minutes_remaining: 5.0
                },
                is_fanclub: false
            })
        );
    }

    #[tokio::test]
    async fn test_settle_surfaces_storage_errors() {
        let gate = scripted_gate(ScriptedStores::default());
        let decision = gate.check_chat("u1", "c1").await.unwrap();
        let err = gate.settle(&decision, "msg-1", ActualUsage::Messages(1)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
