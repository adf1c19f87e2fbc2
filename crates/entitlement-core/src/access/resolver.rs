//! ============================================================================
//! Entitlement Resolver - Pure tier decisions for chat and calls
//! ============================================================================
//! No I/O here. The gate gathers inputs; these functions apply the fixed
//! precedence. First matching rule wins.
//! ============================================================================

use serde::{Deserialize, Serialize};

use super::types::{CallEntitlement, CallTier, CharacterPolicy, ChatTier};

/// Everything the chat decision depends on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChatInputs {
    pub in_grace_period: bool,
    pub subscription_active: bool,
    pub messages_sent: u32,
    pub free_message_limit: u32,
    pub coin_balance: u64,
    pub chat_coin_cost: u64,
}

impl ChatInputs {
    pub fn new(
        policy: &CharacterPolicy,
        in_grace_period: bool,
        subscription_active: bool,
        messages_sent: u32,
        coin_balance: u64,
    ) -> Self {
        Self {
            in_grace_period,
            subscription_active,
            messages_sent,
            free_message_limit: policy.free_message_limit,
            coin_balance,
            chat_coin_cost: policy.chat_coin_cost,
        }
    }
}

/// Everything the call decision depends on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CallInputs {
    pub subscription_active: bool,
    pub included_minutes_remaining: f64,
    pub call_minutes_used: f64,
    pub free_call_minutes: u32,
    pub coin_balance: u64,
    pub call_coin_per_minute: u64,
    pub fc_overage_call_coin_per_minute: u64,
}

impl CallInputs {
    pub fn new(
        policy: &CharacterPolicy,
        subscription_active: bool,
        included_minutes_remaining: f64,
        call_minutes_used: f64,
        coin_balance: u64,
    ) -> Self {
        Self {
            subscription_active,
            included_minutes_remaining,
            call_minutes_used,
            free_call_minutes: policy.free_call_minutes,
            coin_balance,
            call_coin_per_minute: policy.call_coin_per_minute,
            fc_overage_call_coin_per_minute: policy.fc_overage_call_coin_per_minute,
        }
    }
}

/// Grace period, then subscription, then free quota, then coins.
pub fn resolve_chat(inputs: &ChatInputs) -> ChatTier {
    if inputs.in_grace_period {
        return ChatTier::GracePeriod;
    }
    if inputs.subscription_active {
        return ChatTier::FcUnlimited;
    }
    if inputs.messages_sent < inputs.free_message_limit {
        return ChatTier::Free {
            messages_used: inputs.messages_sent,
            messages_remaining: inputs.free_message_limit - inputs.messages_sent,
        };
    }
    if inputs.coin_balance >= inputs.chat_coin_cost {
        return ChatTier::CoinRequired {
            coin_cost: inputs.chat_coin_cost,
        };
    }
    ChatTier::Blocked
}

/// Subscribers never fall through to the free quota: they use the included
/// pool, then the FC overage rate, then are blocked.
pub fn resolve_call(inputs: &CallInputs) -> CallEntitlement {
    if inputs.subscription_active {
        let tier = if inputs.included_minutes_remaining > 0.0 {
            CallTier::FcIncluded {
                included_minutes_remaining: inputs.included_minutes_remaining,
            }
        } else if inputs.coin_balance >= inputs.fc_overage_call_coin_per_minute {
            CallTier::CoinRequired {
                coin_cost_per_minute: inputs.fc_overage_call_coin_per_minute,
            }
        } else {
            CallTier::Blocked
        };
        return CallEntitlement {
            tier,
            is_fanclub: true,
        };
    }

    let free_minutes = f64::from(inputs.free_call_minutes);
    let tier = if inputs.call_minutes_used < free_minutes {
        CallTier::Free {
            minutes_remaining: free_minutes - inputs.call_minutes_used,
        }
    } else if inputs.coin_balance >= inputs.call_coin_per_minute {
        CallTier::CoinRequired {
            coin_cost_per_minute: inputs.call_coin_per_minute,
        }
    } else {
        CallTier::Blocked
    };

    CallEntitlement {
        tier,
        is_fanclub: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(messages_sent: u32, coin_balance: u64) -> ChatInputs {
        ChatInputs::new(&CharacterPolicy::default(), false, false, messages_sent, coin_balance)
    }

    fn call(subscription_active: bool, included: f64, used: f64, coins: u64) -> CallInputs {
        CallInputs::new(&CharacterPolicy::default(), subscription_active, included, used, coins)
    }

    #[test]
    fn test_grace_period_beats_everything() {
        for (sub, sent, coins) in [(false, 0, 0), (true, 50, 0), (false, 1000, 1000), (false, 10, 0)] {
            let inputs = ChatInputs {
                in_grace_period: true,
                subscription_active: sub,
                ..chat(sent, coins)
            };
            assert_eq!(resolve_chat(&inputs), ChatTier::GracePeriod);
        }
    }

    #[test]
    fn test_subscriber_with_zero_coins_is_unlimited() {
        let inputs = ChatInputs {
            subscription_active: true,
            ..chat(500, 0)
        };
        assert_eq!(resolve_chat(&inputs), ChatTier::FcUnlimited);
    }

    #[test]
    fn test_subscription_dominates_free_quota() {
        let inputs = ChatInputs {
            subscription_active: true,
            ..chat(0, 0)
        };
        assert_eq!(resolve_chat(&inputs), ChatTier::FcUnlimited);
    }

    #[test]
    fn test_free_quota_boundary() {
        assert_eq!(
            resolve_chat(&chat(9, 0)),
            ChatTier::Free {
                messages_used: 9,
                messages_remaining: 1
            }
        );
        assert_ne!(
            resolve_chat(&chat(10, 0)).label(),
            "FREE",
            "at the limit the free tier no longer applies"
        );
        assert_eq!(
            resolve_chat(&chat(0, 0)),
            ChatTier::Free {
                messages_used: 0,
                messages_remaining: 10
            }
        );
    }

    #[test]
    fn test_quota_exhausted_with_coins() {
        // messages 10/10, no subscription, 15 coins, 10 per message
        assert_eq!(
            resolve_chat(&chat(10, 15)),
            ChatTier::CoinRequired { coin_cost: 10 }
        );
        assert_eq!(
            resolve_chat(&chat(10, 10)),
            ChatTier::CoinRequired { coin_cost: 10 }
        );
    }

    #[test]
    fn test_quota_exhausted_without_enough_coins() {
        assert_eq!(resolve_chat(&chat(10, 5)), ChatTier::Blocked);
        assert_eq!(resolve_chat(&chat(11, 9)), ChatTier::Blocked);
    }

    #[test]
    fn test_zero_free_limit_goes_straight_to_coins() {
        let inputs = ChatInputs {
            free_message_limit: 0,
            ..chat(0, 100)
        };
        assert_eq!(resolve_chat(&inputs), ChatTier::CoinRequired { coin_cost: 10 });
    }

    #[test]
    fn test_chat_resolver_is_total_and_deterministic() {
        for grace in [false, true] {
            for sub in [false, true] {
                for sent in [0, 9, 10, 11] {
                    for coins in [0, 9, 10, 1000] {
                        let inputs = ChatInputs {
                            in_grace_period: grace,
                            subscription_active: sub,
                            ..chat(sent, coins)
                        };
                        let first = resolve_chat(&inputs);
                        assert_eq!(first, resolve_chat(&inputs));
                        let expected = if grace {
                            "GRACE_PERIOD"
                        } else if sub {
                            "FC_UNLIMITED"
                        } else if sent < 10 {
                            "FREE"
                        } else if coins >= 10 {
                            "COIN_REQUIRED"
                        } else {
                            "BLOCKED"
                        };
                        assert_eq!(first.label(), expected, "inputs: {:?}", inputs);
                    }
                }
            }
        }
    }

    #[test]
    fn test_fanclub_included_minutes() {
        let result = resolve_call(&call(true, 3.0, 100.0, 0));
        assert_eq!(
            result,
            CallEntitlement {
                tier: CallTier::FcIncluded {
                    included_minutes_remaining: 3.0
                },
                is_fanclub: true
            }
        );
    }

    #[test]
    fn test_fanclub_pool_exhausted_pays_overage_rate() {
        // pool empty, 150 coins, overage rate 100
        let result = resolve_call(&call(true, 0.0, 0.0, 150));
        assert_eq!(
            result,
            CallEntitlement {
                tier: CallTier::CoinRequired {
                    coin_cost_per_minute: 100
                },
                is_fanclub: true
            }
        );
    }

    #[test]
    fn test_fanclub_pool_exhausted_without_coins_is_blocked() {
        // Free minutes are untouched but subscribers do not fall back to them
        let result = resolve_call(&call(true, 0.0, 0.0, 99));
        assert_eq!(
            result,
            CallEntitlement {
                tier: CallTier::Blocked,
                is_fanclub: true
            }
        );
    }

    #[test]
    fn test_free_call_minutes() {
        let result = resolve_call(&call(false, 0.0, 1.5, 0));
        assert_eq!(
            result,
            CallEntitlement {
                tier: CallTier::Free {
                    minutes_remaining: 3.5
                },
                is_fanclub: false
            }
        );
    }

    #[test]
    fn test_free_call_minutes_exhausted() {
        assert_eq!(
            resolve_call(&call(false, 0.0, 5.0, 200)).tier,
            CallTier::CoinRequired {
                coin_cost_per_minute: 200
            }
        );
        let blocked = resolve_call(&call(false, 0.0, 5.0, 199));
        assert_eq!(blocked.tier, CallTier::Blocked);
        assert!(!blocked.is_fanclub);
    }

    #[test]
    fn test_non_subscriber_ignores_included_pool() {
        // A lapsed subscription may still carry minutes; they do not apply
        let result = resolve_call(&call(false, 30.0, 5.0, 0));
        assert_eq!(result.tier, CallTier::Blocked);
    }
}
