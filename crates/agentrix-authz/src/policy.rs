//! Custom spending policies
//!
//! Users attach extra rules on top of their grants. Each rule kind is a
//! tagged variant that implements `PolicyCheck`; the evaluator only ever
//! talks to the trait, so new kinds (or externally supplied checks) plug in
//! without touching the pipeline.

use agentrix_types::{MerchantId, PolicyId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a policy sees about the candidate payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyContext {
    pub amount: Decimal,
    pub merchant_id: MerchantId,
    pub category: Option<String>,
    pub product_id: Option<String>,
    pub channel: Option<String>,
    /// Completed spend in the current local day, before this payment
    pub used_today: Decimal,
    /// Completed spend in the current local month, before this payment
    pub used_this_month: Decimal,
}

/// Result of a single policy check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub passed: bool,
    pub detail: Option<String>,
}

impl PolicyOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            detail: None,
        }
    }

    pub fn pass_with(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: Some(detail.into()),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

/// Uniform capability of every policy kind
pub trait PolicyCheck: Send + Sync {
    /// Stable tag of the policy kind
    fn kind(&self) -> &'static str;

    fn check(&self, ctx: &PolicyContext) -> PolicyOutcome;
}

/// Built-in policy kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyRule {
    /// Cap on one payment
    SingleLimit { limit: Decimal },
    /// Cap on today's spend including this payment
    DailyLimit { limit: Decimal },
    /// Cap on this month's spend including this payment
    MonthlyLimit { limit: Decimal },
    /// Allowed on-chain protocols
    ProtocolWhitelist { protocols: Vec<String> },
    /// Allowed agent actions
    ActionWhitelist { actions: Vec<String> },
    /// Permission to auto-claim airdrops
    AutoClaimAirdrop,
}

fn limit_outcome(what: &str, attempted: Decimal, limit: Decimal) -> PolicyOutcome {
    if attempted > limit {
        PolicyOutcome::fail(format!("{} {} exceeds limit {}", what, attempted, limit))
    } else {
        PolicyOutcome::pass()
    }
}

impl PolicyCheck for PolicyRule {
    fn kind(&self) -> &'static str {
        match self {
            Self::SingleLimit { .. } => "single_limit",
            Self::DailyLimit { .. } => "daily_limit",
            Self::MonthlyLimit { .. } => "monthly_limit",
            Self::ProtocolWhitelist { .. } => "protocol_whitelist",
            Self::ActionWhitelist { .. } => "action_whitelist",
            Self::AutoClaimAirdrop => "auto_claim_airdrop",
        }
    }

    fn check(&self, ctx: &PolicyContext) -> PolicyOutcome {
        match self {
            Self::SingleLimit { limit } => limit_outcome("amount", ctx.amount, *limit),
            Self::DailyLimit { limit } => {
                limit_outcome("daily spend", ctx.used_today + ctx.amount, *limit)
            }
            Self::MonthlyLimit { limit } => {
                limit_outcome("monthly spend", ctx.used_this_month + ctx.amount, *limit)
            }
            // Payments carry no protocol/action context yet
            Self::ProtocolWhitelist { .. } | Self::ActionWhitelist { .. } => {
                PolicyOutcome::pass_with("not enforced for payments")
            }
            Self::AutoClaimAirdrop => PolicyOutcome::pass(),
        }
    }
}

/// A user-owned policy record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPolicy {
    pub id: PolicyId,
    pub user_id: UserId,
    pub name: String,
    pub enabled: bool,
    pub rule: PolicyRule,
    pub created_at: DateTime<Utc>,
}

impl CustomPolicy {
    pub fn new(user_id: UserId, name: impl Into<String>, rule: PolicyRule) -> Self {
        Self {
            id: PolicyId::new(),
            user_id,
            name: name.into(),
            enabled: true,
            rule,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ctx(amount: Decimal, used_today: Decimal) -> PolicyContext {
        PolicyContext {
            amount,
            merchant_id: MerchantId::from_raw("m1"),
            category: None,
            product_id: None,
            channel: None,
            used_today,
            used_this_month: used_today,
        }
    }

    #[test]
    fn test_single_limit() {
        let rule = PolicyRule::SingleLimit { limit: dec!(50) };
        assert!(rule.check(&ctx(dec!(50), dec!(0))).passed);
        assert!(!rule.check(&ctx(dec!(50.01), dec!(0))).passed);
    }

    #[test]
    fn test_daily_limit_includes_prior_usage() {
        let rule = PolicyRule::DailyLimit { limit: dec!(100) };
        assert!(rule.check(&ctx(dec!(40), dec!(60))).passed);
        let outcome = rule.check(&ctx(dec!(41), dec!(60)));
        assert!(!outcome.passed);
        assert!(outcome.detail.unwrap().contains("exceeds limit 100"));
    }

    #[test]
    fn test_whitelists_pass_through() {
        let rule = PolicyRule::ProtocolWhitelist {
            protocols: vec!["uniswap".to_string()],
        };
        assert!(rule.check(&ctx(dec!(1_000_000), dec!(0))).passed);
        assert_eq!(rule.kind(), "protocol_whitelist");
    }

    #[test]
    fn test_rule_serde_is_tagged() {
        let rule = PolicyRule::SingleLimit { limit: dec!(5) };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["type"], "single_limit");
        let back: PolicyRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }
}
