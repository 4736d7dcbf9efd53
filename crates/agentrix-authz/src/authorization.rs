//! Authorization (grant) records
//!
//! A grant is a scoped, time-boxed permission for one agent (or every agent
//! of the user) to spend on the user's behalf.

use agentrix_types::{AgentId, AgentrixError, AuthorizationId, MerchantId, Result, UserId};
use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::usage::{day_window, month_window};

/// Lifecycle of a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Active,
    Revoked,
    Expired,
    /// Temporarily disabled by the owner; can be reactivated
    Suspended,
}

impl AuthorizationStatus {
    /// Revoked and expired grants never come back
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Revoked | Self::Expired)
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
            Self::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Which allowance a limit applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    SingleTransaction,
    Daily,
    Monthly,
    Total,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SingleTransaction => "single-transaction",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
            Self::Total => "total",
        };
        f.write_str(s)
    }
}

/// A spending grant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    pub id: AuthorizationId,
    /// Owning user
    pub user_id: UserId,
    /// Agent the grant is for; `None` covers every agent of the user
    pub agent_id: Option<AgentId>,
    pub description: Option<String>,
    /// Merchant allow-list; `None` or empty allows any merchant
    pub merchant_scope: Option<Vec<MerchantId>>,
    /// Category allow-list; `None` or empty allows any category
    pub category_scope: Option<Vec<String>>,
    pub single_tx_limit: Option<Decimal>,
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    /// Lifetime cap
    pub total_limit: Option<Decimal>,
    pub status: AuthorizationStatus,
    /// Derived from an auto-pay setting rather than created by hand
    pub auto_pay: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub used_today: Decimal,
    pub used_this_month: Decimal,
    pub total_used: Decimal,
    pub last_daily_reset: DateTime<Utc>,
    pub last_monthly_reset: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Authorization {
    /// Whether this grant covers payments by `agent` for `user`
    pub fn applies_to(&self, user: &UserId, agent: &AgentId) -> bool {
        &self.user_id == user && self.agent_id.as_ref().map_or(true, |a| a == agent)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |exp| exp <= now)
    }

    pub fn merchant_in_scope(&self, merchant: &MerchantId) -> bool {
        match &self.merchant_scope {
            Some(scope) if !scope.is_empty() => scope.contains(merchant),
            _ => true,
        }
    }

    /// Category scope only applies when a category was supplied
    pub fn category_in_scope(&self, category: Option<&str>) -> bool {
        match (category, &self.category_scope) {
            (Some(category), Some(scope)) if !scope.is_empty() => {
                scope.iter().any(|c| c == category)
            }
            _ => true,
        }
    }

    /// Zero the daily / monthly counters whose watermark lies in an earlier window
    ///
    /// The new watermark is the start of the current window, so it is never
    /// after `now`.
    pub fn roll_windows(&mut self, now: DateTime<Utc>, offset: FixedOffset) -> bool {
        let mut rolled = false;

        let day = day_window(now, offset);
        if self.last_daily_reset < day.start {
            self.used_today = Decimal::ZERO;
            self.last_daily_reset = day.start;
            rolled = true;
        }

        let month = month_window(now, offset);
        if self.last_monthly_reset < month.start {
            self.used_this_month = Decimal::ZERO;
            self.last_monthly_reset = month.start;
            rolled = true;
        }

        rolled
    }

    /// Check-and-increment for an executed payment
    ///
    /// Either every counter moves or none does.
    pub fn apply_usage(&mut self, amount: Decimal, now: DateTime<Utc>, offset: FixedOffset) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(AgentrixError::invalid_input("amount", "usage must be positive"));
        }
        if self.status != AuthorizationStatus::Active {
            return Err(AgentrixError::invalid_transition(
                "authorization",
                &self.id,
                self.status,
                "record usage on",
            ));
        }

        self.roll_windows(now, offset);

        let single = (LimitKind::SingleTransaction, amount, self.single_tx_limit);
        let daily = (LimitKind::Daily, self.used_today + amount, self.daily_limit);
        let monthly = (LimitKind::Monthly, self.used_this_month + amount, self.monthly_limit);
        let total = (LimitKind::Total, self.total_used + amount, self.total_limit);

        for (kind, attempted, limit) in [single, daily, monthly, total] {
            if let Some(limit) = limit {
                if attempted > limit {
                    return Err(AgentrixError::LimitExceeded {
                        authorization_id: self.id.to_string(),
                        limit: kind.to_string(),
                        attempted: attempted.to_string(),
                        allowed: limit.to_string(),
                    });
                }
            }
        }

        self.used_today += amount;
        self.used_this_month += amount;
        self.total_used += amount;
        self.updated_at = now;
        Ok(())
    }

    /// Give back usage recorded at `charged_at` for a payment that did not go through
    ///
    /// Window counters are only reduced while `charged_at` is still in the
    /// current window; a rolled counter no longer holds the amount.
    pub fn reverse_usage(
        &mut self,
        amount: Decimal,
        charged_at: DateTime<Utc>,
        now: DateTime<Utc>,
        offset: FixedOffset,
    ) {
        self.roll_windows(now, offset);
        if day_window(now, offset).contains(charged_at) {
            self.used_today = (self.used_today - amount).max(Decimal::ZERO);
        }
        if month_window(now, offset).contains(charged_at) {
            self.used_this_month = (self.used_this_month - amount).max(Decimal::ZERO);
        }
        self.total_used = (self.total_used - amount).max(Decimal::ZERO);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn grant(now: DateTime<Utc>) -> Authorization {
        Authorization {
            id: AuthorizationId::new(),
            user_id: UserId::from_raw("u1"),
            agent_id: Some(AgentId::from_raw("a1")),
            description: None,
            merchant_scope: Some(vec![MerchantId::from_raw("m1")]),
            category_scope: Some(vec!["travel".to_string()]),
            single_tx_limit: Some(dec!(100)),
            daily_limit: Some(dec!(300)),
            monthly_limit: Some(dec!(1000)),
            total_limit: None,
            status: AuthorizationStatus::Active,
            auto_pay: false,
            expires_at: Some(now + Duration::days(1)),
            used_today: Decimal::ZERO,
            used_this_month: Decimal::ZERO,
            total_used: Decimal::ZERO,
            last_daily_reset: now,
            last_monthly_reset: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_scope_checks() {
        let g = grant(Utc::now());
        assert!(g.merchant_in_scope(&MerchantId::from_raw("m1")));
        assert!(!g.merchant_in_scope(&MerchantId::from_raw("m2")));
        assert!(g.category_in_scope(None));
        assert!(g.category_in_scope(Some("travel")));
        assert!(!g.category_in_scope(Some("gaming")));
    }

    #[test]
    fn test_agentless_grant_applies_to_every_agent() {
        let mut g = grant(Utc::now());
        g.agent_id = None;
        assert!(g.applies_to(&UserId::from_raw("u1"), &AgentId::from_raw("anything")));
        assert!(!g.applies_to(&UserId::from_raw("u2"), &AgentId::from_raw("anything")));
    }

    #[test]
    fn test_apply_usage_respects_daily_limit() {
        let now = at("2026-03-15T10:00:00Z");
        let mut g = grant(now);
        g.apply_usage(dec!(100), now, utc()).unwrap();
        g.apply_usage(dec!(100), now, utc()).unwrap();
        g.apply_usage(dec!(100), now, utc()).unwrap();

        let err = g.apply_usage(dec!(1), now, utc()).unwrap_err();
        assert_eq!(err.error_code(), "LIMIT_EXCEEDED");
        assert_eq!(g.used_today, dec!(300));
        assert_eq!(g.total_used, dec!(300));
    }

    #[test]
    fn test_apply_usage_rejects_over_single_limit_without_side_effects() {
        let now = at("2026-03-15T10:00:00Z");
        let mut g = grant(now);
        assert!(g.apply_usage(dec!(150), now, utc()).is_err());
        assert_eq!(g.used_today, Decimal::ZERO);
    }

    #[test]
    fn test_daily_counter_rolls_at_midnight() {
        let day1 = at("2026-03-15T22:00:00Z");
        let mut g = grant(day1);
        g.apply_usage(dec!(100), day1, utc()).unwrap();
        g.apply_usage(dec!(100), day1, utc()).unwrap();

        let day2 = at("2026-03-16T01:00:00Z");
        g.apply_usage(dec!(100), day2, utc()).unwrap();
        assert_eq!(g.used_today, dec!(100));
        assert_eq!(g.used_this_month, dec!(300));
        assert_eq!(g.last_daily_reset, at("2026-03-16T00:00:00Z"));
        assert!(g.last_daily_reset <= day2);
    }

    #[test]
    fn test_suspended_grant_cannot_record_usage() {
        let now = Utc::now();
        let mut g = grant(now);
        g.status = AuthorizationStatus::Suspended;
        let err = g.apply_usage(dec!(1), now, utc()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE_TRANSITION");
    }

    #[test]
    fn test_reverse_usage_only_touches_current_windows() {
        let day1 = at("2026-03-15T22:00:00Z");
        let mut g = grant(day1);
        g.apply_usage(dec!(80), day1, utc()).unwrap();
        g.reverse_usage(dec!(80), day1, day1, utc());
        assert_eq!(g.used_today, Decimal::ZERO);
        assert_eq!(g.total_used, Decimal::ZERO);

        g.apply_usage(dec!(50), day1, utc()).unwrap();
        let day2 = at("2026-03-16T01:00:00Z");
        g.apply_usage(dec!(20), day2, utc()).unwrap();
        g.reverse_usage(dec!(50), day1, day2, utc());
        assert_eq!(g.used_today, dec!(20));
        assert_eq!(g.used_this_month, dec!(20));
        assert_eq!(g.total_used, dec!(20));
    }
}
