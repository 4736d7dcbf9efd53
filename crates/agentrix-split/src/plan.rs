//! Split plan model

use agentrix_types::{
    AgentrixError, EngineConfig, MicroAmount, PlanId, Result, UserId, BPS_DENOMINATOR,
};
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Plan lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Active,
    Archived,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// Where a rule's share is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitSource {
    /// The distributable pool carved out of net
    Pool,
    /// Platform-funded; also drawn from the distributable pool
    Platform,
    /// The merchant's net amount
    Merchant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitRole {
    Platform,
    Merchant,
    Agent,
    Referrer,
    Executor,
    Custom,
}

/// One recipient of a split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRule {
    pub recipient: String,
    pub share_bps: u32,
    pub role: SplitRole,
    pub source: SplitSource,
    pub active: bool,
}

impl SplitRule {
    pub fn new(recipient: impl Into<String>, share_bps: u32, role: SplitRole, source: SplitSource) -> Self {
        Self {
            recipient: recipient.into(),
            share_bps,
            role,
            source,
            active: true,
        }
    }
}

/// Fee schedule in basis points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfig {
    pub onramp_fee_bps: u32,
    pub offramp_fee_bps: u32,
    pub split_fee_bps: u32,
    pub min_split_fee: MicroAmount,
}

impl FeeConfig {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            onramp_fee_bps: config.onramp_fee_bps,
            offramp_fee_bps: config.offramp_fee_bps,
            split_fee_bps: config.split_fee_bps,
            min_split_fee: config.min_split_fee,
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Volume-based split fee override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub min_amount: MicroAmount,
    pub adjusted_bps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumePeriod {
    Daily,
    Weekly,
    Monthly,
}

impl VolumePeriod {
    /// Start (UTC) of the period containing `now`
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let first_day = match self {
            Self::Daily => today,
            Self::Weekly => today - Duration::days(today.weekday().num_days_from_monday() as i64),
            Self::Monthly => today.with_day(1).unwrap_or(today),
        };
        Utc.from_utc_datetime(&first_day.and_time(NaiveTime::MIN))
    }
}

/// Cap on the volume a plan may split per period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCap {
    pub max_volume: MicroAmount,
    pub period: VolumePeriod,
}

/// Kind of product a plan applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Skill,
    Physical,
    Service,
    Digital,
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skill => "skill",
            Self::Physical => "physical",
            Self::Service => "service",
            Self::Digital => "digital",
        };
        f.write_str(s)
    }
}

/// A split/allocation plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPlan {
    pub id: PlanId,
    pub owner_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub product_type: ProductType,
    pub rules: Vec<SplitRule>,
    pub fee_config: FeeConfig,
    pub tiers: Vec<Tier>,
    pub volume_cap: Option<VolumeCap>,
    pub status: PlanStatus,
    pub is_system_template: bool,
    pub version: u32,
    /// Number of settlements that used this plan
    pub usage_count: u64,
    /// Volume split in the current cap period
    pub period_volume: MicroAmount,
    pub period_started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SplitPlan {
    pub fn active_rules(&self) -> impl Iterator<Item = &SplitRule> {
        self.rules.iter().filter(|r| r.active)
    }

    pub fn has_active_rules(&self) -> bool {
        self.active_rules().next().is_some()
    }

    /// Sum of active shares
    pub fn active_share_bps(&self) -> u64 {
        self.active_rules().map(|r| r.share_bps as u64).sum()
    }

    /// Split fee rate for `amount`: the tier with the highest qualifying minimum wins
    pub fn split_fee_bps_for(&self, amount: MicroAmount) -> u32 {
        self.tiers
            .iter()
            .filter(|t| t.min_amount <= amount)
            .max_by_key(|t| t.min_amount)
            .map(|t| t.adjusted_bps)
            .unwrap_or(self.fee_config.split_fee_bps)
    }

    /// Volume already used in the period containing `now`
    pub fn volume_in_period(&self, now: DateTime<Utc>) -> MicroAmount {
        match &self.volume_cap {
            Some(cap) if self.period_started_at >= cap.period.start(now) => self.period_volume,
            _ => MicroAmount::ZERO,
        }
    }

    /// Ready to be activated: at least one active rule and at most 100% shared
    pub fn ensure_activatable(&self) -> Result<()> {
        if !self.has_active_rules() {
            return Err(AgentrixError::invalid_transition(
                "split plan",
                &self.id,
                format!("{} (no active rules)", self.status),
                "activate",
            ));
        }
        let total = self.active_share_bps();
        if total > BPS_DENOMINATOR as u64 {
            return Err(AgentrixError::PlanSharesExceeded {
                plan_id: self.id.to_string(),
                total_bps: u32::try_from(total).unwrap_or(u32::MAX),
            });
        }
        Ok(())
    }
}

/// Shape checks that apply to every rule set, active or not
pub fn validate_rules(rules: &[SplitRule]) -> Result<()> {
    for (idx, rule) in rules.iter().enumerate() {
        if rule.recipient.trim().is_empty() {
            return Err(AgentrixError::invalid_input(
                format!("rules[{}].recipient", idx),
                "must not be empty",
            ));
        }
        if rule.share_bps > BPS_DENOMINATOR {
            return Err(AgentrixError::invalid_input(
                format!("rules[{}].share_bps", idx),
                format!("{} exceeds {}", rule.share_bps, BPS_DENOMINATOR),
            ));
        }
    }
    Ok(())
}

pub fn validate_fee_config(fees: &FeeConfig, tiers: &[Tier]) -> Result<()> {
    let rates = [
        ("fee_config.onramp_fee_bps", fees.onramp_fee_bps),
        ("fee_config.offramp_fee_bps", fees.offramp_fee_bps),
        ("fee_config.split_fee_bps", fees.split_fee_bps),
    ];
    for (field, bps) in rates {
        if bps > BPS_DENOMINATOR {
            return Err(AgentrixError::invalid_input(field, format!("{} exceeds {}", bps, BPS_DENOMINATOR)));
        }
    }
    for tier in tiers {
        if tier.adjusted_bps > BPS_DENOMINATOR {
            return Err(AgentrixError::invalid_input(
                "tiers.adjusted_bps",
                format!("{} exceeds {}", tier.adjusted_bps, BPS_DENOMINATOR),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(rules: Vec<SplitRule>) -> SplitPlan {
        let now = Utc::now();
        SplitPlan {
            id: PlanId::new(),
            owner_id: UserId::from_raw("owner"),
            name: "test".to_string(),
            description: None,
            product_type: ProductType::Skill,
            rules,
            fee_config: FeeConfig::default(),
            tiers: Vec::new(),
            volume_cap: None,
            status: PlanStatus::Draft,
            is_system_template: false,
            version: 1,
            usage_count: 0,
            period_volume: MicroAmount::ZERO,
            period_started_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_default_fee_schedule() {
        let fees = FeeConfig::default();
        assert_eq!(fees.onramp_fee_bps, 10);
        assert_eq!(fees.offramp_fee_bps, 10);
        assert_eq!(fees.split_fee_bps, 30);
        assert_eq!(fees.min_split_fee, MicroAmount(100_000));
    }

    #[test]
    fn test_activation_rejects_over_full_shares() {
        let p = plan(vec![
            SplitRule::new("a", 6000, SplitRole::Agent, SplitSource::Pool),
            SplitRule::new("b", 5000, SplitRole::Referrer, SplitSource::Pool),
        ]);
        let err = p.ensure_activatable().unwrap_err();
        assert_eq!(err.error_code(), "PLAN_SHARES_EXCEEDED");
    }

    #[test]
    fn test_inactive_rules_do_not_count() {
        let mut extra = SplitRule::new("b", 5000, SplitRole::Referrer, SplitSource::Pool);
        extra.active = false;
        let p = plan(vec![SplitRule::new("a", 6000, SplitRole::Agent, SplitSource::Pool), extra]);
        assert_eq!(p.active_share_bps(), 6000);
        assert!(p.ensure_activatable().is_ok());
    }

    #[test]
    fn test_activation_requires_rules() {
        let err = plan(Vec::new()).ensure_activatable().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE_TRANSITION");
    }

    #[test]
    fn test_highest_qualifying_tier_wins() {
        let mut p = plan(Vec::new());
        p.tiers = vec![
            Tier { min_amount: MicroAmount(1_000_000), adjusted_bps: 20 },
            Tier { min_amount: MicroAmount(10_000_000), adjusted_bps: 10 },
        ];
        assert_eq!(p.split_fee_bps_for(MicroAmount(500_000)), 30);
        assert_eq!(p.split_fee_bps_for(MicroAmount(2_000_000)), 20);
        assert_eq!(p.split_fee_bps_for(MicroAmount(10_000_000)), 10);
    }

    #[test]
    fn test_week_starts_monday() {
        // 2026-03-15 is a Sunday
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        assert_eq!(
            VolumePeriod::Weekly.start(now),
            Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap()
        );
        assert_eq!(
            VolumePeriod::Monthly.start(now),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_rule_validation() {
        assert!(validate_rules(&[SplitRule::new(" ", 10, SplitRole::Agent, SplitSource::Pool)]).is_err());
        assert!(validate_rules(&[SplitRule::new("a", 10_001, SplitRole::Agent, SplitSource::Pool)]).is_err());
        assert!(validate_rules(&[SplitRule::new("a", 10_000, SplitRole::Agent, SplitSource::Pool)]).is_ok());
    }
}
