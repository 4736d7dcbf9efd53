//! Fee and allocation arithmetic
//!
//! Everything here is a pure function of its inputs.

use std::collections::HashMap;

use agentrix_types::{AgentrixError, MicroAmount, PlanId, Result, BPS_DENOMINATOR};
use serde::{Deserialize, Serialize};

use crate::plan::{SplitPlan, SplitRole, SplitSource};

/// How the payer's funds arrive and leave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    /// Pure on-chain; no ramp fees
    CryptoDirect,
    Onramp,
    Offramp,
    Mixed,
}

/// Which fees apply to a preview
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationFlags {
    pub onramp: bool,
    pub offramp: bool,
    /// Charge the split fee; `None` charges it when the plan has active rules
    pub split: Option<bool>,
}

impl From<PaymentType> for AllocationFlags {
    fn from(payment_type: PaymentType) -> Self {
        let (onramp, offramp) = match payment_type {
            PaymentType::CryptoDirect => (false, false),
            PaymentType::Onramp => (true, false),
            PaymentType::Offramp => (false, true),
            PaymentType::Mixed => (true, true),
        };
        Self {
            onramp,
            offramp,
            split: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub onramp_fee: MicroAmount,
    pub offramp_fee: MicroAmount,
    pub split_fee: MicroAmount,
    pub total: MicroAmount,
}

/// Rates actually used, for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRates {
    pub onramp_fee_bps: u32,
    pub offramp_fee_bps: u32,
    pub split_fee_bps: u32,
    pub min_split_fee: MicroAmount,
    pub distributable_pool_bps: u32,
}

/// One recipient's cut
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub recipient: String,
    pub role: SplitRole,
    pub source: SplitSource,
    pub share_bps: u32,
    /// The amount the share was taken from
    pub base: MicroAmount,
    pub amount: MicroAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub plan_id: PlanId,
    pub amount: MicroAmount,
    pub fees: FeeBreakdown,
    pub rates: AppliedRates,
    pub net_amount: MicroAmount,
    pub distributable_pool: MicroAmount,
    pub allocations: Vec<AllocationLine>,
    pub merchant_net: MicroAmount,
}

impl AllocationResult {
    pub fn allocated_total(&self) -> MicroAmount {
        self.allocations.iter().map(|a| a.amount).sum()
    }

    /// `fees + allocations + merchant_net == amount`
    pub fn reconciles(&self) -> bool {
        self.fees
            .total
            .checked_add(self.allocated_total())
            .and_then(|v| v.checked_add(self.merchant_net))
            == Some(self.amount)
    }
}

/// Compute fees and allocations of `amount` under `plan`
///
/// `recipients` substitutes template placeholders; unknown placeholders
/// are kept verbatim.
pub fn allocate(
    amount: MicroAmount,
    plan: &SplitPlan,
    flags: AllocationFlags,
    distributable_pool_bps: u32,
    recipients: &HashMap<String, String>,
) -> Result<AllocationResult> {
    if amount.is_zero() {
        return Err(AgentrixError::invalid_input("amount", "must be positive"));
    }
    if distributable_pool_bps > BPS_DENOMINATOR {
        return Err(AgentrixError::invalid_input(
            "distributable_pool_bps",
            format!("{} exceeds {}", distributable_pool_bps, BPS_DENOMINATOR),
        ));
    }

    let fee_config = &plan.fee_config;
    let split_fee_bps = plan.split_fee_bps_for(amount);

    let onramp_fee = if flags.onramp {
        amount.apply_bps(fee_config.onramp_fee_bps)?
    } else {
        MicroAmount::ZERO
    };
    let offramp_fee = if flags.offramp {
        amount.apply_bps(fee_config.offramp_fee_bps)?
    } else {
        MicroAmount::ZERO
    };
    let split_fee = if flags.split.unwrap_or_else(|| plan.has_active_rules()) {
        amount.apply_bps(split_fee_bps)?.max(fee_config.min_split_fee)
    } else {
        MicroAmount::ZERO
    };

    let total_fees = onramp_fee.try_add(offramp_fee)?.try_add(split_fee)?;
    let net_amount = amount
        .checked_sub(total_fees)
        .ok_or_else(|| {
            AgentrixError::invalid_input(
                "amount",
                format!("{} does not cover fees of {}", amount, total_fees),
            )
        })?;
    let distributable_pool = net_amount.apply_bps(distributable_pool_bps)?;

    let mut allocations = Vec::new();
    for rule in plan.active_rules() {
        let base = match rule.source {
            SplitSource::Pool | SplitSource::Platform => distributable_pool,
            SplitSource::Merchant => net_amount,
        };
        allocations.push(AllocationLine {
            recipient: recipients
                .get(&rule.recipient)
                .cloned()
                .unwrap_or_else(|| rule.recipient.clone()),
            role: rule.role,
            source: rule.source,
            share_bps: rule.share_bps,
            base,
            amount: base.apply_bps(rule.share_bps)?,
        });
    }

    let allocated: MicroAmount = allocations.iter().map(|a| a.amount).sum();
    let merchant_net = net_amount.try_sub(allocated)?;

    Ok(AllocationResult {
        plan_id: plan.id.clone(),
        amount,
        fees: FeeBreakdown {
            onramp_fee,
            offramp_fee,
            split_fee,
            total: total_fees,
        },
        rates: AppliedRates {
            onramp_fee_bps: fee_config.onramp_fee_bps,
            offramp_fee_bps: fee_config.offramp_fee_bps,
            split_fee_bps,
            min_split_fee: fee_config.min_split_fee,
            distributable_pool_bps,
        },
        net_amount,
        distributable_pool,
        allocations,
        merchant_net,
    })
}

/// A participant's claim on a payout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareClaim {
    pub recipient: String,
    /// Fixed share; `None` takes an even part of what overrides leave
    pub override_bps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutLine {
    pub recipient: String,
    pub share_bps: u32,
    pub amount: MicroAmount,
}

/// Split `amount` among claimants; lines always sum to `amount`
///
/// Override shares are honored first. The remaining basis points are
/// split evenly among claimants without an override, with the bps
/// remainder and any rounding dust going to the first of them (or to the
/// first line when everyone has an override).
pub fn distribute_by_shares(amount: MicroAmount, claims: &[ShareClaim]) -> Result<Vec<PayoutLine>> {
    if claims.is_empty() {
        return Err(AgentrixError::invalid_input("participants", "at least one required"));
    }

    let overridden: u64 = claims
        .iter()
        .filter_map(|c| c.override_bps)
        .map(u64::from)
        .sum();
    if overridden > BPS_DENOMINATOR as u64 {
        return Err(AgentrixError::invalid_input(
            "participants",
            format!("override shares total {} bps, more than {}", overridden, BPS_DENOMINATOR),
        ));
    }

    let remaining_bps = BPS_DENOMINATOR - overridden as u32;
    let even_count = claims.iter().filter(|c| c.override_bps.is_none()).count() as u32;
    let first_even = claims.iter().position(|c| c.override_bps.is_none());

    let (even_bps, bps_remainder) = if even_count > 0 {
        (remaining_bps / even_count, remaining_bps % even_count)
    } else {
        (0, 0)
    };

    let mut lines = Vec::with_capacity(claims.len());
    for (idx, claim) in claims.iter().enumerate() {
        let share_bps = match claim.override_bps {
            Some(bps) => bps,
            None if Some(idx) == first_even => even_bps + bps_remainder,
            None => even_bps,
        };
        lines.push(PayoutLine {
            recipient: claim.recipient.clone(),
            share_bps,
            amount: amount.apply_bps(share_bps)?,
        });
    }

    let assigned: MicroAmount = lines.iter().map(|l| l.amount).sum();
    let dust = amount.try_sub(assigned)?;
    let dust_idx = first_even.unwrap_or(0);
    lines[dust_idx].amount = lines[dust_idx].amount.try_add(dust)?;

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{FeeConfig, PlanStatus, ProductType, SplitRule};
    use agentrix_types::UserId;
    use chrono::Utc;

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
            status: PlanStatus::Active,
            is_system_template: false,
            version: 1,
            usage_count: 0,
            period_volume: MicroAmount::ZERO,
            period_started_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn split_only() -> AllocationFlags {
        AllocationFlags {
            split: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn test_minimum_split_fee_with_no_rules() {
        let result = allocate(MicroAmount(1_000_000), &plan(Vec::new()), split_only(), 300, &HashMap::new()).unwrap();

        assert_eq!(result.fees.split_fee, MicroAmount(100_000));
        assert_eq!(result.net_amount, MicroAmount(900_000));
        assert!(result.allocations.is_empty());
        assert_eq!(result.merchant_net, MicroAmount(900_000));
        assert!(result.reconciles());
    }

    #[test]
    fn test_ramp_fees_follow_payment_type() {
        let p = plan(Vec::new());
        let mixed = allocate(MicroAmount(10_000_000), &p, PaymentType::Mixed.into(), 300, &HashMap::new()).unwrap();
        assert_eq!(mixed.fees.onramp_fee, MicroAmount(10_000));
        assert_eq!(mixed.fees.offramp_fee, MicroAmount(10_000));
        // No rules and no explicit flag: no split fee
        assert_eq!(mixed.fees.split_fee, MicroAmount::ZERO);

        let direct = allocate(MicroAmount(10_000_000), &p, PaymentType::CryptoDirect.into(), 300, &HashMap::new()).unwrap();
        assert_eq!(direct.fees.total, MicroAmount::ZERO);
        assert_eq!(direct.merchant_net, MicroAmount(10_000_000));
    }

    #[test]
    fn test_pool_and_merchant_sources() {
        let p = plan(vec![
            SplitRule::new("{{executor}}", 7000, SplitRole::Executor, SplitSource::Platform),
            SplitRule::new("{{referrer}}", 3000, SplitRole::Referrer, SplitSource::Pool),
        ]);
        let recipients = HashMap::from([("{{executor}}".to_string(), "alice".to_string())]);
        let result = allocate(MicroAmount(100_000_000), &p, AllocationFlags::default(), 300, &recipients).unwrap();

        // split fee = 0.3% of 100 = 300_000; net = 99_700_000; pool = 2_991_000
        assert_eq!(result.fees.split_fee, MicroAmount(300_000));
        assert_eq!(result.distributable_pool, MicroAmount(2_991_000));
        assert_eq!(result.allocations[0].recipient, "alice");
        assert_eq!(result.allocations[0].amount, MicroAmount(2_093_700));
        assert_eq!(result.allocations[1].recipient, "{{referrer}}");
        assert_eq!(result.allocations[1].amount, MicroAmount(897_300));
        assert!(result.reconciles());
    }

    #[test]
    fn test_merchant_sourced_rule_draws_from_net() {
        let p = plan(vec![SplitRule::new("partner", 5000, SplitRole::Merchant, SplitSource::Merchant)]);
        let result = allocate(MicroAmount(1_000_001), &p, split_only(), 300, &HashMap::new()).unwrap();

        assert_eq!(result.allocations[0].base, result.net_amount);
        assert!(result.reconciles());
    }

    #[test]
    fn test_tier_replaces_split_rate() {
        let mut p = plan(vec![SplitRule::new("a", 100, SplitRole::Agent, SplitSource::Pool)]);
        p.tiers = vec![crate::plan::Tier {
            min_amount: MicroAmount(50_000_000),
            adjusted_bps: 20,
        }];
        let result = allocate(MicroAmount(100_000_000), &p, AllocationFlags::default(), 300, &HashMap::new()).unwrap();
        assert_eq!(result.rates.split_fee_bps, 20);
        assert_eq!(result.fees.split_fee, MicroAmount(200_000));
    }

    #[test]
    fn test_amount_below_fees_is_rejected() {
        let err = allocate(MicroAmount(50_000), &plan(Vec::new()), split_only(), 300, &HashMap::new()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[test]
    fn test_reconciliation_holds_across_amounts() {
        let p = plan(vec![
            SplitRule::new("a", 3333, SplitRole::Agent, SplitSource::Pool),
            SplitRule::new("b", 3333, SplitRole::Referrer, SplitSource::Platform),
            SplitRule::new("c", 3334, SplitRole::Merchant, SplitSource::Merchant),
        ]);
        let payment_types = [
            PaymentType::CryptoDirect,
            PaymentType::Onramp,
            PaymentType::Offramp,
            PaymentType::Mixed,
        ];
        // 100_200 is exactly the mixed fee floor: 100 + 100 + minimum split fee
        for amount in [100_200u128, 1_234_567, 99_999_999, 7_000_000_000_003] {
            for payment_type in payment_types {
                let result = allocate(MicroAmount(amount), &p, payment_type.into(), 300, &HashMap::new()).unwrap();
                assert!(result.reconciles(), "amount {} {:?}", amount, payment_type);
            }
        }
    }

    #[test]
    fn test_amount_one_below_mixed_fee_floor_is_rejected() {
        let p = plan(vec![SplitRule::new("a", 5000, SplitRole::Agent, SplitSource::Pool)]);
        let err = allocate(MicroAmount(100_199), &p, PaymentType::Mixed.into(), 300, &HashMap::new()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[test]
    fn test_preview_is_deterministic() {
        let p = plan(vec![SplitRule::new("a", 2500, SplitRole::Agent, SplitSource::Pool)]);
        let a = allocate(MicroAmount(5_555_555), &p, PaymentType::Onramp.into(), 300, &HashMap::new()).unwrap();
        let b = allocate(MicroAmount(5_555_555), &p, PaymentType::Onramp.into(), 300, &HashMap::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_distribute_overrides_then_even_split() {
        let claims = vec![
            ShareClaim { recipient: "lead".into(), override_bps: Some(5000) },
            ShareClaim { recipient: "x".into(), override_bps: None },
            ShareClaim { recipient: "y".into(), override_bps: None },
            ShareClaim { recipient: "z".into(), override_bps: None },
        ];
        let lines = distribute_by_shares(MicroAmount(1_000_000), &claims).unwrap();

        assert_eq!(lines[0].amount, MicroAmount(500_000));
        // 5000 bps over three: 1668 + 1666 + 1666
        assert_eq!(lines[1].share_bps, 1668);
        assert_eq!(lines[2].share_bps, 1666);
        let total: MicroAmount = lines.iter().map(|l| l.amount).sum();
        assert_eq!(total, MicroAmount(1_000_000));
    }

    #[test]
    fn test_distribute_rejects_over_full_overrides() {
        let claims = vec![
            ShareClaim { recipient: "a".into(), override_bps: Some(6000) },
            ShareClaim { recipient: "b".into(), override_bps: Some(6000) },
        ];
        assert!(distribute_by_shares(MicroAmount(10), &claims).is_err());
        assert!(distribute_by_shares(MicroAmount(10), &[]).is_err());
    }
}
