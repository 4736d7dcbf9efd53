//! Split preview command

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use colored::*;
use rust_decimal::Decimal;

use agentrix_split::{
    allocate, AllocationFlags, AllocationResult, PaymentType, PlanSelector, PreviewRequest,
    ProductType, SplitEngine, SplitPlan,
};
use agentrix_types::{EngineConfig, MicroAmount};

use crate::display;

pub struct PreviewArgs {
    pub amount: Decimal,
    pub product_type: ProductType,
    pub plan: Option<PathBuf>,
    pub payment_type: PaymentType,
    pub split: Option<bool>,
    pub recipients: HashMap<String, String>,
}

pub fn run(args: PreviewArgs, json: bool) -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    let result = compute(&config, args)?;

    if json {
        return display::json(&result);
    }
    print_result(&result);
    Ok(())
}

/// Preview against a plan file, or the built-in template for the product type
pub fn compute(config: &EngineConfig, args: PreviewArgs) -> anyhow::Result<AllocationResult> {
    let amount = MicroAmount::from_decimal(args.amount)?;

    match args.plan {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading plan file {}", path.display()))?;
            let plan: SplitPlan = serde_json::from_str(&raw)
                .with_context(|| format!("parsing plan file {}", path.display()))?;
            let mut flags = AllocationFlags::from(args.payment_type);
            flags.split = args.split;
            Ok(allocate(
                amount,
                &plan,
                flags,
                config.distributable_pool_bps,
                &args.recipients,
            )?)
        }
        None => {
            let engine = SplitEngine::new(config);
            Ok(engine.preview(&PreviewRequest {
                amount,
                plan: PlanSelector::ProductType {
                    owner: None,
                    product_type: args.product_type,
                },
                payment_type: args.payment_type,
                split: args.split,
                recipients: args.recipients,
            })?)
        }
    }
}

pub fn print_result(result: &AllocationResult) {
    display::section("Split Preview");
    display::labeled("Plan", result.plan_id.as_str());
    display::labeled("Amount", &display::units(result.amount));

    println!();
    println!("  {}", "Fees".bright_white().bold());
    display::kv(
        &format!("onramp ({} bps)", result.rates.onramp_fee_bps),
        &display::units(result.fees.onramp_fee),
    );
    display::kv(
        &format!("offramp ({} bps)", result.rates.offramp_fee_bps),
        &display::units(result.fees.offramp_fee),
    );
    display::kv(
        &format!("split ({} bps)", result.rates.split_fee_bps),
        &display::units(result.fees.split_fee),
    );
    display::kv("total", &display::units(result.fees.total));

    println!();
    println!("  {}", "Allocations".bright_white().bold());
    display::kv("net amount", &display::units(result.net_amount));
    display::kv(
        &format!("distributable pool ({} bps)", result.rates.distributable_pool_bps),
        &display::units(result.distributable_pool),
    );
    for line in &result.allocations {
        display::kv(
            &format!("{} ({:?}, {} bps)", line.recipient, line.role, line.share_bps),
            &display::units(line.amount),
        );
    }
    display::kv("merchant net", &display::units(result.merchant_net));

    println!();
    if result.reconciles() {
        display::success("Fees, allocations and merchant net add up to the amount");
    } else {
        display::error("Breakdown does not reconcile");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(amount: Decimal, payment_type: PaymentType) -> PreviewArgs {
        PreviewArgs {
            amount,
            product_type: ProductType::Skill,
            plan: None,
            payment_type,
            split: None,
            recipients: HashMap::from([
                ("{{executor}}".to_string(), "alice".to_string()),
                ("{{referrer}}".to_string(), "bob".to_string()),
            ]),
        }
    }

    #[test]
    fn test_template_preview_reconciles() {
        let config = EngineConfig::default();
        let result = compute(&config, args(Decimal::from(100), PaymentType::Onramp)).unwrap();

        assert_eq!(result.amount, MicroAmount(100_000_000));
        assert_eq!(result.fees.onramp_fee, MicroAmount(100_000));
        assert!(result.reconciles());
        assert!(result.allocations.iter().any(|l| l.recipient == "alice"));
        assert!(result.allocations.iter().any(|l| l.recipient == "bob"));
    }

    #[test]
    fn test_plan_file_is_used_when_given() {
        let config = EngineConfig::default();
        let engine = SplitEngine::new(&config);
        let mut plan = engine.templates().remove(0);
        plan.fee_config.onramp_fee_bps = 100;

        let path = std::env::temp_dir().join(format!("agentrix-plan-{}.json", plan.id));
        std::fs::write(&path, serde_json::to_string(&plan).unwrap()).unwrap();

        let mut request = args(Decimal::from(100), PaymentType::Onramp);
        request.plan = Some(path.clone());
        let result = compute(&config, request).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(result.fees.onramp_fee, MicroAmount(1_000_000));
        assert!(result.reconciles());
    }

    #[test]
    fn test_negative_amount_is_rejected() {
        let config = EngineConfig::default();
        assert!(compute(&config, args(Decimal::from(-5), PaymentType::CryptoDirect)).is_err());
    }
}
