//! Built-in per-product-type plans
//!
//! Template recipients are placeholders such as `{{executor}}`; a preview
//! substitutes them from its recipient map.

use agentrix_types::{MicroAmount, PlanId, UserId};
use chrono::Utc;

use crate::plan::{FeeConfig, PlanStatus, ProductType, SplitPlan, SplitRole, SplitRule, SplitSource};

/// Owner recorded on built-in templates
pub const SYSTEM_OWNER: &str = "system";

fn rules_for(product_type: ProductType) -> Vec<SplitRule> {
    match product_type {
        ProductType::Skill => vec![
            SplitRule::new("{{executor}}", 7000, SplitRole::Executor, SplitSource::Platform),
            SplitRule::new("{{referrer}}", 3000, SplitRole::Referrer, SplitSource::Platform),
        ],
        ProductType::Physical => vec![
            SplitRule::new("{{agent}}", 7000, SplitRole::Agent, SplitSource::Pool),
            SplitRule::new("{{referrer}}", 3000, SplitRole::Referrer, SplitSource::Pool),
        ],
        ProductType::Service => vec![
            SplitRule::new("{{executor}}", 8000, SplitRole::Executor, SplitSource::Pool),
            SplitRule::new("{{agent}}", 2000, SplitRole::Agent, SplitSource::Pool),
        ],
        ProductType::Digital => vec![
            SplitRule::new("{{agent}}", 5000, SplitRole::Agent, SplitSource::Pool),
            SplitRule::new("{{referrer}}", 5000, SplitRole::Referrer, SplitSource::Pool),
        ],
    }
}

/// The built-in plan for a product type
pub fn default_template(product_type: ProductType, fees: FeeConfig) -> SplitPlan {
    let now = Utc::now();
    SplitPlan {
        id: PlanId::from_raw(format!("template_{}", product_type)),
        owner_id: UserId::from_raw(SYSTEM_OWNER),
        name: format!("Default {} split", product_type),
        description: None,
        product_type,
        rules: rules_for(product_type),
        fee_config: fees,
        tiers: Vec::new(),
        volume_cap: None,
        status: PlanStatus::Active,
        is_system_template: true,
        version: 1,
        usage_count: 0,
        period_volume: MicroAmount::ZERO,
        period_started_at: now,
        created_at: now,
        updated_at: now,
    }
}

/// Every built-in template
pub fn default_templates(fees: FeeConfig) -> Vec<SplitPlan> {
    [
        ProductType::Skill,
        ProductType::Physical,
        ProductType::Service,
        ProductType::Digital,
    ]
    .into_iter()
    .map(|t| default_template(t, fees))
    .collect()
}
