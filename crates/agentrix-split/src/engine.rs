//! Split plan book and preview engine

use std::collections::HashMap;

use agentrix_types::{AgentrixError, EngineConfig, MicroAmount, PlanId, Result, UserId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocation::{allocate, AllocationFlags, AllocationResult, PaymentType};
use crate::plan::{
    validate_fee_config, validate_rules, FeeConfig, PlanStatus, ProductType, SplitPlan, SplitRule,
    Tier, VolumeCap,
};
use crate::template::{default_template, default_templates};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePlan {
    pub name: String,
    pub description: Option<String>,
    pub product_type: ProductType,
    pub rules: Vec<SplitRule>,
    /// Falls back to the engine's default schedule
    pub fee_config: Option<FeeConfig>,
    #[serde(default)]
    pub tiers: Vec<Tier>,
    pub volume_cap: Option<VolumeCap>,
}

/// Plan changes; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePlan {
    pub name: Option<String>,
    pub description: Option<String>,
    pub rules: Option<Vec<SplitRule>>,
    pub fee_config: Option<FeeConfig>,
    pub tiers: Option<Vec<Tier>>,
    pub volume_cap: Option<VolumeCap>,
}

/// How a preview picks its plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum PlanSelector {
    Id { plan_id: PlanId },
    /// The owner's newest active plan for the type, else the built-in template
    ProductType {
        owner: Option<UserId>,
        product_type: ProductType,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewRequest {
    pub amount: MicroAmount,
    pub plan: PlanSelector,
    pub payment_type: PaymentType,
    /// Override whether the split fee applies
    pub split: Option<bool>,
    /// Placeholder -> concrete recipient
    #[serde(default)]
    pub recipients: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    /// The plan had been used and was archived instead
    Archived,
}

fn ensure_owner(plan: &SplitPlan, caller: &UserId) -> Result<()> {
    if &plan.owner_id != caller {
        return Err(AgentrixError::forbidden("split plan", &plan.id, caller));
    }
    Ok(())
}

fn check_volume_cap(plan: &SplitPlan, amount: MicroAmount, now: DateTime<Utc>) -> Result<()> {
    if let Some(cap) = &plan.volume_cap {
        let attempted = plan.volume_in_period(now).try_add(amount)?;
        if attempted > cap.max_volume {
            return Err(AgentrixError::VolumeCapExceeded {
                plan_id: plan.id.to_string(),
                cap: cap.max_volume,
                attempted,
            });
        }
    }
    Ok(())
}

/// The Agentrix split engine
pub struct SplitEngine {
    plans: RwLock<HashMap<PlanId, SplitPlan>>,
    default_fees: FeeConfig,
    distributable_pool_bps: u32,
}

impl SplitEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            default_fees: FeeConfig::from_config(config),
            distributable_pool_bps: config.distributable_pool_bps,
        }
    }

    pub fn default_fees(&self) -> FeeConfig {
        self.default_fees
    }

    pub fn templates(&self) -> Vec<SplitPlan> {
        default_templates(self.default_fees)
    }

    /// Create a plan in `draft`
    pub fn create(&self, owner: &UserId, request: CreatePlan) -> Result<SplitPlan> {
        if request.name.trim().is_empty() {
            return Err(AgentrixError::invalid_input("name", "must not be empty"));
        }
        validate_rules(&request.rules)?;
        let fee_config = request.fee_config.unwrap_or(self.default_fees);
        validate_fee_config(&fee_config, &request.tiers)?;

        let now = Utc::now();
        let plan = SplitPlan {
            id: PlanId::new(),
            owner_id: owner.clone(),
            name: request.name,
            description: request.description,
            product_type: request.product_type,
            rules: request.rules,
            fee_config,
            tiers: request.tiers,
            volume_cap: request.volume_cap,
            status: PlanStatus::Draft,
            is_system_template: false,
            version: 1,
            usage_count: 0,
            period_volume: MicroAmount::ZERO,
            period_started_at: now,
            created_at: now,
            updated_at: now,
        };

        self.plans.write().insert(plan.id.clone(), plan.clone());
        info!(plan_id = %plan.id, owner = %owner, "Split plan created");
        Ok(plan)
    }

    /// A stored plan or a built-in template
    pub fn get(&self, id: &PlanId) -> Result<SplitPlan> {
        if let Some(plan) = self.plans.read().get(id) {
            return Ok(plan.clone());
        }
        self.templates()
            .into_iter()
            .find(|t| &t.id == id)
            .ok_or_else(|| AgentrixError::not_found("split plan", id))
    }

    /// Plans of `owner`, newest first
    pub fn list_for_owner(&self, owner: &UserId, status: Option<PlanStatus>) -> Vec<SplitPlan> {
        let mut plans: Vec<SplitPlan> = self
            .plans
            .read()
            .values()
            .filter(|p| &p.owner_id == owner)
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        plans
    }

    /// Run `mutate` on an owned, stored plan under the write lock
    fn modify<F>(&self, owner: &UserId, id: &PlanId, mutate: F) -> Result<SplitPlan>
    where
        F: FnOnce(&mut SplitPlan) -> Result<()>,
    {
        let mut plans = self.plans.write();
        let stored = plans
            .get_mut(id)
            .ok_or_else(|| AgentrixError::not_found("split plan", id))?;
        ensure_owner(stored, owner)?;

        let mut next = stored.clone();
        mutate(&mut next)?;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    /// Edit a draft or active plan; an active plan must stay activatable
    pub fn update(&self, owner: &UserId, id: &PlanId, patch: UpdatePlan) -> Result<SplitPlan> {
        let plan = self.modify(owner, id, |plan| {
            if plan.status == PlanStatus::Archived {
                return Err(AgentrixError::invalid_transition("split plan", &plan.id, plan.status, "update"));
            }
            if let Some(name) = patch.name {
                plan.name = name;
            }
            if let Some(description) = patch.description {
                plan.description = Some(description);
            }
            if let Some(rules) = patch.rules {
                validate_rules(&rules)?;
                plan.rules = rules;
            }
            if let Some(fee_config) = patch.fee_config {
                plan.fee_config = fee_config;
            }
            if let Some(tiers) = patch.tiers {
                plan.tiers = tiers;
            }
            if let Some(cap) = patch.volume_cap {
                plan.volume_cap = Some(cap);
            }
            validate_fee_config(&plan.fee_config, &plan.tiers)?;
            if plan.status == PlanStatus::Active {
                plan.ensure_activatable()?;
            }
            plan.version += 1;
            Ok(())
        })?;

        info!(plan_id = %id, version = plan.version, "Split plan updated");
        Ok(plan)
    }

    /// `draft`/`archived` -> `active`
    pub fn activate(&self, owner: &UserId, id: &PlanId) -> Result<SplitPlan> {
        let plan = self.modify(owner, id, |plan| {
            if plan.status == PlanStatus::Active {
                return Ok(());
            }
            plan.ensure_activatable()?;
            plan.status = PlanStatus::Active;
            Ok(())
        })?;

        info!(plan_id = %id, shares_bps = plan.active_share_bps(), "Split plan activated");
        Ok(plan)
    }

    pub fn archive(&self, owner: &UserId, id: &PlanId) -> Result<SplitPlan> {
        let plan = self.modify(owner, id, |plan| {
            plan.status = PlanStatus::Archived;
            Ok(())
        })?;

        info!(plan_id = %id, "Split plan archived");
        Ok(plan)
    }

    /// Delete an unused plan; a used one is archived instead
    pub fn delete(&self, owner: &UserId, id: &PlanId) -> Result<DeleteOutcome> {
        let mut plans = self.plans.write();
        let plan = plans
            .get_mut(id)
            .ok_or_else(|| AgentrixError::not_found("split plan", id))?;
        ensure_owner(plan, owner)?;

        if plan.usage_count > 0 {
            plan.status = PlanStatus::Archived;
            plan.updated_at = Utc::now();
            info!(plan_id = %id, usage_count = plan.usage_count, "Used split plan archived instead of deleted");
            return Ok(DeleteOutcome::Archived);
        }

        plans.remove(id);
        info!(plan_id = %id, "Split plan deleted");
        Ok(DeleteOutcome::Deleted)
    }

    /// Count one settlement against a plan and add to its period volume
    pub fn record_usage(&self, id: &PlanId, amount: MicroAmount, now: DateTime<Utc>) -> Result<SplitPlan> {
        let mut plans = self.plans.write();
        let Some(plan) = plans.get_mut(id) else {
            // Built-in templates are stateless
            return self
                .templates()
                .into_iter()
                .find(|t| &t.id == id)
                .ok_or_else(|| AgentrixError::not_found("split plan", id));
        };

        check_volume_cap(plan, amount, now)?;

        let mut next = plan.clone();
        if let Some(cap) = &next.volume_cap {
            let period_start = cap.period.start(now);
            if next.period_started_at < period_start {
                next.period_volume = MicroAmount::ZERO;
                next.period_started_at = period_start;
            }
        }
        next.period_volume = next.period_volume.try_add(amount)?;
        next.usage_count += 1;
        next.updated_at = now;
        *plan = next.clone();
        Ok(next)
    }

    /// Pick the plan a preview runs against
    pub fn resolve(&self, selector: &PlanSelector) -> Result<SplitPlan> {
        match selector {
            PlanSelector::Id { plan_id } => {
                let plan = self.get(plan_id)?;
                if plan.status == PlanStatus::Archived {
                    return Err(AgentrixError::invalid_transition(
                        "split plan",
                        &plan.id,
                        plan.status,
                        "preview",
                    ));
                }
                Ok(plan)
            }
            PlanSelector::ProductType { owner, product_type } => {
                let owned = owner.as_ref().and_then(|owner| {
                    self.list_for_owner(owner, Some(PlanStatus::Active))
                        .into_iter()
                        .find(|p| p.product_type == *product_type)
                });
                Ok(owned.unwrap_or_else(|| default_template(*product_type, self.default_fees)))
            }
        }
    }

    pub fn preview(&self, request: &PreviewRequest) -> Result<AllocationResult> {
        self.preview_at(request, Utc::now())
    }

    /// Fee and allocation breakdown; never mutates a plan
    pub fn preview_at(&self, request: &PreviewRequest, now: DateTime<Utc>) -> Result<AllocationResult> {
        let plan = self.resolve(&request.plan)?;
        check_volume_cap(&plan, request.amount, now)?;

        let mut flags = AllocationFlags::from(request.payment_type);
        flags.split = request.split;

        allocate(
            request.amount,
            &plan,
            flags,
            self.distributable_pool_bps,
            &request.recipients,
        )
    }
}
