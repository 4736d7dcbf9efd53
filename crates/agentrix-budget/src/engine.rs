//! Pool and milestone state machine
//!
//! Pools and milestones live in one book behind a single write lock, so a
//! reservation or release updates both rows as one step. Collaborators are
//! only called with the lock released.

use std::collections::HashMap;
use std::sync::Arc;

use agentrix_split::distribute_by_shares;
use agentrix_types::{AgentrixError, MicroAmount, MilestoneId, PoolId, Result, UserId};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::collaborators::{FundingVerifier, SettlementGateway};
use crate::milestone::{
    ApprovalType, ApproveMilestone, Artifact, CreateMilestone, Milestone, MilestoneStatus,
    RejectMilestone, Review, SettlementStatus,
};
use crate::pool::{
    BudgetPool, CreatePool, FundPool, MilestoneCounts, PoolStats, PoolStatus, UpdatePool,
};

/// Reviewer recorded on auto-approved milestones
pub const AUTO_REVIEWER: &str = "auto";

#[derive(Default)]
struct BudgetBook {
    pools: HashMap<PoolId, BudgetPool>,
    milestones: HashMap<MilestoneId, Milestone>,
}

impl BudgetBook {
    fn pool(&self, id: &PoolId) -> Result<&BudgetPool> {
        self.pools
            .get(id)
            .ok_or_else(|| AgentrixError::not_found("budget pool", id))
    }

    fn pool_mut(&mut self, id: &PoolId) -> Result<&mut BudgetPool> {
        self.pools
            .get_mut(id)
            .ok_or_else(|| AgentrixError::not_found("budget pool", id))
    }

    fn milestone(&self, id: &MilestoneId) -> Result<&Milestone> {
        self.milestones
            .get(id)
            .ok_or_else(|| AgentrixError::not_found("milestone", id))
    }

    fn milestones_of<'a>(&'a self, pool_id: &'a PoolId) -> impl Iterator<Item = &'a Milestone> {
        self.milestones.values().filter(move |m| &m.pool_id == pool_id)
    }
}

fn ensure_pool_owner(pool: &BudgetPool, caller: &UserId) -> Result<()> {
    if &pool.owner_id != caller {
        return Err(AgentrixError::forbidden("budget pool", &pool.id, caller));
    }
    Ok(())
}

fn settlement_label(status: Option<&SettlementStatus>) -> &'static str {
    match status {
        None => "unreleased",
        Some(SettlementStatus::NotConfigured) => "not_configured",
        Some(SettlementStatus::Settling) => "settling",
        Some(SettlementStatus::Settled { .. }) => "settled",
        Some(SettlementStatus::Failed { .. }) => "failed",
    }
}

/// The Agentrix budget engine
#[derive(Clone, Default)]
pub struct BudgetEngine {
    book: Arc<RwLock<BudgetBook>>,
    settlement: Option<Arc<dyn SettlementGateway>>,
    verifier: Option<Arc<dyn FundingVerifier>>,
}

impl BudgetEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settlement(mut self, gateway: Arc<dyn SettlementGateway>) -> Self {
        self.settlement = Some(gateway);
        self
    }

    pub fn with_funding_verifier(mut self, verifier: Arc<dyn FundingVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    // ========================================================================
    // Pools
    // ========================================================================

    /// Create a pool in `draft`
    pub async fn create_pool(&self, owner: &UserId, request: CreatePool) -> Result<BudgetPool> {
        if request.name.trim().is_empty() {
            return Err(AgentrixError::invalid_input("name", "must not be empty"));
        }
        if request.total_budget.is_zero() {
            return Err(AgentrixError::invalid_input("total_budget", "must be positive"));
        }

        let now = Utc::now();
        let pool = BudgetPool {
            id: PoolId::new(),
            owner_id: owner.clone(),
            name: request.name,
            description: request.description,
            currency: request.currency,
            total_budget: request.total_budget,
            funded_amount: MicroAmount::ZERO,
            reserved_amount: MicroAmount::ZERO,
            released_amount: MicroAmount::ZERO,
            funding_source: request.funding_source,
            payment_intent_id: None,
            wallet_address: None,
            funding_proof: None,
            split_plan_id: request.split_plan_id,
            status: PoolStatus::Draft,
            expires_at: request.expires_at,
            created_at: now,
            updated_at: now,
        };

        self.book.write().await.pools.insert(pool.id.clone(), pool.clone());
        info!(pool_id = %pool.id, owner = %owner, total_budget = %pool.total_budget, "Budget pool created");
        Ok(pool)
    }

    /// Edit a pool that has not been funded yet
    pub async fn update_pool(&self, owner: &UserId, id: &PoolId, patch: UpdatePool) -> Result<BudgetPool> {
        let mut book = self.book.write().await;
        let pool = book.pool_mut(id)?;
        ensure_pool_owner(pool, owner)?;
        if pool.status != PoolStatus::Draft {
            return Err(AgentrixError::invalid_transition("budget pool", id, pool.status, "update"));
        }
        if patch.total_budget.map_or(false, |b| b.is_zero()) {
            return Err(AgentrixError::invalid_input("total_budget", "must be positive"));
        }

        if let Some(name) = patch.name {
            pool.name = name;
        }
        if let Some(description) = patch.description {
            pool.description = Some(description);
        }
        if let Some(total_budget) = patch.total_budget {
            pool.total_budget = total_budget;
        }
        if let Some(source) = patch.funding_source {
            pool.funding_source = source;
        }
        if let Some(plan_id) = patch.split_plan_id {
            pool.split_plan_id = Some(plan_id);
        }
        if let Some(expires_at) = patch.expires_at {
            pool.expires_at = Some(expires_at);
        }
        pool.updated_at = Utc::now();
        Ok(pool.clone())
    }

    pub async fn get_pool(&self, id: &PoolId) -> Result<BudgetPool> {
        self.book.read().await.pool(id).cloned()
    }

    /// Pools of `owner`, newest first
    pub async fn list_pools_for_owner(&self, owner: &UserId) -> Vec<BudgetPool> {
        let book = self.book.read().await;
        let mut pools: Vec<BudgetPool> = book
            .pools
            .values()
            .filter(|p| &p.owner_id == owner)
            .cloned()
            .collect();
        pools.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        pools
    }

    /// Add funds; `draft -> funded`, and `-> active` once the budget is covered
    pub async fn fund_pool(&self, owner: &UserId, id: &PoolId, funding: FundPool) -> Result<BudgetPool> {
        let snapshot = self.get_pool(id).await?;
        ensure_pool_owner(&snapshot, owner)?;
        funding.validate_for(snapshot.funding_source)?;

        if let Some(proof) = &funding.proof {
            match &self.verifier {
                Some(verifier) => {
                    if !verifier.verify(&snapshot, proof, funding.amount).await? {
                        warn!(pool_id = %id, proof = %proof, "Funding proof rejected");
                        return Err(AgentrixError::invalid_input("proof", "funding proof did not verify"));
                    }
                }
                None => debug!(pool_id = %id, "No funding verifier configured, proof recorded unchecked"),
            }
        }

        let mut book = self.book.write().await;
        let pool = book.pool_mut(id)?;
        if pool.status.is_terminal() {
            return Err(AgentrixError::invalid_transition("budget pool", id, pool.status, "fund"));
        }

        pool.funded_amount = pool.funded_amount.try_add(funding.amount)?;
        if pool.funded_amount >= pool.total_budget {
            pool.status = PoolStatus::Active;
        } else if pool.status == PoolStatus::Draft {
            pool.status = PoolStatus::Funded;
        }
        if funding.payment_intent_id.is_some() {
            pool.payment_intent_id = funding.payment_intent_id;
        }
        if funding.wallet_address.is_some() {
            pool.wallet_address = funding.wallet_address;
        }
        if funding.proof.is_some() {
            pool.funding_proof = funding.proof;
        }
        pool.updated_at = Utc::now();

        info!(
            pool_id = %id,
            amount = %funding.amount,
            funded = %pool.funded_amount,
            status = %pool.status,
            "Budget pool funded"
        );
        Ok(pool.clone())
    }

    /// Cancel a pool; refused while any milestone is being worked on
    pub async fn cancel_pool(&self, owner: &UserId, id: &PoolId) -> Result<BudgetPool> {
        let mut book = self.book.write().await;
        let pool = book.pool(id)?;
        ensure_pool_owner(pool, owner)?;
        if pool.status == PoolStatus::Cancelled {
            return Ok(pool.clone());
        }
        if pool.status.is_terminal() {
            return Err(AgentrixError::invalid_transition("budget pool", id, pool.status, "cancel"));
        }
        if book
            .milestones_of(id)
            .any(|m| m.status == MilestoneStatus::InProgress)
        {
            return Err(AgentrixError::invalid_transition(
                "budget pool",
                id,
                "has milestones in_progress",
                "cancel",
            ));
        }

        let pool = book.pool_mut(id)?;
        pool.status = PoolStatus::Cancelled;
        pool.updated_at = Utc::now();
        info!(pool_id = %id, "Budget pool cancelled");
        Ok(pool.clone())
    }

    pub async fn pool_stats(&self, id: &PoolId) -> Result<PoolStats> {
        let book = self.book.read().await;
        let pool = book.pool(id)?;

        let mut counts = MilestoneCounts::default();
        for milestone in book.milestones_of(id) {
            counts.total += 1;
            match milestone.status {
                MilestoneStatus::Pending => counts.pending += 1,
                MilestoneStatus::InProgress => counts.in_progress += 1,
                MilestoneStatus::PendingReview => counts.pending_review += 1,
                MilestoneStatus::Approved => counts.approved += 1,
                MilestoneStatus::Rejected => counts.rejected += 1,
                MilestoneStatus::Released => counts.released += 1,
            }
        }

        Ok(PoolStats {
            pool_id: pool.id.clone(),
            status: pool.status,
            total_budget: pool.total_budget,
            funded: pool.funded_amount,
            reserved: pool.reserved_amount,
            released: pool.released_amount,
            available: pool.available(),
            milestones: counts,
        })
    }

    /// Move overdue pools that are still open to `expired`
    pub async fn expire_due_pools(&self, now: DateTime<Utc>) -> Vec<PoolId> {
        let mut book = self.book.write().await;
        let mut expired = Vec::new();
        for pool in book.pools.values_mut() {
            if !pool.status.is_terminal() && pool.is_overdue(now) {
                pool.status = PoolStatus::Expired;
                pool.updated_at = now;
                expired.push(pool.id.clone());
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired overdue budget pools");
        }
        expired
    }

    // ========================================================================
    // Milestones
    // ========================================================================

    /// Reserve funds and create a `pending` milestone
    pub async fn create_milestone(
        &self,
        owner: &UserId,
        pool_id: &PoolId,
        request: CreateMilestone,
    ) -> Result<Milestone> {
        request.validate()?;

        let mut book = self.book.write().await;
        let pool = book.pool_mut(pool_id)?;
        ensure_pool_owner(pool, owner)?;
        if !pool.status.accepts_reservations() {
            return Err(AgentrixError::invalid_transition(
                "budget pool",
                pool_id,
                pool.status,
                "reserve against",
            ));
        }
        pool.reserve(request.reserved_amount)?;
        pool.updated_at = Utc::now();
        let available = pool.available();

        let now = Utc::now();
        let milestone = Milestone {
            id: MilestoneId::new(),
            pool_id: pool_id.clone(),
            title: request.title,
            description: request.description,
            sort_order: request.sort_order,
            due_date: request.due_date,
            reserved_amount: request.reserved_amount,
            released_amount: MicroAmount::ZERO,
            participants: request.participants,
            status: MilestoneStatus::Pending,
            approval_type: request.approval_type,
            quality_gate: request.quality_gate,
            quality_score: None,
            artifacts: Vec::new(),
            review: None,
            reject_reason: None,
            payouts: Vec::new(),
            settlement: None,
            started_at: None,
            submitted_at: None,
            approved_at: None,
            released_at: None,
            created_at: now,
            updated_at: now,
        };
        book.milestones.insert(milestone.id.clone(), milestone.clone());

        info!(
            milestone_id = %milestone.id,
            pool_id = %pool_id,
            reserved = %milestone.reserved_amount,
            available = %available,
            "Milestone created"
        );
        Ok(milestone)
    }

    /// Apply `mutate` to a milestone the caller may act on
    ///
    /// The pool owner may always act; participants only when
    /// `participants_allowed` is set.
    async fn transition<F>(
        &self,
        caller: &UserId,
        id: &MilestoneId,
        participants_allowed: bool,
        mutate: F,
    ) -> Result<Milestone>
    where
        F: FnOnce(&mut Milestone, DateTime<Utc>) -> Result<()>,
    {
        let mut book = self.book.write().await;
        let milestone = book.milestone(id)?;
        let pool = book.pool(&milestone.pool_id)?;
        let allowed = &pool.owner_id == caller
            || (participants_allowed && milestone.is_participant(caller.as_str()));
        if !allowed {
            return Err(AgentrixError::forbidden("milestone", id, caller));
        }

        let now = Utc::now();
        let mut next = milestone.clone();
        mutate(&mut next, now)?;
        next.updated_at = now;
        book.milestones.insert(id.clone(), next.clone());
        Ok(next)
    }

    /// `pending -> in_progress`
    pub async fn start_milestone(&self, caller: &UserId, id: &MilestoneId) -> Result<Milestone> {
        let milestone = self
            .transition(caller, id, true, |m, now| {
                m.expect_status(MilestoneStatus::Pending, "start")?;
                m.status = MilestoneStatus::InProgress;
                m.started_at = Some(now);
                Ok(())
            })
            .await?;
        info!(milestone_id = %id, "Milestone started");
        Ok(milestone)
    }

    /// `in_progress -> pending_review`, or straight to `approved` for auto approval
    pub async fn submit_milestone(
        &self,
        caller: &UserId,
        id: &MilestoneId,
        artifacts: Vec<Artifact>,
    ) -> Result<Milestone> {
        let milestone = self
            .transition(caller, id, true, |m, now| {
                m.expect_status(MilestoneStatus::InProgress, "submit")?;
                m.artifacts.extend(artifacts);
                m.submitted_at = Some(now);
                if m.approval_type == ApprovalType::Auto {
                    m.status = MilestoneStatus::Approved;
                    m.approved_at = Some(now);
                    m.review = Some(Review {
                        reviewer: AUTO_REVIEWER.to_string(),
                        reviewed_at: now,
                        note: None,
                    });
                } else {
                    m.status = MilestoneStatus::PendingReview;
                }
                Ok(())
            })
            .await?;
        info!(milestone_id = %id, status = %milestone.status, "Milestone submitted");
        Ok(milestone)
    }

    /// `pending_review -> approved`, subject to the quality gate
    pub async fn approve_milestone(
        &self,
        caller: &UserId,
        id: &MilestoneId,
        request: ApproveMilestone,
    ) -> Result<Milestone> {
        let milestone = self
            .transition(caller, id, false, |m, now| {
                m.expect_status(MilestoneStatus::PendingReview, "approve")?;
                if m.approval_type == ApprovalType::QualityGate {
                    let score = request.quality_score.ok_or_else(|| {
                        AgentrixError::invalid_input("quality_score", "required by the quality gate")
                    })?;
                    if let Some(gate) = &m.quality_gate {
                        gate.evaluate(score)?;
                    }
                }
                m.quality_score = request.quality_score;
                m.status = MilestoneStatus::Approved;
                m.approved_at = Some(now);
                m.review = Some(Review {
                    reviewer: request.reviewer,
                    reviewed_at: now,
                    note: request.note,
                });
                Ok(())
            })
            .await?;
        info!(milestone_id = %id, "Milestone approved");
        Ok(milestone)
    }

    /// `pending_review -> rejected`
    pub async fn reject_milestone(
        &self,
        caller: &UserId,
        id: &MilestoneId,
        request: RejectMilestone,
    ) -> Result<Milestone> {
        let milestone = self
            .transition(caller, id, false, |m, now| {
                m.expect_status(MilestoneStatus::PendingReview, "reject")?;
                m.status = MilestoneStatus::Rejected;
                m.reject_reason = Some(request.reason);
                m.review = Some(Review {
                    reviewer: request.reviewer,
                    reviewed_at: now,
                    note: request.note,
                });
                Ok(())
            })
            .await?;
        info!(milestone_id = %id, "Milestone rejected");
        Ok(milestone)
    }

    /// `approved -> released`: move the reservation to released and settle
    ///
    /// The local release stands even when settlement fails; the outcome is
    /// recorded on the milestone.
    pub async fn release_milestone(&self, caller: &UserId, id: &MilestoneId) -> Result<Milestone> {
        let released = {
            let mut book = self.book.write().await;
            let milestone = book.milestone(id)?;
            let pool_id = milestone.pool_id.clone();
            let pool = book.pool(&pool_id)?;
            ensure_pool_owner(pool, caller)?;
            milestone.expect_status(MilestoneStatus::Approved, "release")?;
            if pool.status == PoolStatus::Cancelled {
                return Err(AgentrixError::invalid_transition(
                    "budget pool",
                    &pool_id,
                    pool.status,
                    "release from",
                ));
            }

            let amount = milestone.reserved_amount;
            let payouts = if milestone.participants.is_empty() {
                Vec::new()
            } else {
                distribute_by_shares(amount, &milestone.share_claims())?
            };

            let now = Utc::now();
            let mut next = milestone.clone();
            next.released_amount = amount;
            next.status = MilestoneStatus::Released;
            next.released_at = Some(now);
            next.updated_at = now;
            next.payouts = payouts;
            next.settlement = Some(match self.settlement {
                Some(_) => SettlementStatus::Settling,
                None => SettlementStatus::NotConfigured,
            });

            let pool = book.pool_mut(&pool_id)?;
            pool.release(amount)?;
            pool.updated_at = now;
            let pool_status = pool.status;

            book.milestones.insert(id.clone(), next.clone());
            info!(
                milestone_id = %id,
                pool_id = %pool_id,
                amount = %amount,
                pool_status = %pool_status,
                "Milestone released"
            );
            next
        };

        match &self.settlement {
            Some(gateway) => self.settle(gateway.as_ref(), released).await,
            None => Ok(released),
        }
    }

    /// Re-run settlement for a release whose settlement failed
    ///
    /// The milestone is moved to `settling` under the write lock before the
    /// gateway is called, so concurrent retries settle at most once.
    pub async fn retry_settlement(&self, caller: &UserId, id: &MilestoneId) -> Result<Milestone> {
        let gateway = self
            .settlement
            .as_ref()
            .ok_or_else(|| AgentrixError::invalid_input("settlement", "no settlement gateway configured"))?;

        let milestone = {
            let mut book = self.book.write().await;
            let milestone = book.milestone(id)?;
            ensure_pool_owner(book.pool(&milestone.pool_id)?, caller)?;
            if !matches!(milestone.settlement, Some(SettlementStatus::Failed { .. })) {
                return Err(AgentrixError::invalid_transition(
                    "milestone settlement",
                    id,
                    settlement_label(milestone.settlement.as_ref()),
                    "retry",
                ));
            }
            let stored = book
                .milestones
                .get_mut(id)
                .ok_or_else(|| AgentrixError::not_found("milestone", id))?;
            stored.settlement = Some(SettlementStatus::Settling);
            stored.updated_at = Utc::now();
            stored.clone()
        };

        info!(milestone_id = %id, "Retrying milestone settlement");
        self.settle(gateway.as_ref(), milestone).await
    }

    async fn settle(&self, gateway: &dyn SettlementGateway, milestone: Milestone) -> Result<Milestone> {
        let outcome = match gateway.settle(&milestone.id, &milestone.payouts).await {
            Ok(reference) => {
                info!(milestone_id = %milestone.id, reference = %reference, "Milestone settled");
                SettlementStatus::Settled { reference }
            }
            Err(e) => {
                warn!(milestone_id = %milestone.id, error = %e, "Milestone settlement failed");
                SettlementStatus::Failed { error: e.to_string() }
            }
        };

        let mut book = self.book.write().await;
        let stored = book
            .milestones
            .get_mut(&milestone.id)
            .ok_or_else(|| AgentrixError::not_found("milestone", &milestone.id))?;
        stored.settlement = Some(outcome);
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    pub async fn get_milestone(&self, id: &MilestoneId) -> Result<Milestone> {
        self.book.read().await.milestone(id).cloned()
    }

    /// Milestones of a pool by `sort_order`
    pub async fn list_milestones(&self, pool_id: &PoolId) -> Result<Vec<Milestone>> {
        let book = self.book.read().await;
        book.pool(pool_id)?;
        let mut milestones: Vec<Milestone> = book.milestones_of(pool_id).cloned().collect();
        milestones.sort_by(|a, b| {
            a.sort_order
                .cmp(&b.sort_order)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(milestones)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milestone::{GateOperator, Participant, QualityGate};
    use crate::pool::FundingSource;
    use agentrix_split::PayoutLine;
    use async_trait::async_trait;
    use chrono::Duration;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use rust_decimal_macros::dec;

    /// Settlement gateway that can be told to fail
    #[derive(Default)]
    struct Recorder {
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SettlementGateway for Recorder {
        async fn settle(&self, milestone_id: &MilestoneId, payouts: &[PayoutLine]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(AgentrixError::external("settlement", "rail offline"));
            }
            Ok(format!("tx-{}-{}", milestone_id, payouts.len()))
        }
    }

    fn owner() -> UserId {
        UserId::from_raw("owner")
    }

    async fn active_pool(engine: &BudgetEngine, budget: u128) -> BudgetPool {
        let pool = engine
            .create_pool(
                &owner(),
                CreatePool {
                    name: "launch".to_string(),
                    description: None,
                    currency: "USDC".to_string(),
                    total_budget: MicroAmount(budget),
                    funding_source: FundingSource::Credit,
                    split_plan_id: None,
                    expires_at: None,
                },
            )
            .await
            .unwrap();
        engine
            .fund_pool(
                &owner(),
                &pool.id,
                FundPool {
                    amount: MicroAmount(budget),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    async fn to_review(engine: &BudgetEngine, id: &MilestoneId) {
        engine.start_milestone(&owner(), id).await.unwrap();
        engine.submit_milestone(&owner(), id, Vec::new()).await.unwrap();
    }

    fn approve(score: Option<rust_decimal::Decimal>) -> ApproveMilestone {
        ApproveMilestone {
            reviewer: "owner".to_string(),
            quality_score: score,
            note: None,
        }
    }

    #[tokio::test]
    async fn test_funding_moves_draft_to_funded_to_active() {
        let engine = BudgetEngine::new();
        let pool = engine
            .create_pool(
                &owner(),
                CreatePool {
                    name: "p".to_string(),
                    description: None,
                    currency: "USDC".to_string(),
                    total_budget: MicroAmount(1_000),
                    funding_source: FundingSource::Credit,
                    split_plan_id: None,
                    expires_at: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(pool.status, PoolStatus::Draft);

        let half = FundPool {
            amount: MicroAmount(500),
            ..Default::default()
        };
        let funded = engine.fund_pool(&owner(), &pool.id, half.clone()).await.unwrap();
        assert_eq!(funded.status, PoolStatus::Funded);

        let err = engine
            .update_pool(&owner(), &pool.id, UpdatePool::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE_TRANSITION");

        let active = engine.fund_pool(&owner(), &pool.id, half).await.unwrap();
        assert_eq!(active.status, PoolStatus::Active);
        assert_eq!(active.funded_amount, MicroAmount(1_000));
    }

    #[tokio::test]
    async fn test_reserve_approve_release() {
        let engine = BudgetEngine::new();
        let pool = active_pool(&engine, 1_000).await;

        let milestone = engine
            .create_milestone(
                &owner(),
                &pool.id,
                CreateMilestone::new("phase 1", MicroAmount(400), ApprovalType::Manual),
            )
            .await
            .unwrap();
        let stats = engine.pool_stats(&pool.id).await.unwrap();
        assert_eq!(stats.reserved, MicroAmount(400));
        assert_eq!(stats.available, MicroAmount(600));

        to_review(&engine, &milestone.id).await;
        engine.approve_milestone(&owner(), &milestone.id, approve(None)).await.unwrap();
        let released = engine.release_milestone(&owner(), &milestone.id).await.unwrap();
        assert_eq!(released.status, MilestoneStatus::Released);
        assert_eq!(released.released_amount, MicroAmount(400));
        assert_eq!(released.settlement, Some(SettlementStatus::NotConfigured));

        let stats = engine.pool_stats(&pool.id).await.unwrap();
        assert_eq!(stats.reserved, MicroAmount::ZERO);
        assert_eq!(stats.released, MicroAmount(400));
        assert_eq!(stats.available, MicroAmount(600));
        assert_eq!(stats.milestones.released, 1);
    }

    #[tokio::test]
    async fn test_quality_gate() {
        let engine = BudgetEngine::new();
        let pool = active_pool(&engine, 1_000).await;
        let request = CreateMilestone::new("model", MicroAmount(100), ApprovalType::QualityGate)
            .with_gate(QualityGate {
                metric: "accuracy".to_string(),
                threshold: dec!(80),
                operator: GateOperator::Gte,
            });
        let milestone = engine.create_milestone(&owner(), &pool.id, request).await.unwrap();
        to_review(&engine, &milestone.id).await;

        let err = engine
            .approve_milestone(&owner(), &milestone.id, approve(Some(dec!(75))))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        assert_eq!(
            engine.get_milestone(&milestone.id).await.unwrap().status,
            MilestoneStatus::PendingReview
        );

        assert!(engine.approve_milestone(&owner(), &milestone.id, approve(None)).await.is_err());

        let approved = engine
            .approve_milestone(&owner(), &milestone.id, approve(Some(dec!(85))))
            .await
            .unwrap();
        assert_eq!(approved.status, MilestoneStatus::Approved);
        assert_eq!(approved.quality_score, Some(dec!(85)));
    }

    #[tokio::test]
    async fn test_auto_approval_on_submit() {
        let engine = BudgetEngine::new();
        let pool = active_pool(&engine, 1_000).await;
        let milestone = engine
            .create_milestone(
                &owner(),
                &pool.id,
                CreateMilestone::new("auto", MicroAmount(100), ApprovalType::Auto),
            )
            .await
            .unwrap();
        engine.start_milestone(&owner(), &milestone.id).await.unwrap();
        let submitted = engine
            .submit_milestone(
                &owner(),
                &milestone.id,
                vec![Artifact {
                    name: "report".to_string(),
                    uri: "ipfs://report".to_string(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(submitted.status, MilestoneStatus::Approved);
        assert_eq!(submitted.review.unwrap().reviewer, AUTO_REVIEWER);
        assert_eq!(submitted.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_transitions_outside_graph_are_rejected() {
        let engine = BudgetEngine::new();
        let pool = active_pool(&engine, 1_000).await;
        let milestone = engine
            .create_milestone(
                &owner(),
                &pool.id,
                CreateMilestone::new("m", MicroAmount(100), ApprovalType::Manual),
            )
            .await
            .unwrap();

        let err = engine.release_milestone(&owner(), &milestone.id).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE_TRANSITION");
        assert!(engine.approve_milestone(&owner(), &milestone.id, approve(None)).await.is_err());
        assert!(engine.submit_milestone(&owner(), &milestone.id, Vec::new()).await.is_err());

        to_review(&engine, &milestone.id).await;
        engine
            .reject_milestone(
                &owner(),
                &milestone.id,
                RejectMilestone {
                    reviewer: "owner".to_string(),
                    reason: "incomplete".to_string(),
                    note: None,
                },
            )
            .await
            .unwrap();
        let err = engine.release_milestone(&owner(), &milestone.id).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE_TRANSITION");
    }

    #[tokio::test]
    async fn test_insufficient_budget() {
        let engine = BudgetEngine::new();
        let pool = active_pool(&engine, 1_000).await;
        engine
            .create_milestone(
                &owner(),
                &pool.id,
                CreateMilestone::new("a", MicroAmount(700), ApprovalType::Manual),
            )
            .await
            .unwrap();
        let err = engine
            .create_milestone(
                &owner(),
                &pool.id,
                CreateMilestone::new("b", MicroAmount(301), ApprovalType::Manual),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INSUFFICIENT_BUDGET");
        assert_eq!(engine.pool_stats(&pool.id).await.unwrap().milestones.total, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_overcommit() {
        let engine = BudgetEngine::new();
        let pool = active_pool(&engine, 1_000).await;

        let attempts = (0..40).map(|i| {
            let engine = engine.clone();
            let pool_id = pool.id.clone();
            tokio::spawn(async move {
                engine
                    .create_milestone(
                        &owner(),
                        &pool_id,
                        CreateMilestone::new(format!("m{}", i), MicroAmount(100), ApprovalType::Manual),
                    )
                    .await
            })
        });
        let accepted = join_all(attempts)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();

        assert_eq!(accepted, 10);
        let pool = engine.get_pool(&pool.id).await.unwrap();
        assert_eq!(pool.reserved_amount, MicroAmount(1_000));
        assert!(pool.is_balanced());
    }

    #[tokio::test]
    async fn test_cancel_blocked_while_in_progress() {
        let engine = BudgetEngine::new();
        let pool = active_pool(&engine, 1_000).await;
        let milestone = engine
            .create_milestone(
                &owner(),
                &pool.id,
                CreateMilestone::new("m", MicroAmount(100), ApprovalType::Manual),
            )
            .await
            .unwrap();
        engine.start_milestone(&owner(), &milestone.id).await.unwrap();

        let err = engine.cancel_pool(&owner(), &pool.id).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE_TRANSITION");

        engine.submit_milestone(&owner(), &milestone.id, Vec::new()).await.unwrap();
        let cancelled = engine.cancel_pool(&owner(), &pool.id).await.unwrap();
        assert_eq!(cancelled.status, PoolStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_release_payouts_and_failed_settlement_retry() {
        let gateway = Arc::new(Recorder::default());
        gateway.fail.store(true, Ordering::SeqCst);
        let engine = BudgetEngine::new().with_settlement(gateway.clone());
        let pool = active_pool(&engine, 1_000_000).await;

        let milestone = engine
            .create_milestone(
                &owner(),
                &pool.id,
                CreateMilestone::new("team", MicroAmount(1_000_000), ApprovalType::Manual)
                    .with_participants(vec![
                        Participant::new("lead", "lead").with_share(5000),
                        Participant::new("dev-1", "developer"),
                        Participant::new("dev-2", "developer"),
                        Participant::new("dev-3", "developer"),
                    ]),
            )
            .await
            .unwrap();
        let participant = UserId::from_raw("dev-1");
        engine.start_milestone(&participant, &milestone.id).await.unwrap();
        engine.submit_milestone(&participant, &milestone.id, Vec::new()).await.unwrap();
        assert!(engine
            .approve_milestone(&participant, &milestone.id, approve(None))
            .await
            .is_err());
        engine.approve_milestone(&owner(), &milestone.id, approve(None)).await.unwrap();

        let released = engine.release_milestone(&owner(), &milestone.id).await.unwrap();
        assert_eq!(released.status, MilestoneStatus::Released);
        assert!(matches!(released.settlement, Some(SettlementStatus::Failed { .. })));
        let amounts: Vec<u128> = released.payouts.iter().map(|p| p.amount.0).collect();
        assert_eq!(amounts, vec![500_000, 166_800, 166_600, 166_600]);

        // Local release stands
        let pool_after = engine.get_pool(&pool.id).await.unwrap();
        assert_eq!(pool_after.released_amount, MicroAmount(1_000_000));
        assert_eq!(pool_after.status, PoolStatus::Depleted);

        gateway.fail.store(false, Ordering::SeqCst);
        let retried = engine.retry_settlement(&owner(), &milestone.id).await.unwrap();
        assert!(matches!(retried.settlement, Some(SettlementStatus::Settled { .. })));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);

        assert!(engine.retry_settlement(&owner(), &milestone.id).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_settlement_retries_settle_once() {
        let gateway = Arc::new(Recorder::default());
        gateway.fail.store(true, Ordering::SeqCst);
        let engine = BudgetEngine::new().with_settlement(gateway.clone());
        let pool = active_pool(&engine, 1_000).await;

        let milestone = engine
            .create_milestone(
                &owner(),
                &pool.id,
                CreateMilestone::new("m", MicroAmount(1_000), ApprovalType::Manual)
                    .with_participants(vec![Participant::new("dev", "developer")]),
            )
            .await
            .unwrap();
        to_review(&engine, &milestone.id).await;
        engine.approve_milestone(&owner(), &milestone.id, approve(None)).await.unwrap();
        let released = engine.release_milestone(&owner(), &milestone.id).await.unwrap();
        assert!(matches!(released.settlement, Some(SettlementStatus::Failed { .. })));

        gateway.fail.store(false, Ordering::SeqCst);
        let retries = (0..5).map(|_| {
            let engine = engine.clone();
            let id = milestone.id.clone();
            tokio::spawn(async move { engine.retry_settlement(&owner(), &id).await })
        });
        let results: Vec<Result<Milestone>> = join_all(retries)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.error_code() == "INVALID_STATE_TRANSITION"));
        // one failed attempt at release plus exactly one retry
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);

        let stored = engine.get_milestone(&milestone.id).await.unwrap();
        assert!(matches!(stored.settlement, Some(SettlementStatus::Settled { .. })));
    }

    #[tokio::test]
    async fn test_only_owner_and_participants_may_act() {
        let engine = BudgetEngine::new();
        let pool = active_pool(&engine, 1_000).await;
        let stranger = UserId::from_raw("stranger");

        let err = engine
            .create_milestone(
                &stranger,
                &pool.id,
                CreateMilestone::new("m", MicroAmount(100), ApprovalType::Manual),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");

        let milestone = engine
            .create_milestone(
                &owner(),
                &pool.id,
                CreateMilestone::new("m", MicroAmount(100), ApprovalType::Manual),
            )
            .await
            .unwrap();
        let err = engine.start_milestone(&stranger, &milestone.id).await.unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_expire_due_pools() {
        let engine = BudgetEngine::new();
        let now = Utc::now();
        let pool = engine
            .create_pool(
                &owner(),
                CreatePool {
                    name: "short".to_string(),
                    description: None,
                    currency: "USDC".to_string(),
                    total_budget: MicroAmount(1_000),
                    funding_source: FundingSource::Credit,
                    split_plan_id: None,
                    expires_at: Some(now + Duration::hours(1)),
                },
            )
            .await
            .unwrap();

        assert!(engine.expire_due_pools(now).await.is_empty());
        assert_eq!(engine.expire_due_pools(now + Duration::hours(2)).await, vec![pool.id.clone()]);
        assert_eq!(engine.get_pool(&pool.id).await.unwrap().status, PoolStatus::Expired);

        let err = engine
            .fund_pool(
                &owner(),
                &pool.id,
                FundPool {
                    amount: MicroAmount(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE_TRANSITION");
    }

    #[tokio::test]
    async fn test_list_milestones_by_sort_order() {
        let engine = BudgetEngine::new();
        let pool = active_pool(&engine, 1_000).await;
        for (title, order) in [("third", 3), ("first", 1), ("second", 2)] {
            engine
                .create_milestone(
                    &owner(),
                    &pool.id,
                    CreateMilestone::new(title, MicroAmount(100), ApprovalType::Manual)
                        .with_sort_order(order),
                )
                .await
                .unwrap();
        }
        let titles: Vec<String> = engine
            .list_milestones(&pool.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.title)
            .collect();
        assert_eq!(titles, vec!["first", "second", "third"]);
    }

    struct HexProofVerifier;

    #[async_trait]
    impl FundingVerifier for HexProofVerifier {
        async fn verify(&self, _pool: &BudgetPool, proof: &str, _amount: MicroAmount) -> Result<bool> {
            Ok(proof.starts_with("0x"))
        }
    }

    #[tokio::test]
    async fn test_funding_proof_is_verified() {
        let engine = BudgetEngine::new().with_funding_verifier(Arc::new(HexProofVerifier));
        let pool = engine
            .create_pool(
                &owner(),
                CreatePool {
                    name: "wallet".to_string(),
                    description: None,
                    currency: "USDC".to_string(),
                    total_budget: MicroAmount(1_000),
                    funding_source: FundingSource::Wallet,
                    split_plan_id: None,
                    expires_at: None,
                },
            )
            .await
            .unwrap();

        let bad = FundPool {
            amount: MicroAmount(1_000),
            wallet_address: Some("0xwallet".to_string()),
            proof: Some("forged".to_string()),
            ..Default::default()
        };
        assert!(engine.fund_pool(&owner(), &pool.id, bad).await.is_err());
        assert_eq!(engine.get_pool(&pool.id).await.unwrap().funded_amount, MicroAmount::ZERO);

        let good = FundPool {
            amount: MicroAmount(1_000),
            wallet_address: Some("0xwallet".to_string()),
            proof: Some("0xfeed".to_string()),
            ..Default::default()
        };
        let funded = engine.fund_pool(&owner(), &pool.id, good).await.unwrap();
        assert_eq!(funded.status, PoolStatus::Active);
        assert_eq!(funded.funding_proof.as_deref(), Some("0xfeed"));
    }
}
