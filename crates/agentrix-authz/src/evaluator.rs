//! Policy evaluator
//!
//! Decides whether an agent may execute one candidate payment. Grants are
//! tried newest first; each runs the ordered checks below and stops at the
//! first failure:
//!
//! 1. expiry
//! 2. merchant scope
//! 3. category scope
//! 4. single-transaction limit
//! 5. daily limit (usage derived from completed payments)
//! 6. monthly limit
//! 7. custom policies and registered checks
//!
//! Evaluation never moves counters.

use std::fmt;
use std::sync::Arc;

use agentrix_types::{AgentId, AgentrixError, AuthorizationId, MerchantId, Result, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::authorization::Authorization;
use crate::policy::{CustomPolicy, PolicyCheck, PolicyContext};
use crate::registry::AuthorizationRegistry;
use crate::store::PolicyStore;
use crate::usage::{UsageAggregator, UsageSnapshot};

/// Optional payment context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub category: Option<String>,
    pub product_id: Option<String>,
    pub order_id: Option<String>,
    pub channel: Option<String>,
}

/// A candidate payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub amount: Decimal,
    pub merchant_id: MerchantId,
    #[serde(default)]
    pub context: EvaluationContext,
}

/// Machine-readable decision reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "policy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    Authorized,
    NoActiveAuthorization,
    NoMatchingAuthorization,
    AuthorizationExpired,
    MerchantNotInScope,
    CategoryNotInScope,
    ExceedsSingleTxLimit,
    ExceedsDailyLimit,
    ExceedsMonthlyLimit,
    /// Carries the failing policy's name
    PolicyViolation(String),
}

impl DecisionReason {
    pub fn code(&self) -> String {
        match self {
            Self::Authorized => "AUTHORIZED".into(),
            Self::NoActiveAuthorization => "NO_ACTIVE_AUTHORIZATION".into(),
            Self::NoMatchingAuthorization => "NO_MATCHING_AUTHORIZATION".into(),
            Self::AuthorizationExpired => "AUTHORIZATION_EXPIRED".into(),
            Self::MerchantNotInScope => "MERCHANT_NOT_IN_SCOPE".into(),
            Self::CategoryNotInScope => "CATEGORY_NOT_IN_SCOPE".into(),
            Self::ExceedsSingleTxLimit => "EXCEEDS_SINGLE_TX_LIMIT".into(),
            Self::ExceedsDailyLimit => "EXCEEDS_DAILY_LIMIT".into(),
            Self::ExceedsMonthlyLimit => "EXCEEDS_MONTHLY_LIMIT".into(),
            Self::PolicyViolation(name) => format!("POLICY_VIOLATION: {}", name),
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

/// What the caller should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    AutoExecute,
    UserConfirmation,
    Deny,
}

/// One check run against one grant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckTrace {
    pub check: String,
    pub passed: bool,
    pub detail: Option<String>,
}

/// Everything tried against one grant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationTrace {
    pub authorization_id: AuthorizationId,
    pub checks: Vec<CheckTrace>,
    /// Reason the grant was rejected; `None` if it cleared every check
    pub failure: Option<DecisionReason>,
}

/// Outcome of an evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub authorized: bool,
    pub authorization_id: Option<AuthorizationId>,
    pub reason: DecisionReason,
    pub suggested_action: SuggestedAction,
    pub usage: UsageSnapshot,
    pub trace: Vec<AuthorizationTrace>,
    pub evaluated_at: DateTime<Utc>,
}

impl Decision {
    fn denied(
        reason: DecisionReason,
        usage: UsageSnapshot,
        trace: Vec<AuthorizationTrace>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            authorized: false,
            authorization_id: None,
            reason,
            suggested_action: SuggestedAction::UserConfirmation,
            usage,
            trace,
            evaluated_at: now,
        }
    }
}

/// Remaining allowance for UI display; `None` means unlimited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headroom {
    pub has_active_auth: bool,
    pub daily_remaining: Option<Decimal>,
    pub monthly_remaining: Option<Decimal>,
    pub single_limit: Option<Decimal>,
}

struct NamedCheck {
    name: String,
    check: Arc<dyn PolicyCheck>,
}

/// Step-wise trace builder for one grant
struct GrantRun {
    checks: Vec<CheckTrace>,
}

impl GrantRun {
    fn record(&mut self, check: &str, passed: bool, detail: Option<String>) -> bool {
        debug!(check, passed, detail = ?detail, "Authorization check");
        self.checks.push(CheckTrace {
            check: check.to_string(),
            passed,
            detail,
        });
        passed
    }
}

fn limit_detail(limit: Decimal, used: Decimal) -> String {
    format!(
        "limit={} used={} remaining={}",
        limit,
        used,
        (limit - used).max(Decimal::ZERO)
    )
}

fn remaining(limit: Option<Decimal>, used: Decimal) -> Option<Decimal> {
    limit.map(|l| (l - used).max(Decimal::ZERO))
}

/// The Agentrix policy evaluator
#[derive(Clone)]
pub struct PolicyEvaluator {
    registry: AuthorizationRegistry,
    aggregator: UsageAggregator,
    policies: Arc<dyn PolicyStore>,
    extra_checks: Vec<Arc<NamedCheck>>,
}

impl PolicyEvaluator {
    pub fn new(
        registry: AuthorizationRegistry,
        aggregator: UsageAggregator,
        policies: Arc<dyn PolicyStore>,
    ) -> Self {
        Self {
            registry,
            aggregator,
            policies,
            extra_checks: Vec::new(),
        }
    }

    /// Register a check that runs after the user's stored policies
    pub fn with_check(mut self, name: impl Into<String>, check: Arc<dyn PolicyCheck>) -> Self {
        self.extra_checks.push(Arc::new(NamedCheck {
            name: name.into(),
            check,
        }));
        self
    }

    pub fn registry(&self) -> &AuthorizationRegistry {
        &self.registry
    }

    pub fn aggregator(&self) -> &UsageAggregator {
        &self.aggregator
    }

    pub async fn evaluate(&self, request: &EvaluationRequest) -> Result<Decision> {
        self.evaluate_at(request, Utc::now()).await
    }

    pub async fn evaluate_at(&self, request: &EvaluationRequest, now: DateTime<Utc>) -> Result<Decision> {
        if request.amount <= Decimal::ZERO {
            return Err(AgentrixError::invalid_input("amount", "must be positive"));
        }
        if request.merchant_id.as_str().is_empty() {
            return Err(AgentrixError::invalid_input("merchant_id", "required"));
        }

        let grants = self
            .registry
            .active_for(&request.user_id, &request.agent_id)
            .await?;
        let usage = self
            .aggregator
            .snapshot(&request.user_id, Some(&request.agent_id), now)
            .await?;

        if grants.is_empty() {
            info!(
                user_id = %request.user_id,
                agent_id = %request.agent_id,
                "No active authorization"
            );
            return Ok(Decision::denied(
                DecisionReason::NoActiveAuthorization,
                usage,
                Vec::new(),
                now,
            ));
        }

        let policies = self.policies.enabled_for_user(&request.user_id).await?;
        let ctx = PolicyContext {
            amount: request.amount,
            merchant_id: request.merchant_id.clone(),
            category: request.context.category.clone(),
            product_id: request.context.product_id.clone(),
            channel: request.context.channel.clone(),
            used_today: usage.used_today,
            used_this_month: usage.used_this_month,
        };

        // An agent-wide grant is spent by every agent of the user
        let mut user_usage = None;

        let mut trace = Vec::with_capacity(grants.len());
        for grant in &grants {
            let grant_usage = match grant.agent_id {
                Some(_) => usage,
                None => match user_usage {
                    Some(u) => u,
                    None => {
                        let u = self.aggregator.snapshot(&request.user_id, None, now).await?;
                        user_usage = Some(u);
                        u
                    }
                },
            };
            let ctx = PolicyContext {
                used_today: grant_usage.used_today,
                used_this_month: grant_usage.used_this_month,
                ..ctx.clone()
            };
            let (failure, checks) = self.run_checks(grant, request, &ctx, &policies, grant_usage, now);

            if failure == Some(DecisionReason::AuthorizationExpired) {
                if let Err(e) = self.registry.mark_expired(&grant.id).await {
                    warn!(authorization_id = %grant.id, error = %e, "Failed to mark authorization expired");
                }
            }

            let authorized = failure.is_none();
            trace.push(AuthorizationTrace {
                authorization_id: grant.id.clone(),
                checks,
                failure,
            });

            if authorized {
                info!(
                    user_id = %request.user_id,
                    agent_id = %request.agent_id,
                    authorization_id = %grant.id,
                    amount = %request.amount,
                    "Payment authorized"
                );
                return Ok(Decision {
                    authorized: true,
                    authorization_id: Some(grant.id.clone()),
                    reason: DecisionReason::Authorized,
                    suggested_action: SuggestedAction::AutoExecute,
                    usage: grant_usage,
                    trace,
                    evaluated_at: now,
                });
            }
        }

        // A lone grant reports its own failure; otherwise the per-grant
        // reasons stay in the trace
        let reason = match trace.as_slice() {
            [only] => only
                .failure
                .clone()
                .unwrap_or(DecisionReason::NoMatchingAuthorization),
            _ => DecisionReason::NoMatchingAuthorization,
        };

        info!(
            user_id = %request.user_id,
            agent_id = %request.agent_id,
            amount = %request.amount,
            reason = %reason,
            "Payment not authorized"
        );
        Ok(Decision::denied(reason, usage, trace, now))
    }

    fn run_checks(
        &self,
        grant: &Authorization,
        request: &EvaluationRequest,
        ctx: &PolicyContext,
        policies: &[CustomPolicy],
        usage: UsageSnapshot,
        now: DateTime<Utc>,
    ) -> (Option<DecisionReason>, Vec<CheckTrace>) {
        let mut run = GrantRun { checks: Vec::new() };

        let expired = grant.is_expired_at(now);
        if !run.record(
            "expiry",
            !expired,
            grant.expires_at.map(|exp| format!("expires_at={}", exp.to_rfc3339())),
        ) {
            return (Some(DecisionReason::AuthorizationExpired), run.checks);
        }

        if !run.record(
            "merchant_scope",
            grant.merchant_in_scope(&request.merchant_id),
            Some(format!("merchant={}", request.merchant_id)),
        ) {
            return (Some(DecisionReason::MerchantNotInScope), run.checks);
        }

        let category = request.context.category.as_deref();
        if !run.record(
            "category_scope",
            grant.category_in_scope(category),
            category.map(|c| format!("category={}", c)),
        ) {
            return (Some(DecisionReason::CategoryNotInScope), run.checks);
        }

        if let Some(limit) = grant.single_tx_limit {
            if !run.record(
                "single_limit",
                request.amount <= limit,
                Some(format!("limit={} amount={}", limit, request.amount)),
            ) {
                return (Some(DecisionReason::ExceedsSingleTxLimit), run.checks);
            }
        }

        if let Some(limit) = grant.daily_limit {
            if !run.record(
                "daily_limit",
                usage.used_today + request.amount <= limit,
                Some(limit_detail(limit, usage.used_today)),
            ) {
                return (Some(DecisionReason::ExceedsDailyLimit), run.checks);
            }
        }

        if let Some(limit) = grant.monthly_limit {
            if !run.record(
                "monthly_limit",
                usage.used_this_month + request.amount <= limit,
                Some(limit_detail(limit, usage.used_this_month)),
            ) {
                return (Some(DecisionReason::ExceedsMonthlyLimit), run.checks);
            }
        }

        let mut custom: Vec<(&str, &dyn PolicyCheck)> =
            Vec::with_capacity(policies.len() + self.extra_checks.len());
        for policy in policies {
            custom.push((policy.name.as_str(), &policy.rule));
        }
        for registered in &self.extra_checks {
            custom.push((registered.name.as_str(), registered.check.as_ref()));
        }

        for (name, check) in custom {
            let outcome = check.check(ctx);
            if !run.record(
                &format!("policy:{}:{}", check.kind(), name),
                outcome.passed,
                outcome.detail,
            ) {
                return (Some(DecisionReason::PolicyViolation(name.to_string())), run.checks);
            }
        }

        (None, run.checks)
    }

    /// Remaining headroom of the newest active, unexpired grant
    pub async fn quick_evaluation(&self, user: &UserId, agent: &AgentId) -> Result<Headroom> {
        let now = Utc::now();
        let grant = self
            .registry
            .active_for(user, agent)
            .await?
            .into_iter()
            .find(|g| !g.is_expired_at(now));

        let Some(grant) = grant else {
            return Ok(Headroom {
                has_active_auth: false,
                daily_remaining: Some(Decimal::ZERO),
                monthly_remaining: Some(Decimal::ZERO),
                single_limit: Some(Decimal::ZERO),
            });
        };

        let usage = self
            .aggregator
            .snapshot(user, grant.agent_id.as_ref().map(|_| agent), now)
            .await?;
        Ok(Headroom {
            has_active_auth: true,
            daily_remaining: remaining(grant.daily_limit, usage.used_today),
            monthly_remaining: remaining(grant.monthly_limit, usage.used_this_month),
            single_limit: grant.single_tx_limit,
        })
    }
}
