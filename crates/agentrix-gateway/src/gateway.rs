//! Agent payment gateway

use std::sync::Arc;

use agentrix_audit::{AuditAction, AuditLedger, DecisionLog, ProofSubject};
use agentrix_authz::{
    CompletedPayment, Decision, EvaluationContext, EvaluationRequest, PaymentStatus,
    PolicyEvaluator,
};
use agentrix_types::{
    verify_signature, AgentId, AgentrixError, AuthorizationId, ConfirmationId, EngineConfig,
    MerchantId, PaymentId, PaymentIntentId, ProofId, Result, UserId,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::confirmation::{ConfirmationStatus, PendingConfirmation};
use crate::executor::{ExecutionReceipt, PaymentExecutor, PaymentOrder};

/// Ed25519 signature over `AgentPaymentRequest::signing_payload`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSignature {
    pub public_key: String,
    pub signature: String,
}

/// A payment an agent wants to make
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPaymentRequest {
    pub payment_intent_id: PaymentIntentId,
    /// Repeats with the same key return the first outcome
    pub idempotency_key: Option<String>,
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub merchant_id: MerchantId,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub context: EvaluationContext,
    pub signature: Option<RequestSignature>,
}

/// Signed fields; field order is part of the format
#[derive(Serialize)]
struct SigningPayload<'a> {
    payment_intent_id: &'a PaymentIntentId,
    user_id: &'a UserId,
    agent_id: &'a AgentId,
    merchant_id: &'a MerchantId,
    amount: &'a Decimal,
    currency: &'a str,
}

impl AgentPaymentRequest {
    /// Canonical bytes a caller signs
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&SigningPayload {
            payment_intent_id: &self.payment_intent_id,
            user_id: &self.user_id,
            agent_id: &self.agent_id,
            merchant_id: &self.merchant_id,
            amount: &self.amount,
            currency: &self.currency,
        })?)
    }

    fn order(&self, authorization_id: Option<AuthorizationId>) -> PaymentOrder {
        PaymentOrder {
            payment_intent_id: self.payment_intent_id.clone(),
            user_id: self.user_id.clone(),
            agent_id: self.agent_id.clone(),
            merchant_id: self.merchant_id.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            authorization_id,
        }
    }

    fn subject(&self) -> ProofSubject {
        ProofSubject::new(self.payment_intent_id.clone()).with_agent(self.agent_id.clone())
    }

    fn signature_hex(&self) -> Option<String> {
        self.signature.as_ref().map(|s| s.signature.clone())
    }
}

/// What happened to a payment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// `proof_id` is `None` when the audit append failed after the money moved
    Executed {
        payment_id: PaymentId,
        authorization_id: Option<AuthorizationId>,
        reference: Option<String>,
        proof_id: Option<ProofId>,
    },
    /// Held for the user; `reason` is the decision code that caused it
    PendingConfirmation {
        confirmation_id: ConfirmationId,
        reason: String,
        expires_at: DateTime<Utc>,
        proof_id: ProofId,
    },
    /// Cleared but the executor reported failure
    Failed { reason: String, proof_id: ProofId },
    /// Refused outright; never downgraded
    Denied {
        code: String,
        reason: String,
        proof_id: ProofId,
    },
}

impl PaymentOutcome {
    pub fn proof_id(&self) -> Option<&ProofId> {
        match self {
            Self::Executed { proof_id, .. } => proof_id.as_ref(),
            Self::PendingConfirmation { proof_id, .. }
            | Self::Failed { proof_id, .. }
            | Self::Denied { proof_id, .. } => Some(proof_id),
        }
    }

    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed { .. })
    }
}

struct CachedOutcome {
    outcome: PaymentOutcome,
    expires_at: DateTime<Utc>,
}

type IdempotencySlot = Arc<Mutex<Option<CachedOutcome>>>;

/// The Agentrix agent payment gateway
#[derive(Clone)]
pub struct AgentPaymentGateway {
    evaluator: PolicyEvaluator,
    ledger: Arc<AuditLedger>,
    executor: Arc<dyn PaymentExecutor>,
    confirmation_ttl: Duration,
    idempotency_ttl: Duration,
    require_signature: bool,
    idempotency: Arc<DashMap<String, IdempotencySlot>>,
    confirmations: Arc<DashMap<ConfirmationId, PendingConfirmation>>,
}

impl AgentPaymentGateway {
    pub fn new(
        evaluator: PolicyEvaluator,
        ledger: Arc<AuditLedger>,
        executor: Arc<dyn PaymentExecutor>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            evaluator,
            ledger,
            executor,
            confirmation_ttl: config.confirmation_ttl(),
            idempotency_ttl: config.idempotency_ttl(),
            require_signature: false,
            idempotency: Arc::new(DashMap::new()),
            confirmations: Arc::new(DashMap::new()),
        }
    }

    /// Refuse unsigned requests
    pub fn with_required_signatures(mut self) -> Self {
        self.require_signature = true;
        self
    }

    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub async fn execute(&self, request: AgentPaymentRequest) -> Result<PaymentOutcome> {
        self.execute_at(request, Utc::now()).await
    }

    /// Run an agent payment through the gateway
    ///
    /// Policy denials are outcomes, not errors. Errors mean the request
    /// could not be processed (bad input, storage failure) and are never
    /// cached under the idempotency key.
    pub async fn execute_at(&self, request: AgentPaymentRequest, now: DateTime<Utc>) -> Result<PaymentOutcome> {
        self.prune_at(now);
        let Some(key) = request.idempotency_key.clone() else {
            return self.process(request, now).await;
        };

        let slot = self
            .idempotency
            .entry(format!("{}:{}", request.user_id, key))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut cached = slot.lock().await;
        if let Some(entry) = cached.as_ref() {
            if now < entry.expires_at {
                info!(idempotency_key = %key, "Replaying cached payment outcome");
                return Ok(entry.outcome.clone());
            }
        }

        let outcome = self.process(request, now).await?;
        *cached = Some(CachedOutcome {
            outcome: outcome.clone(),
            expires_at: now + self.idempotency_ttl,
        });
        Ok(outcome)
    }

    /// Drop replay entries past their TTL and confirmations that have
    /// been settled or expired for longer than the same TTL
    ///
    /// A slot someone else still holds is kept: it is either in flight or
    /// about to be.
    pub fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.idempotency.len() + self.confirmations.len();

        self.idempotency.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(cached) => cached.as_ref().map_or(false, |entry| now < entry.expires_at),
                Err(_) => true,
            }
        });
        let retention = self.idempotency_ttl;
        self.confirmations.retain(|_, pending| {
            pending.status == ConfirmationStatus::Processing || now < pending.expires_at + retention
        });

        let pruned = before.saturating_sub(self.idempotency.len() + self.confirmations.len());
        if pruned > 0 {
            debug!(pruned, "Pruned gateway caches");
        }
        pruned
    }

    /// The payment already moved; an audit failure is logged, never returned
    async fn audit_executed(
        &self,
        subject: ProofSubject,
        log: DecisionLog,
        signature: Option<String>,
        payment_id: &PaymentId,
    ) -> Option<ProofId> {
        match self.ledger.append(subject, log, signature).await {
            Ok(proof) => Some(proof.id),
            Err(e) => {
                warn!(payment_id = %payment_id, error = %e, "Executed payment could not be audited");
                None
            }
        }
    }

    fn verify_request(&self, request: &AgentPaymentRequest) -> Result<()> {
        match &request.signature {
            Some(sig) => verify_signature(&sig.public_key, &request.signing_payload()?, &sig.signature)
                .map_err(|e| match e {
                    AgentrixError::InvalidSignature { .. } => e,
                    other => AgentrixError::InvalidSignature {
                        reason: other.to_string(),
                    },
                }),
            None if self.require_signature => Err(AgentrixError::InvalidSignature {
                reason: "signature required".to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn process(&self, request: AgentPaymentRequest, now: DateTime<Utc>) -> Result<PaymentOutcome> {
        if let Err(e) = self.verify_request(&request) {
            warn!(
                payment_intent_id = %request.payment_intent_id,
                agent_id = %request.agent_id,
                error = %e,
                "Agent payment signature rejected"
            );
            let log = DecisionLog::new(AuditAction::AgentExecutePaymentFailed, e.error_code())
                .with_evaluation(json!({ "error": e.to_string() }));
            let proof = self
                .ledger
                .append(request.subject(), log, request.signature_hex())
                .await?;
            return Ok(PaymentOutcome::Denied {
                code: e.error_code().to_string(),
                reason: e.to_string(),
                proof_id: proof.id,
            });
        }

        let evaluation = EvaluationRequest {
            user_id: request.user_id.clone(),
            agent_id: request.agent_id.clone(),
            amount: request.amount,
            merchant_id: request.merchant_id.clone(),
            context: request.context.clone(),
        };
        let decision = self.evaluator.evaluate_at(&evaluation, now).await?;

        let authorization_id = match (&decision.authorization_id, decision.authorized) {
            (Some(id), true) => id.clone(),
            _ => {
                let reason = decision.reason.code();
                return self.downgrade(request, reason, &decision, now).await;
            }
        };

        // The grant's counters are the atomic guard: a payment that lost a
        // race for the last headroom is downgraded instead of executed.
        match self
            .evaluator
            .registry()
            .record_usage_at(&authorization_id, request.amount, now)
            .await
        {
            Ok(_) => {}
            Err(e @ (AgentrixError::LimitExceeded { .. } | AgentrixError::InvalidStateTransition { .. })) => {
                info!(
                    authorization_id = %authorization_id,
                    error = %e,
                    "Grant no longer covers the payment, downgrading"
                );
                return self
                    .downgrade(request, e.error_code().to_string(), &decision, now)
                    .await;
            }
            Err(e) => return Err(e),
        }

        self.execute_authorized(request, authorization_id, &decision, now)
            .await
    }

    async fn execute_authorized(
        &self,
        request: AgentPaymentRequest,
        authorization_id: AuthorizationId,
        decision: &Decision,
        charged_at: DateTime<Utc>,
    ) -> Result<PaymentOutcome> {
        let order = request.order(Some(authorization_id.clone()));
        let subject = request.subject().with_authorization(authorization_id.clone());
        let evaluation = serde_json::to_value(decision)?;

        match self.executor.execute(&order).await {
            Ok(receipt) => {
                self.record_completed(&order, &receipt).await;
                let log = DecisionLog::new(AuditAction::AgentExecutePaymentSuccess, decision.reason.code())
                    .with_evaluation(evaluation);
                let proof_id = self
                    .audit_executed(subject, log, request.signature_hex(), &receipt.payment_id)
                    .await;

                info!(
                    payment_id = %receipt.payment_id,
                    authorization_id = %authorization_id,
                    amount = %order.amount,
                    "Agent payment executed"
                );
                Ok(PaymentOutcome::Executed {
                    payment_id: receipt.payment_id,
                    authorization_id: Some(authorization_id),
                    reference: receipt.reference,
                    proof_id,
                })
            }
            Err(e) => {
                warn!(
                    payment_intent_id = %order.payment_intent_id,
                    authorization_id = %authorization_id,
                    error = %e,
                    "Agent payment execution failed"
                );
                if let Err(reverse_err) = self
                    .evaluator
                    .registry()
                    .reverse_usage(&authorization_id, order.amount, charged_at)
                    .await
                {
                    warn!(authorization_id = %authorization_id, error = %reverse_err, "Could not reverse usage");
                }

                let log = DecisionLog::new(AuditAction::AgentExecutePaymentFailed, e.error_code())
                    .with_evaluation(json!({ "decision": evaluation, "error": e.to_string() }));
                let proof = self.ledger.append(subject, log, request.signature_hex()).await?;
                Ok(PaymentOutcome::Failed {
                    reason: e.to_string(),
                    proof_id: proof.id,
                })
            }
        }
    }

    async fn downgrade(
        &self,
        request: AgentPaymentRequest,
        reason: String,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> Result<PaymentOutcome> {
        let log = DecisionLog::new(AuditAction::DowngradeToUserConfirmation, reason.clone())
            .with_evaluation(serde_json::to_value(decision)?);
        let proof = self
            .ledger
            .append(request.subject(), log, request.signature_hex())
            .await?;

        let pending = PendingConfirmation {
            id: ConfirmationId::new(),
            request,
            reason: reason.clone(),
            status: ConfirmationStatus::Pending,
            created_at: now,
            expires_at: now + self.confirmation_ttl,
        };
        let confirmation_id = pending.id.clone();
        let expires_at = pending.expires_at;
        info!(
            confirmation_id = %confirmation_id,
            agent_id = %pending.request.agent_id,
            reason = %reason,
            "Agent payment downgraded to user confirmation"
        );
        self.confirmations.insert(confirmation_id.clone(), pending);

        Ok(PaymentOutcome::PendingConfirmation {
            confirmation_id,
            reason,
            expires_at,
            proof_id: proof.id,
        })
    }

    /// The execution already happened; a history write failure must not hide it
    async fn record_completed(&self, order: &PaymentOrder, receipt: &ExecutionReceipt) {
        let payment = CompletedPayment {
            id: receipt.payment_id.clone(),
            user_id: order.user_id.clone(),
            agent_id: Some(order.agent_id.clone()),
            authorization_id: order.authorization_id.clone(),
            merchant_id: order.merchant_id.clone(),
            amount: order.amount,
            status: PaymentStatus::Completed,
            completed_at: receipt.completed_at,
        };
        if let Err(e) = self.evaluator.aggregator().history().record(payment).await {
            warn!(payment_id = %receipt.payment_id, error = %e, "Could not record completed payment");
        }
    }

    pub async fn confirm(&self, user: &UserId, id: &ConfirmationId) -> Result<PaymentOutcome> {
        self.confirm_at(user, id, Utc::now()).await
    }

    /// Execute a downgraded payment on the user's explicit approval
    pub async fn confirm_at(
        &self,
        user: &UserId,
        id: &ConfirmationId,
        now: DateTime<Utc>,
    ) -> Result<PaymentOutcome> {
        let pending = {
            let mut entry = self
                .confirmations
                .get_mut(id)
                .ok_or_else(|| AgentrixError::not_found("confirmation", id))?;
            if &entry.request.user_id != user {
                return Err(AgentrixError::forbidden("confirmation", id, user));
            }
            if entry.status != ConfirmationStatus::Pending {
                return Err(AgentrixError::invalid_transition(
                    "confirmation",
                    id,
                    entry.status,
                    "confirm",
                ));
            }
            if entry.is_expired_at(now) {
                entry.status = ConfirmationStatus::Expired;
                info!(confirmation_id = %id, "Confirmation expired");
                return Err(AgentrixError::ConfirmationExpired {
                    confirmation_id: id.to_string(),
                    expired_at: entry.expires_at.to_rfc3339(),
                });
            }
            entry.status = ConfirmationStatus::Processing;
            entry.clone()
        };

        let request = &pending.request;
        let order = request.order(None);
        let evaluation = json!({
            "confirmation_id": id,
            "downgrade_reason": pending.reason,
        });

        let (status, outcome) = match self.executor.execute(&order).await {
            Ok(receipt) => {
                self.record_completed(&order, &receipt).await;
                let log = DecisionLog::new(AuditAction::UserConfirmedPayment, pending.reason.clone())
                    .with_evaluation(evaluation);
                let proof_id = self
                    .audit_executed(request.subject(), log, request.signature_hex(), &receipt.payment_id)
                    .await;
                info!(confirmation_id = %id, payment_id = %receipt.payment_id, "User confirmed payment executed");
                (
                    ConfirmationStatus::Confirmed,
                    Ok(PaymentOutcome::Executed {
                        payment_id: receipt.payment_id,
                        authorization_id: None,
                        reference: receipt.reference,
                        proof_id,
                    }),
                )
            }
            Err(e) => {
                warn!(confirmation_id = %id, error = %e, "User confirmed payment failed");
                let log = DecisionLog::new(AuditAction::AgentExecutePaymentFailed, e.error_code())
                    .with_evaluation(json!({ "confirmation": evaluation, "error": e.to_string() }));
                let outcome = self
                    .ledger
                    .append(request.subject(), log, request.signature_hex())
                    .await
                    .map(|proof| PaymentOutcome::Failed {
                        reason: e.to_string(),
                        proof_id: proof.id,
                    });
                (ConfirmationStatus::Failed, outcome)
            }
        };

        // Never left in Processing, even when the audit append failed
        if let Some(mut entry) = self.confirmations.get_mut(id) {
            entry.status = status;
        }
        outcome
    }

    pub fn get_confirmation(&self, id: &ConfirmationId) -> Result<PendingConfirmation> {
        self.confirmations
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| AgentrixError::not_found("confirmation", id))
    }

    /// Confirmations still waiting on `user`, oldest first
    pub fn pending_confirmations(&self, user: &UserId) -> Vec<PendingConfirmation> {
        let mut pending: Vec<PendingConfirmation> = self
            .confirmations
            .iter()
            .filter(|entry| &entry.request.user_id == user && entry.status == ConfirmationStatus::Pending)
            .map(|entry| entry.clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }
}
