//! Audit proof records

use agentrix_types::{
    hash_object, AgentId, AuthorizationId, PaymentIntentId, ProofId, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Previous-hash of the first record in every chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Action tag of a decision log
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AuditAction {
    AgentExecutePaymentSuccess,
    AgentExecutePaymentFailed,
    DowngradeToUserConfirmation,
    UserConfirmedPayment,
    Custom(String),
}

impl AuditAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentExecutePaymentSuccess => "AGENT_EXECUTE_PAYMENT_SUCCESS",
            Self::AgentExecutePaymentFailed => "AGENT_EXECUTE_PAYMENT_FAILED",
            Self::DowngradeToUserConfirmation => "DOWNGRADE_TO_USER_CONFIRMATION",
            Self::UserConfirmedPayment => "USER_CONFIRMED_PAYMENT",
            Self::Custom(tag) => tag,
        }
    }
}

impl From<String> for AuditAction {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "AGENT_EXECUTE_PAYMENT_SUCCESS" => Self::AgentExecutePaymentSuccess,
            "AGENT_EXECUTE_PAYMENT_FAILED" => Self::AgentExecutePaymentFailed,
            "DOWNGRADE_TO_USER_CONFIRMATION" => Self::DowngradeToUserConfirmation,
            "USER_CONFIRMED_PAYMENT" => Self::UserConfirmedPayment,
            _ => Self::Custom(tag),
        }
    }
}

impl From<AuditAction> for String {
    fn from(action: AuditAction) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who and what a proof is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofSubject {
    pub payment_intent_id: PaymentIntentId,
    pub authorization_id: Option<AuthorizationId>,
    pub agent_id: Option<AgentId>,
}

impl ProofSubject {
    pub fn new(payment_intent_id: PaymentIntentId) -> Self {
        Self {
            payment_intent_id,
            authorization_id: None,
            agent_id: None,
        }
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_authorization(mut self, authorization_id: AuthorizationId) -> Self {
        self.authorization_id = Some(authorization_id);
        self
    }

    /// Agent id if present, else the payment-intent id
    pub fn chain_key(&self) -> String {
        match &self.agent_id {
            Some(agent) => agent.to_string(),
            None => self.payment_intent_id.to_string(),
        }
    }
}

/// The decision-log payload of a proof
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLog {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub reason: String,
    /// Snapshot of the policy evaluation that led here
    pub evaluation: serde_json::Value,
}

impl DecisionLog {
    pub fn new(action: AuditAction, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            reason: reason.into(),
            evaluation: serde_json::Value::Null,
        }
    }

    pub fn with_evaluation(mut self, evaluation: serde_json::Value) -> Self {
        self.evaluation = evaluation;
        self
    }
}

/// Canonical digest input; field order is part of the format
#[derive(Serialize)]
struct ProofHashInput<'a> {
    subject: &'a ProofSubject,
    payload: &'a DecisionLog,
    previous_proof_hash: &'a str,
    signature: Option<&'a str>,
}

/// Digest of a proof's content and chain position
pub fn compute_proof_hash(
    subject: &ProofSubject,
    payload: &DecisionLog,
    previous_proof_hash: &str,
    signature: Option<&str>,
) -> Result<String> {
    hash_object(&ProofHashInput {
        subject,
        payload,
        previous_proof_hash,
        signature,
    })
}

/// One immutable evidence record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditProof {
    pub id: ProofId,
    pub chain_key: String,
    pub subject: ProofSubject,
    pub payload: DecisionLog,
    /// Externally supplied signature over the payload
    pub signature: Option<String>,
    pub previous_proof_hash: String,
    pub proof_hash: String,
    pub created_at: DateTime<Utc>,
}

impl AuditProof {
    /// Build a proof chained onto `previous_proof_hash`
    pub fn seal(
        subject: ProofSubject,
        payload: DecisionLog,
        signature: Option<String>,
        previous_proof_hash: String,
    ) -> Result<Self> {
        let proof_hash = compute_proof_hash(
            &subject,
            &payload,
            &previous_proof_hash,
            signature.as_deref(),
        )?;
        Ok(Self {
            id: ProofId::new(),
            chain_key: subject.chain_key(),
            subject,
            payload,
            signature,
            previous_proof_hash,
            proof_hash,
            created_at: Utc::now(),
        })
    }

    pub fn recompute_hash(&self) -> Result<String> {
        compute_proof_hash(
            &self.subject,
            &self.payload,
            &self.previous_proof_hash,
            self.signature.as_deref(),
        )
    }

    /// Whether the stored hash matches the stored content
    pub fn verify(&self) -> bool {
        self.recompute_hash()
            .map(|h| h == self.proof_hash)
            .unwrap_or(false)
    }
}
