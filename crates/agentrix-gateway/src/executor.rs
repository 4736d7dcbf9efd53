//! Payment execution collaborator

use agentrix_types::{AgentId, AuthorizationId, MerchantId, PaymentId, PaymentIntentId, Result, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A payment the core has cleared for execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOrder {
    pub payment_intent_id: PaymentIntentId,
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub merchant_id: MerchantId,
    pub amount: Decimal,
    pub currency: String,
    /// Grant that cleared the payment; `None` when the user confirmed it
    pub authorization_id: Option<AuthorizationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub payment_id: PaymentId,
    /// Processor or chain reference
    pub reference: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Moves the money; an `Err` means the payment did not happen
#[async_trait]
pub trait PaymentExecutor: Send + Sync {
    async fn execute(&self, order: &PaymentOrder) -> Result<ExecutionReceipt>;
}
