//! Storage seams for grants, payment history and custom policies
//!
//! Every mutation that depends on a prior read of the same grant goes
//! through `AuthorizationStore::update`, which applies the mutation under
//! the row's write lock and commits only if it succeeds. A database-backed
//! store maps this to `SELECT ... FOR UPDATE` inside a transaction.

use std::collections::HashMap;
use std::sync::Arc;

use agentrix_types::{
    AgentId, AgentrixError, AuthorizationId, MerchantId, PaymentId, PolicyId, Result, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::authorization::Authorization;
use crate::policy::CustomPolicy;

/// A mutation applied atomically to one grant
pub type AuthorizationMutation = Box<dyn FnOnce(&mut Authorization) -> Result<()> + Send>;

// ============================================================================
// Grants
// ============================================================================

#[async_trait]
pub trait AuthorizationStore: Send + Sync {
    async fn insert(&self, authorization: Authorization) -> Result<()>;

    async fn get(&self, id: &AuthorizationId) -> Result<Option<Authorization>>;

    /// All grants of a user, newest first
    async fn list_for_user(&self, user: &UserId) -> Result<Vec<Authorization>>;

    /// Atomic read-modify-write; nothing is written if `mutate` fails
    async fn update(
        &self,
        id: &AuthorizationId,
        mutate: AuthorizationMutation,
    ) -> Result<Authorization>;
}

/// In-memory grant store
#[derive(Clone, Default)]
pub struct InMemoryAuthorizationStore {
    rows: Arc<RwLock<HashMap<AuthorizationId, Authorization>>>,
}

impl InMemoryAuthorizationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthorizationStore for InMemoryAuthorizationStore {
    async fn insert(&self, authorization: Authorization) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&authorization.id) {
            return Err(AgentrixError::invalid_input(
                "authorization.id",
                format!("{} already exists", authorization.id),
            ));
        }
        rows.insert(authorization.id.clone(), authorization);
        Ok(())
    }

    async fn get(&self, id: &AuthorizationId) -> Result<Option<Authorization>> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn list_for_user(&self, user: &UserId) -> Result<Vec<Authorization>> {
        let rows = self.rows.read().await;
        let mut grants: Vec<Authorization> = rows
            .values()
            .filter(|a| &a.user_id == user)
            .cloned()
            .collect();
        grants.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(grants)
    }

    async fn update(
        &self,
        id: &AuthorizationId,
        mutate: AuthorizationMutation,
    ) -> Result<Authorization> {
        let mut rows = self.rows.write().await;
        let current = rows
            .get(id)
            .ok_or_else(|| AgentrixError::not_found("authorization", id))?;

        let mut next = current.clone();
        mutate(&mut next)?;
        rows.insert(id.clone(), next.clone());
        Ok(next)
    }
}

// ============================================================================
// Payment History
// ============================================================================

/// Outcome of a payment as reported by the execution collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

/// One payment in the history used for usage aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedPayment {
    pub id: PaymentId,
    pub user_id: UserId,
    pub agent_id: Option<AgentId>,
    pub authorization_id: Option<AuthorizationId>,
    pub merchant_id: MerchantId,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait PaymentHistory: Send + Sync {
    async fn record(&self, payment: CompletedPayment) -> Result<()>;

    /// Sum of `completed` payments in `[from, to)`; `agent = None` spans all agents
    async fn sum_completed(
        &self,
        user: &UserId,
        agent: Option<&AgentId>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Decimal>;
}

/// In-memory payment history
#[derive(Clone, Default)]
pub struct InMemoryPaymentHistory {
    payments: Arc<RwLock<Vec<CompletedPayment>>>,
}

impl InMemoryPaymentHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.payments.read().await.len()
    }
}

#[async_trait]
impl PaymentHistory for InMemoryPaymentHistory {
    async fn record(&self, payment: CompletedPayment) -> Result<()> {
        self.payments.write().await.push(payment);
        Ok(())
    }

    async fn sum_completed(
        &self,
        user: &UserId,
        agent: Option<&AgentId>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Decimal> {
        let payments = self.payments.read().await;
        Ok(payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Completed)
            .filter(|p| &p.user_id == user)
            .filter(|p| agent.map_or(true, |a| p.agent_id.as_ref() == Some(a)))
            .filter(|p| p.completed_at >= from && p.completed_at < to)
            .map(|p| p.amount)
            .sum())
    }
}

// ============================================================================
// Custom Policies
// ============================================================================

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn insert(&self, policy: CustomPolicy) -> Result<()>;

    /// Enabled policies owned by `user`, oldest first
    async fn enabled_for_user(&self, user: &UserId) -> Result<Vec<CustomPolicy>>;

    async fn set_enabled(&self, id: &PolicyId, enabled: bool) -> Result<CustomPolicy>;
}

/// In-memory policy store
#[derive(Clone, Default)]
pub struct InMemoryPolicyStore {
    policies: Arc<RwLock<HashMap<PolicyId, CustomPolicy>>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn insert(&self, policy: CustomPolicy) -> Result<()> {
        self.policies.write().await.insert(policy.id.clone(), policy);
        Ok(())
    }

    async fn enabled_for_user(&self, user: &UserId) -> Result<Vec<CustomPolicy>> {
        let policies = self.policies.read().await;
        let mut enabled: Vec<CustomPolicy> = policies
            .values()
            .filter(|p| p.enabled && &p.user_id == user)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(enabled)
    }

    async fn set_enabled(&self, id: &PolicyId, enabled: bool) -> Result<CustomPolicy> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .get_mut(id)
            .ok_or_else(|| AgentrixError::not_found("policy", id))?;
        policy.enabled = enabled;
        Ok(policy.clone())
    }
}
