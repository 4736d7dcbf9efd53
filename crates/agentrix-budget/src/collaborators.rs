//! External collaborators of the budget engine
//!
//! Neither gates local state: a failed settlement leaves the release in
//! place and is recorded on the milestone.

use agentrix_split::PayoutLine;
use agentrix_types::{MicroAmount, MilestoneId, Result};
use async_trait::async_trait;

use crate::pool::BudgetPool;

/// Moves released milestone funds off-core
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Returns the external transfer reference
    async fn settle(&self, milestone_id: &MilestoneId, payouts: &[PayoutLine]) -> Result<String>;
}

/// Checks an external funding proof before a pool accepts the funds
#[async_trait]
pub trait FundingVerifier: Send + Sync {
    async fn verify(&self, pool: &BudgetPool, proof: &str, amount: MicroAmount) -> Result<bool>;
}
