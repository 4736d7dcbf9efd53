//! Budget pool records

use std::fmt;

use agentrix_types::{AgentrixError, MicroAmount, PaymentIntentId, PlanId, PoolId, Result, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Draft,
    Funded,
    Active,
    Depleted,
    Expired,
    Cancelled,
}

impl PoolStatus {
    /// No further funding or reservations
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Depleted | Self::Expired | Self::Cancelled)
    }

    /// Funds can be reserved against the pool
    pub fn accepts_reservations(&self) -> bool {
        matches!(self, Self::Funded | Self::Active)
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Funded => "funded",
            Self::Active => "active",
            Self::Depleted => "depleted",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Where a pool's money comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingSource {
    /// Checkout payment; needs a payment intent
    Payment,
    /// On-chain wallet; needs a wallet address
    Wallet,
    /// Platform credit
    Credit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPool {
    pub id: PoolId,
    pub owner_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub currency: String,
    pub total_budget: MicroAmount,
    pub funded_amount: MicroAmount,
    pub reserved_amount: MicroAmount,
    pub released_amount: MicroAmount,
    pub funding_source: FundingSource,
    pub payment_intent_id: Option<PaymentIntentId>,
    pub wallet_address: Option<String>,
    /// Last accepted external funding proof (e.g. a transaction hash)
    pub funding_proof: Option<String>,
    /// Optional allocation plan linked to the pool
    pub split_plan_id: Option<PlanId>,
    pub status: PoolStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BudgetPool {
    /// `funded - reserved - released`
    pub fn available(&self) -> MicroAmount {
        self.funded_amount
            .saturating_sub(self.reserved_amount)
            .saturating_sub(self.released_amount)
    }

    /// `funded >= reserved + released`
    pub fn is_balanced(&self) -> bool {
        self.reserved_amount
            .checked_add(self.released_amount)
            .map_or(false, |committed| committed <= self.funded_amount)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    /// Move `amount` from available to reserved
    pub(crate) fn reserve(&mut self, amount: MicroAmount) -> Result<()> {
        let available = self.available();
        if amount > available {
            return Err(AgentrixError::InsufficientBudget {
                pool_id: self.id.to_string(),
                requested: amount,
                available,
            });
        }
        self.reserved_amount = self.reserved_amount.try_add(amount)?;
        Ok(())
    }

    /// Move `amount` from reserved to released
    pub(crate) fn release(&mut self, amount: MicroAmount) -> Result<()> {
        self.reserved_amount = self.reserved_amount.try_sub(amount)?;
        self.released_amount = self.released_amount.try_add(amount)?;
        if self.status == PoolStatus::Active
            && self.reserved_amount.is_zero()
            && self.released_amount == self.funded_amount
        {
            self.status = PoolStatus::Depleted;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePool {
    pub name: String,
    pub description: Option<String>,
    pub currency: String,
    pub total_budget: MicroAmount,
    pub funding_source: FundingSource,
    pub split_plan_id: Option<PlanId>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Draft-only edits; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePool {
    pub name: Option<String>,
    pub description: Option<String>,
    pub total_budget: Option<MicroAmount>,
    pub funding_source: Option<FundingSource>,
    pub split_plan_id: Option<PlanId>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One funding event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundPool {
    pub amount: MicroAmount,
    pub payment_intent_id: Option<PaymentIntentId>,
    pub wallet_address: Option<String>,
    /// External proof checked by the funding verifier, when one is configured
    pub proof: Option<String>,
}

impl FundPool {
    /// Check the fields the pool's funding source requires
    pub fn validate_for(&self, source: FundingSource) -> Result<()> {
        if self.amount.is_zero() {
            return Err(AgentrixError::invalid_input("amount", "must be positive"));
        }
        match source {
            FundingSource::Payment if self.payment_intent_id.is_none() => Err(
                AgentrixError::invalid_input("payment_intent_id", "required for payment funding"),
            ),
            FundingSource::Wallet
                if self.wallet_address.as_deref().map_or(true, |a| a.trim().is_empty()) =>
            {
                Err(AgentrixError::invalid_input("wallet_address", "required for wallet funding"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub pending_review: usize,
    pub approved: usize,
    pub rejected: usize,
    pub released: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_id: PoolId,
    pub status: PoolStatus,
    pub total_budget: MicroAmount,
    pub funded: MicroAmount,
    pub reserved: MicroAmount,
    pub released: MicroAmount,
    pub available: MicroAmount,
    pub milestones: MilestoneCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(funded: u128) -> BudgetPool {
        let now = Utc::now();
        BudgetPool {
            id: PoolId::new(),
            owner_id: UserId::from_raw("owner"),
            name: "pool".to_string(),
            description: None,
            currency: "USDC".to_string(),
            total_budget: MicroAmount(funded),
            funded_amount: MicroAmount(funded),
            reserved_amount: MicroAmount::ZERO,
            released_amount: MicroAmount::ZERO,
            funding_source: FundingSource::Credit,
            payment_intent_id: None,
            wallet_address: None,
            funding_proof: None,
            split_plan_id: None,
            status: PoolStatus::Active,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_reserve_and_release_keep_balance() {
        let mut p = pool(1_000);
        p.reserve(MicroAmount(400)).unwrap();
        assert_eq!(p.available(), MicroAmount(600));
        p.release(MicroAmount(400)).unwrap();
        assert_eq!(p.reserved_amount, MicroAmount::ZERO);
        assert_eq!(p.released_amount, MicroAmount(400));
        assert_eq!(p.available(), MicroAmount(600));
        assert!(p.is_balanced());
        assert_eq!(p.status, PoolStatus::Active);
    }

    #[test]
    fn test_reserve_beyond_available_is_rejected() {
        let mut p = pool(1_000);
        p.reserve(MicroAmount(700)).unwrap();
        let err = p.reserve(MicroAmount(301)).unwrap_err();
        assert_eq!(err.error_code(), "INSUFFICIENT_BUDGET");
        assert_eq!(p.reserved_amount, MicroAmount(700));
    }

    #[test]
    fn test_full_release_depletes() {
        let mut p = pool(500);
        p.reserve(MicroAmount(500)).unwrap();
        p.release(MicroAmount(500)).unwrap();
        assert_eq!(p.status, PoolStatus::Depleted);
    }

    #[test]
    fn test_funding_source_requirements() {
        let bare = FundPool {
            amount: MicroAmount(10),
            ..Default::default()
        };
        assert!(bare.validate_for(FundingSource::Credit).is_ok());
        assert!(bare.validate_for(FundingSource::Payment).is_err());
        assert!(bare.validate_for(FundingSource::Wallet).is_err());

        let wallet = FundPool {
            wallet_address: Some("0xabc".to_string()),
            ..bare.clone()
        };
        assert!(wallet.validate_for(FundingSource::Wallet).is_ok());

        let zero = FundPool::default();
        assert!(zero.validate_for(FundingSource::Credit).is_err());
    }
}
