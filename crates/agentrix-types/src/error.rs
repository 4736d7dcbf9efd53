//! Error types for Agentrix
//!
//! Every failure is explicit and fails closed. A policy denial is NOT an
//! error: it is a normal `Decision` returned by the evaluator.

use thiserror::Error;

use crate::MicroAmount;

/// Result type for Agentrix operations
pub type Result<T> = std::result::Result<T, AgentrixError>;

/// Agentrix error types
#[derive(Debug, Clone, Error)]
pub enum AgentrixError {
    // ========================================================================
    // Lookup & Access
    // ========================================================================

    /// Referenced entity does not exist
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    /// Caller does not own the entity
    #[error("{caller} is not allowed to modify {resource} {id}")]
    Forbidden {
        resource: String,
        id: String,
        caller: String,
    },

    // ========================================================================
    // State Machines
    // ========================================================================

    /// Operation not valid in the entity's current state
    #[error("Cannot {attempted} {entity} {id} in state {current}")]
    InvalidStateTransition {
        entity: String,
        id: String,
        current: String,
        attempted: String,
    },

    /// Reservation exceeds the pool's available funds
    #[error("Insufficient budget in pool {pool_id}: requested {requested}, available {available}")]
    InsufficientBudget {
        pool_id: String,
        requested: MicroAmount,
        available: MicroAmount,
    },

    /// Recording usage would push a counter past its limit
    #[error("Authorization {authorization_id} {limit} limit exceeded: {attempted} > {allowed}")]
    LimitExceeded {
        authorization_id: String,
        limit: String,
        attempted: String,
        allowed: String,
    },

    /// Active split rules claim more than 100%
    #[error("Split plan {plan_id} shares total {total_bps} bps, more than 10000")]
    PlanSharesExceeded { plan_id: String, total_bps: u32 },

    /// Preview would exceed the plan's volume cap
    #[error("Split plan {plan_id} volume cap {cap} exceeded by {attempted}")]
    VolumeCapExceeded {
        plan_id: String,
        cap: MicroAmount,
        attempted: MicroAmount,
    },

    /// A pending confirmation is past its validity window
    #[error("Confirmation {confirmation_id} expired at {expired_at}")]
    ConfirmationExpired {
        confirmation_id: String,
        expired_at: String,
    },

    // ========================================================================
    // Integrity
    // ========================================================================

    /// Supplied signature does not verify
    #[error("Invalid signature: {reason}")]
    InvalidSignature { reason: String },

    /// Another writer advanced the chain head first
    #[error("Audit chain {chain_key} head moved: expected {expected_head}, found {actual_head}")]
    ChainConflict {
        chain_key: String,
        expected_head: String,
        actual_head: String,
    },

    /// Cryptographic failure (bad key material, bad encoding)
    #[error("Cryptographic error: {message}")]
    Crypto { message: String },

    // ========================================================================
    // Amounts & Input
    // ========================================================================

    /// Amount overflow during arithmetic
    #[error("Amount overflow during arithmetic operation")]
    AmountOverflow,

    /// Amount underflow during arithmetic
    #[error("Amount underflow during arithmetic operation")]
    AmountUnderflow,

    /// Invalid input
    #[error("Invalid input for {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    // ========================================================================
    // Infrastructure
    // ========================================================================

    /// External collaborator failed (executor, settlement, attestation)
    #[error("{collaborator} failed: {message}")]
    External {
        collaborator: String,
        message: String,
    },

    /// Storage layer failure
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Serialization failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl AgentrixError {
    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(resource: impl Into<String>, id: impl ToString, caller: impl ToString) -> Self {
        Self::Forbidden {
            resource: resource.into(),
            id: id.to_string(),
            caller: caller.to_string(),
        }
    }

    /// Create an invalid state transition error
    pub fn invalid_transition(
        entity: impl Into<String>,
        id: impl ToString,
        current: impl ToString,
        attempted: impl Into<String>,
    ) -> Self {
        Self::InvalidStateTransition {
            entity: entity.into(),
            id: id.to_string(),
            current: current.to_string(),
            attempted: attempted.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an external collaborator error
    pub fn external(collaborator: impl Into<String>, message: impl ToString) -> Self {
        Self::External {
            collaborator: collaborator.into(),
            message: message.to_string(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Check if this is a retriable error
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ChainConflict { .. } | Self::Storage { .. } | Self::External { .. }
        )
    }

    /// Get an error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::InsufficientBudget { .. } => "INSUFFICIENT_BUDGET",
            Self::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            Self::PlanSharesExceeded { .. } => "PLAN_SHARES_EXCEEDED",
            Self::VolumeCapExceeded { .. } => "VOLUME_CAP_EXCEEDED",
            Self::ConfirmationExpired { .. } => "CONFIRMATION_EXPIRED",
            Self::InvalidSignature { .. } => "INVALID_SIGNATURE",
            Self::ChainConflict { .. } => "CHAIN_CONFLICT",
            Self::Crypto { .. } => "CRYPTO_ERROR",
            Self::AmountOverflow => "AMOUNT_OVERFLOW",
            Self::AmountUnderflow => "AMOUNT_UNDERFLOW",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::External { .. } => "EXTERNAL_FAILURE",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }
}

impl From<serde_json::Error> for AgentrixError {
    fn from(e: serde_json::Error) -> Self {
        AgentrixError::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<ed25519_dalek::SignatureError> for AgentrixError {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        AgentrixError::InvalidSignature {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = AgentrixError::InsufficientBudget {
            pool_id: "pool_1".to_string(),
            requested: MicroAmount(500),
            available: MicroAmount(100),
        };
        assert_eq!(err.error_code(), "INSUFFICIENT_BUDGET");
        assert!(err.to_string().contains("requested 500, available 100"));
    }

    #[test]
    fn test_invalid_transition_carries_current_state() {
        let err = AgentrixError::invalid_transition("milestone", "ms_1", "pending", "release");
        assert_eq!(err.error_code(), "INVALID_STATE_TRANSITION");
        assert_eq!(err.to_string(), "Cannot release milestone ms_1 in state pending");
    }

    #[test]
    fn test_retriable_errors() {
        assert!(AgentrixError::storage("disk full").is_retriable());
        assert!(!AgentrixError::not_found("pool", "pool_1").is_retriable());
    }
}
