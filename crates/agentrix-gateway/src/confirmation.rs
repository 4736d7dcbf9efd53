//! Payments waiting for the user

use agentrix_types::ConfirmationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::AgentPaymentRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    /// A confirm call is executing the payment
    Processing,
    Confirmed,
    Failed,
    Expired,
}

impl std::fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A payment the evaluator did not clear, held for explicit user approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub id: ConfirmationId,
    pub request: AgentPaymentRequest,
    /// Decision reason code that caused the downgrade
    pub reason: String,
    pub status: ConfirmationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingConfirmation {
    /// Past its window; treated as denied
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
