//! Milestone records, approval rules and quality gates

use std::fmt;

use agentrix_split::{PayoutLine, ShareClaim};
use agentrix_types::{AgentrixError, MicroAmount, MilestoneId, PoolId, Result, BPS_DENOMINATOR};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    PendingReview,
    Approved,
    Rejected,
    Released,
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Released => "released",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// Approved on submission
    Auto,
    Manual,
    /// Approval needs a score that satisfies the gate
    QualityGate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateOperator {
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
}

impl GateOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gte => ">=",
            Self::Gt => ">",
            Self::Eq => "=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }

    /// `score <op> threshold`
    pub fn compare(&self, score: Decimal, threshold: Decimal) -> bool {
        match self {
            Self::Gte => score >= threshold,
            Self::Gt => score > threshold,
            Self::Eq => score == threshold,
            Self::Lt => score < threshold,
            Self::Lte => score <= threshold,
        }
    }
}

impl fmt::Display for GateOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGate {
    pub metric: String,
    pub threshold: Decimal,
    pub operator: GateOperator,
}

impl QualityGate {
    pub fn evaluate(&self, score: Decimal) -> Result<()> {
        if self.operator.compare(score, self.threshold) {
            Ok(())
        } else {
            Err(AgentrixError::invalid_input(
                "quality_score",
                format!(
                    "{} {} does not satisfy {} {}",
                    self.metric, score, self.operator, self.threshold
                ),
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: String,
    pub role: String,
    /// Fixed share of the release; others split the rest evenly
    pub share_bps: Option<u32>,
}

impl Participant {
    pub fn new(participant_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            role: role.into(),
            share_bps: None,
        }
    }

    pub fn with_share(mut self, share_bps: u32) -> Self {
        self.share_bps = Some(share_bps);
        self
    }
}

/// Something delivered with a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub reviewer: String,
    pub reviewed_at: DateTime<Utc>,
    pub note: Option<String>,
}

/// Outcome of handing a release to the settlement gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementStatus {
    NotConfigured,
    /// Handed to the gateway; no other settle call may start
    Settling,
    Settled { reference: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub pool_id: PoolId,
    pub title: String,
    pub description: Option<String>,
    pub sort_order: i32,
    pub due_date: Option<DateTime<Utc>>,
    /// Fixed at creation
    pub reserved_amount: MicroAmount,
    /// Zero until release, then equal to `reserved_amount`
    pub released_amount: MicroAmount,
    pub participants: Vec<Participant>,
    pub status: MilestoneStatus,
    pub approval_type: ApprovalType,
    pub quality_gate: Option<QualityGate>,
    pub quality_score: Option<Decimal>,
    pub artifacts: Vec<Artifact>,
    pub review: Option<Review>,
    pub reject_reason: Option<String>,
    pub payouts: Vec<PayoutLine>,
    pub settlement: Option<SettlementStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Milestone {
    pub fn is_participant(&self, who: &str) -> bool {
        self.participants.iter().any(|p| p.participant_id == who)
    }

    pub(crate) fn share_claims(&self) -> Vec<ShareClaim> {
        self.participants
            .iter()
            .map(|p| ShareClaim {
                recipient: p.participant_id.clone(),
                override_bps: p.share_bps,
            })
            .collect()
    }

    pub(crate) fn expect_status(&self, expected: MilestoneStatus, attempted: &str) -> Result<()> {
        if self.status != expected {
            return Err(AgentrixError::invalid_transition(
                "milestone",
                &self.id,
                self.status,
                attempted,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMilestone {
    pub title: String,
    pub description: Option<String>,
    pub sort_order: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub reserved_amount: MicroAmount,
    #[serde(default)]
    pub participants: Vec<Participant>,
    pub approval_type: ApprovalType,
    pub quality_gate: Option<QualityGate>,
}

impl CreateMilestone {
    pub fn new(title: impl Into<String>, reserved_amount: MicroAmount, approval_type: ApprovalType) -> Self {
        Self {
            title: title.into(),
            description: None,
            sort_order: 0,
            due_date: None,
            reserved_amount,
            participants: Vec::new(),
            approval_type,
            quality_gate: None,
        }
    }

    pub fn with_participants(mut self, participants: Vec<Participant>) -> Self {
        self.participants = participants;
        self
    }

    pub fn with_gate(mut self, gate: QualityGate) -> Self {
        self.quality_gate = Some(gate);
        self
    }

    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(AgentrixError::invalid_input("title", "must not be empty"));
        }
        if self.reserved_amount.is_zero() {
            return Err(AgentrixError::invalid_input("reserved_amount", "must be positive"));
        }
        if self.approval_type == ApprovalType::QualityGate && self.quality_gate.is_none() {
            return Err(AgentrixError::invalid_input(
                "quality_gate",
                "required for quality_gate approval",
            ));
        }
        let overridden: u64 = self
            .participants
            .iter()
            .filter_map(|p| p.share_bps)
            .map(u64::from)
            .sum();
        if overridden > BPS_DENOMINATOR as u64 {
            return Err(AgentrixError::invalid_input(
                "participants",
                format!("override shares total {} bps", overridden),
            ));
        }
        Ok(())
    }
}

/// Reviewer decision input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApproveMilestone {
    pub reviewer: String,
    pub quality_score: Option<Decimal>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RejectMilestone {
    pub reviewer: String,
    pub reason: String,
    pub note: Option<String>,
}
