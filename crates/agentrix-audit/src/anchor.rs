//! Periodic Merkle anchoring
//!
//! Digests every proof created in a window into one root and hands it to
//! an external attestation service. A failed publish is recorded and
//! logged; retrying is the scheduler's job.

use std::sync::Arc;

use agentrix_types::{AgentrixError, AnchorId, ProofId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::merkle::{merkle_proof, merkle_root, MerkleStep};
use crate::store::AuditStore;

const SECONDS_PER_DAY: i64 = 86_400;

/// What is handed to the attestation service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRequest {
    pub merkle_root: String,
    pub window_id: String,
    pub record_count: usize,
}

/// External attestation service
#[async_trait]
pub trait AttestationPublisher: Send + Sync {
    /// Publish an anchor, returning an opaque reference id
    async fn publish(&self, request: &AnchorRequest) -> Result<String>;
}

/// Publish outcome of an anchor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnchorStatus {
    Published { reference: String },
    Failed { error: String },
    /// No publisher configured
    Skipped,
}

/// A locally kept anchor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub id: AnchorId,
    pub window_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub merkle_root: String,
    pub record_count: usize,
    pub status: AnchorStatus,
    pub created_at: DateTime<Utc>,
}

/// Evidence that one proof is covered by an anchor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub proof_id: ProofId,
    pub leaf: String,
    pub index: usize,
    pub steps: Vec<MerkleStep>,
    pub merkle_root: String,
}

/// Anchors audit windows
#[derive(Clone)]
pub struct AnchorService {
    store: Arc<dyn AuditStore>,
    publisher: Option<Arc<dyn AttestationPublisher>>,
    window: Duration,
}

impl AnchorService {
    pub fn new(store: Arc<dyn AuditStore>, window: Duration) -> Self {
        Self {
            store,
            publisher: None,
            window,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn AttestationPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    fn window_seconds(&self) -> i64 {
        self.window.num_seconds().max(1)
    }

    /// Date for day-multiple windows, else date and hour of the start
    pub fn window_id(&self, start: DateTime<Utc>) -> String {
        if self.window_seconds() % SECONDS_PER_DAY == 0 {
            start.format("%Y-%m-%d").to_string()
        } else {
            start.format("%Y-%m-%dT%H").to_string()
        }
    }

    /// Bounds of the last window that closed at or before `now`
    pub fn previous_window(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let secs = self.window_seconds();
        let current_start = now.timestamp().div_euclid(secs) * secs;
        let start = Utc
            .timestamp_opt(current_start - secs, 0)
            .single()
            .ok_or_else(|| AgentrixError::invalid_input("now", "window start out of range"))?;
        Ok((start, start + Duration::seconds(secs)))
    }

    /// Anchor the window preceding `now`
    pub async fn anchor_previous_window(&self, now: DateTime<Utc>) -> Result<Option<AnchorRecord>> {
        let (start, _) = self.previous_window(now)?;
        self.anchor_window(start).await
    }

    /// Anchor the window starting at `start`; an empty window yields nothing
    pub async fn anchor_window(&self, start: DateTime<Utc>) -> Result<Option<AnchorRecord>> {
        let end = start + Duration::seconds(self.window_seconds());
        let window_id = self.window_id(start);

        let proofs = self.store.in_window(start, end).await?;
        let leaves: Vec<&str> = proofs.iter().map(|p| p.proof_hash.as_str()).collect();
        let Some(root) = merkle_root(&leaves)? else {
            info!(window_id = %window_id, "Empty audit window, nothing to anchor");
            return Ok(None);
        };

        let request = AnchorRequest {
            merkle_root: root.clone(),
            window_id: window_id.clone(),
            record_count: leaves.len(),
        };

        let status = match &self.publisher {
            None => AnchorStatus::Skipped,
            Some(publisher) => match publisher.publish(&request).await {
                Ok(reference) => AnchorStatus::Published { reference },
                Err(e) => {
                    warn!(window_id = %window_id, error = %e, "Anchor publish failed");
                    AnchorStatus::Failed { error: e.to_string() }
                }
            },
        };

        let record = AnchorRecord {
            id: AnchorId::new(),
            window_id,
            window_start: start,
            window_end: end,
            merkle_root: root,
            record_count: request.record_count,
            status,
            created_at: Utc::now(),
        };
        self.store.save_anchor(record.clone()).await?;

        info!(
            window_id = %record.window_id,
            merkle_root = %record.merkle_root,
            record_count = record.record_count,
            status = ?record.status,
            "Audit window anchored"
        );
        Ok(Some(record))
    }

    /// Show that `proof_id` is one of the leaves behind `anchor`
    pub async fn inclusion_proof(&self, anchor: &AnchorRecord, proof_id: &ProofId) -> Result<InclusionProof> {
        let proofs = self.store.in_window(anchor.window_start, anchor.window_end).await?;
        let index = proofs
            .iter()
            .position(|p| &p.id == proof_id)
            .ok_or_else(|| AgentrixError::not_found("proof in anchor window", proof_id))?;

        let leaves: Vec<&str> = proofs.iter().map(|p| p.proof_hash.as_str()).collect();
        Ok(InclusionProof {
            proof_id: proof_id.clone(),
            leaf: leaves[index].to_string(),
            index,
            steps: merkle_proof(&leaves, index)?,
            merkle_root: anchor.merkle_root.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AuditLedger;
    use crate::merkle::verify_merkle_proof;
    use crate::proof::{AuditAction, DecisionLog, ProofSubject};
    use crate::store::InMemoryAuditStore;
    use agentrix_types::{AgentId, PaymentIntentId};
    use std::sync::Mutex;

    struct RecordingPublisher {
        requests: Mutex<Vec<AnchorRequest>>,
    }

    #[async_trait]
    impl AttestationPublisher for RecordingPublisher {
        async fn publish(&self, request: &AnchorRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(format!("att-{}", request.window_id))
        }
    }

    struct DownPublisher;

    #[async_trait]
    impl AttestationPublisher for DownPublisher {
        async fn publish(&self, _request: &AnchorRequest) -> Result<String> {
            Err(AgentrixError::external("attestation", "connection refused"))
        }
    }

    async fn seeded(n: usize) -> (Arc<InMemoryAuditStore>, Vec<crate::proof::AuditProof>) {
        let store = Arc::new(InMemoryAuditStore::new());
        let ledger = AuditLedger::new(store.clone(), 3);
        let mut proofs = Vec::new();
        for i in 0..n {
            let subject = ProofSubject::new(PaymentIntentId::new())
                .with_agent(AgentId::from_raw(format!("agent-{}", i % 2)));
            proofs.push(
                ledger
                    .append(subject, DecisionLog::new(AuditAction::UserConfirmedPayment, "ok"), None)
                    .await
                    .unwrap(),
            );
        }
        (store, proofs)
    }

    fn current_hour_start() -> DateTime<Utc> {
        let now = Utc::now().timestamp();
        Utc.timestamp_opt(now - now.rem_euclid(3600), 0).unwrap()
    }

    #[test]
    fn test_window_ids() {
        let store = Arc::new(InMemoryAuditStore::new());
        let start = Utc.with_ymd_and_hms(2026, 3, 15, 7, 0, 0).unwrap();

        let daily = AnchorService::new(store.clone(), Duration::hours(24));
        assert_eq!(daily.window_id(start), "2026-03-15");

        let hourly = AnchorService::new(store, Duration::hours(1));
        assert_eq!(hourly.window_id(start), "2026-03-15T07");
    }

    #[test]
    fn test_previous_window_bounds() {
        let service = AnchorService::new(Arc::new(InMemoryAuditStore::new()), Duration::hours(24));
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 7, 30, 0).unwrap();
        let (start, end) = service.previous_window(now).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_anchor_publishes_root_and_count() {
        let (store, proofs) = seeded(5).await;
        let publisher = Arc::new(RecordingPublisher {
            requests: Mutex::new(Vec::new()),
        });
        let service = AnchorService::new(store.clone(), Duration::hours(1)).with_publisher(publisher.clone());

        let anchor = service.anchor_window(current_hour_start()).await.unwrap().unwrap();
        assert_eq!(anchor.record_count, 5);
        assert!(matches!(anchor.status, AnchorStatus::Published { .. }));

        let hashes: Vec<&str> = proofs.iter().map(|p| p.proof_hash.as_str()).collect();
        assert_eq!(Some(anchor.merkle_root.clone()), merkle_root(&hashes).unwrap());

        let sent = publisher.requests.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].window_id, anchor.window_id);
        assert_eq!(store.anchors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_local_anchor() {
        let (store, _) = seeded(2).await;
        let service = AnchorService::new(store.clone(), Duration::hours(1)).with_publisher(Arc::new(DownPublisher));

        let anchor = service.anchor_window(current_hour_start()).await.unwrap().unwrap();
        assert!(matches!(anchor.status, AnchorStatus::Failed { .. }));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_without_publisher_anchor_is_skipped() {
        let (store, proofs) = seeded(1).await;
        let service = AnchorService::new(store, Duration::hours(1));

        let anchor = service.anchor_window(current_hour_start()).await.unwrap().unwrap();
        assert_eq!(anchor.status, AnchorStatus::Skipped);
        assert_eq!(anchor.merkle_root, proofs[0].proof_hash);
    }

    #[tokio::test]
    async fn test_empty_window_yields_no_anchor() {
        let service = AnchorService::new(Arc::new(InMemoryAuditStore::new()), Duration::hours(1));
        assert!(service.anchor_window(current_hour_start()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inclusion_proof_verifies_against_anchor() {
        let (store, proofs) = seeded(6).await;
        let service = AnchorService::new(store, Duration::hours(1));
        let anchor = service.anchor_window(current_hour_start()).await.unwrap().unwrap();

        let inclusion = service.inclusion_proof(&anchor, &proofs[4].id).await.unwrap();
        assert_eq!(inclusion.index, 4);
        assert!(verify_merkle_proof(&inclusion.leaf, &inclusion.steps, &anchor.merkle_root));
    }
}
