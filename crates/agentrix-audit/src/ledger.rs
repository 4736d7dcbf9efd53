//! The audit ledger
//!
//! Appends are serialized per chain key by an in-process lock. Writers in
//! other processes are caught by the store's conditional insert, and the
//! append is retried against the new head.

use std::sync::Arc;

use agentrix_types::{AgentrixError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::proof::{AuditProof, DecisionLog, ProofSubject, GENESIS_HASH};
use crate::store::AuditStore;

/// Why a chain failed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainBreak {
    /// Stored hash does not match the stored content
    HashMismatch { stored: String, recomputed: String },
    /// Previous hash does not point at the prior record
    PreviousMismatch { expected: String, found: String },
    /// Head does not match the externally anchored value
    AnchorMismatch { anchored: String, head: String },
}

/// Result of walking one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub chain_key: String,
    pub length: usize,
    pub head_hash: Option<String>,
    pub valid: bool,
    /// Index of the first bad record
    pub broken_at: Option<usize>,
    pub problem: Option<ChainBreak>,
}

/// Re-derive every hash of a chain given in append order
pub fn verify_proofs(chain_key: &str, proofs: &[AuditProof], anchored_head: Option<&str>) -> ChainReport {
    let mut report = ChainReport {
        chain_key: chain_key.to_string(),
        length: proofs.len(),
        head_hash: proofs.last().map(|p| p.proof_hash.clone()),
        valid: true,
        broken_at: None,
        problem: None,
    };

    let mut expected_previous = GENESIS_HASH.to_string();
    for (idx, proof) in proofs.iter().enumerate() {
        if proof.previous_proof_hash != expected_previous {
            report.valid = false;
            report.broken_at = Some(idx);
            report.problem = Some(ChainBreak::PreviousMismatch {
                expected: expected_previous,
                found: proof.previous_proof_hash.clone(),
            });
            return report;
        }

        let recomputed = proof.recompute_hash().unwrap_or_default();
        if recomputed != proof.proof_hash {
            report.valid = false;
            report.broken_at = Some(idx);
            report.problem = Some(ChainBreak::HashMismatch {
                stored: proof.proof_hash.clone(),
                recomputed,
            });
            return report;
        }

        expected_previous = proof.proof_hash.clone();
    }

    if let (Some(anchored), Some(head)) = (anchored_head, report.head_hash.clone()) {
        if anchored != head {
            report.valid = false;
            report.broken_at = Some(proofs.len().saturating_sub(1));
            report.problem = Some(ChainBreak::AnchorMismatch {
                anchored: anchored.to_string(),
                head,
            });
        }
    }

    report
}

/// The Agentrix audit ledger
#[derive(Clone)]
pub struct AuditLedger {
    store: Arc<dyn AuditStore>,
    chain_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    max_retries: u32,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn AuditStore>, max_retries: u32) -> Self {
        Self {
            store,
            chain_locks: Arc::new(DashMap::new()),
            max_retries,
        }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    fn chain_lock(&self, chain_key: &str) -> Arc<Mutex<()>> {
        self.chain_locks
            .entry(chain_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append one proof to the chain its subject selects
    pub async fn append(
        &self,
        subject: ProofSubject,
        payload: DecisionLog,
        signature: Option<String>,
    ) -> Result<AuditProof> {
        let chain_key = subject.chain_key();
        let lock = self.chain_lock(&chain_key);
        let result = {
            let _guard = lock.lock().await;
            self.append_locked(&chain_key, subject, payload, signature).await
        };
        drop(lock);

        // Nobody else holds or waits on the lock once the map owns the only reference
        self.chain_locks
            .remove_if(&chain_key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn append_locked(
        &self,
        chain_key: &str,
        subject: ProofSubject,
        payload: DecisionLog,
        signature: Option<String>,
    ) -> Result<AuditProof> {
        let mut attempt = 0;
        loop {
            let previous = self
                .store
                .head(chain_key)
                .await?
                .map(|p| p.proof_hash)
                .unwrap_or_else(|| GENESIS_HASH.to_string());

            let proof = AuditProof::seal(subject.clone(), payload.clone(), signature.clone(), previous)?;

            match self.store.insert_if_head(proof.clone()).await {
                Ok(()) => {
                    info!(
                        chain_key = %chain_key,
                        proof_id = %proof.id,
                        action = %proof.payload.action,
                        "Audit proof appended"
                    );
                    return Ok(proof);
                }
                Err(e @ AgentrixError::ChainConflict { .. }) if attempt < self.max_retries => {
                    attempt += 1;
                    debug!(chain_key = %chain_key, attempt, error = %e, "Chain head moved, retrying");
                }
                Err(e) => {
                    warn!(chain_key = %chain_key, error = %e, "Audit append failed");
                    return Err(e);
                }
            }
        }
    }

    /// Walk a stored chain; `anchored_head` is checked against the final hash
    pub async fn verify_chain(&self, chain_key: &str, anchored_head: Option<&str>) -> Result<ChainReport> {
        let proofs = self.store.chain(chain_key).await?;
        let report = verify_proofs(chain_key, &proofs, anchored_head);
        if !report.valid {
            warn!(
                chain_key,
                broken_at = ?report.broken_at,
                problem = ?report.problem,
                "Audit chain verification failed"
            );
        }
        Ok(report)
    }
}
