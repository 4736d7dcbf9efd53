//! Audit storage seam
//!
//! `insert_if_head` is a conditional insert: it succeeds only when the
//! proof's previous hash is still the chain head. A database-backed store
//! maps this to a unique constraint on `(chain_key, previous_proof_hash)`.

use std::collections::HashMap;
use std::sync::Arc;

use agentrix_types::{AgentrixError, ProofId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::anchor::AnchorRecord;
use crate::proof::{AuditProof, GENESIS_HASH};

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Latest proof of a chain
    async fn head(&self, chain_key: &str) -> Result<Option<AuditProof>>;

    /// Append `proof` if its previous hash is still the head, else `ChainConflict`
    async fn insert_if_head(&self, proof: AuditProof) -> Result<()>;

    async fn get(&self, id: &ProofId) -> Result<Option<AuditProof>>;

    /// A whole chain in append order
    async fn chain(&self, chain_key: &str) -> Result<Vec<AuditProof>>;

    /// Proofs created in `[from, to)`, in creation order
    async fn in_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AuditProof>>;

    async fn save_anchor(&self, anchor: AnchorRecord) -> Result<()>;

    async fn anchors(&self) -> Result<Vec<AnchorRecord>>;
}

#[derive(Default)]
struct AuditBook {
    /// Every proof in append order
    proofs: Vec<AuditProof>,
    /// chain key -> index of its head in `proofs`
    heads: HashMap<String, usize>,
    by_id: HashMap<ProofId, usize>,
    anchors: Vec<AnchorRecord>,
}

/// In-memory audit store
#[derive(Clone, Default)]
pub struct InMemoryAuditStore {
    book: Arc<RwLock<AuditBook>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.book.read().await.proofs.len()
    }

    /// Overwrite a stored proof in place; exists to exercise tamper detection
    #[cfg(test)]
    pub(crate) async fn tamper<F: FnOnce(&mut AuditProof)>(&self, id: &ProofId, f: F) {
        let mut book = self.book.write().await;
        let idx = book.by_id.get(id).copied();
        if let Some(idx) = idx {
            f(&mut book.proofs[idx]);
        }
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn head(&self, chain_key: &str) -> Result<Option<AuditProof>> {
        let book = self.book.read().await;
        Ok(book
            .heads
            .get(chain_key)
            .and_then(|&idx| book.proofs.get(idx))
            .cloned())
    }

    async fn insert_if_head(&self, proof: AuditProof) -> Result<()> {
        let mut book = self.book.write().await;

        let current_head = book
            .heads
            .get(&proof.chain_key)
            .and_then(|&idx| book.proofs.get(idx))
            .map(|p| p.proof_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        if current_head != proof.previous_proof_hash {
            return Err(AgentrixError::ChainConflict {
                chain_key: proof.chain_key.clone(),
                expected_head: proof.previous_proof_hash.clone(),
                actual_head: current_head,
            });
        }
        if book.by_id.contains_key(&proof.id) {
            return Err(AgentrixError::storage(format!("proof {} already stored", proof.id)));
        }

        let idx = book.proofs.len();
        book.heads.insert(proof.chain_key.clone(), idx);
        book.by_id.insert(proof.id.clone(), idx);
        book.proofs.push(proof);
        Ok(())
    }

    async fn get(&self, id: &ProofId) -> Result<Option<AuditProof>> {
        let book = self.book.read().await;
        Ok(book.by_id.get(id).and_then(|&idx| book.proofs.get(idx)).cloned())
    }

    async fn chain(&self, chain_key: &str) -> Result<Vec<AuditProof>> {
        let book = self.book.read().await;
        Ok(book
            .proofs
            .iter()
            .filter(|p| p.chain_key == chain_key)
            .cloned()
            .collect())
    }

    async fn in_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AuditProof>> {
        let book = self.book.read().await;
        let mut proofs: Vec<AuditProof> = book
            .proofs
            .iter()
            .filter(|p| p.created_at >= from && p.created_at < to)
            .cloned()
            .collect();
        // Stable: equal timestamps keep append order
        proofs.sort_by_key(|p| p.created_at);
        Ok(proofs)
    }

    async fn save_anchor(&self, anchor: AnchorRecord) -> Result<()> {
        self.book.write().await.anchors.push(anchor);
        Ok(())
    }

    async fn anchors(&self) -> Result<Vec<AnchorRecord>> {
        Ok(self.book.read().await.anchors.clone())
    }
}
