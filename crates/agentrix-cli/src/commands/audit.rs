//! Offline audit commands: Merkle roots and chain verification

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Serialize;

use agentrix_audit::{merkle_root as compute_root, verify_proofs, AuditProof, ChainReport};

use crate::display;

#[derive(Serialize)]
struct RootOutput {
    merkle_root: Option<String>,
    leaf_count: usize,
}

pub fn merkle_root(leaves: Vec<String>, file: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let leaves = match file {
        Some(path) => read_leaves(&path)?,
        None => leaves,
    };
    let root = compute_root(&leaves)?;

    if json {
        return display::json(&RootOutput {
            merkle_root: root,
            leaf_count: leaves.len(),
        });
    }

    display::section("Merkle Root");
    display::labeled("Leaves", &leaves.len().to_string());
    match root {
        Some(root) => display::labeled("Root", &root),
        None => display::warning("No leaves given; an empty window has no root"),
    }
    Ok(())
}

fn read_leaves(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading leaves from {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Split an exported proof list into chains, keeping each chain's order
pub fn group_chains(proofs: Vec<AuditProof>) -> BTreeMap<String, Vec<AuditProof>> {
    let mut chains: BTreeMap<String, Vec<AuditProof>> = BTreeMap::new();
    for proof in proofs {
        chains.entry(proof.chain_key.clone()).or_default().push(proof);
    }
    chains
}

/// Verify every chain in `proofs`; the anchored head applies only when there is one chain
pub fn verify_all(proofs: Vec<AuditProof>, anchored_head: Option<&str>) -> anyhow::Result<Vec<ChainReport>> {
    let chains = group_chains(proofs);
    if anchored_head.is_some() && chains.len() > 1 {
        bail!("--anchored-head needs a file holding a single chain, found {}", chains.len());
    }
    Ok(chains
        .iter()
        .map(|(key, chain)| verify_proofs(key, chain, anchored_head))
        .collect())
}

pub fn verify_chain(file: &Path, anchored_head: Option<&str>, json: bool) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading proofs from {}", file.display()))?;
    let proofs: Vec<AuditProof> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing proofs from {}", file.display()))?;
    let reports = verify_all(proofs, anchored_head)?;
    let broken = reports.iter().filter(|r| !r.valid).count();

    if json {
        display::json(&reports)?;
    } else {
        print_reports(&reports);
    }

    if broken > 0 {
        bail!("{} of {} audit chains failed verification", broken, reports.len());
    }
    Ok(())
}

pub fn print_reports(reports: &[ChainReport]) {
    display::section("Audit Chain Verification");
    if reports.is_empty() {
        display::warning("No proofs found");
    }
    for report in reports {
        if report.valid {
            display::success(&format!(
                "{}: {} proofs, head {}",
                report.chain_key,
                report.length,
                report.head_hash.as_deref().map(display::short_hash).unwrap_or_default()
            ));
        } else {
            display::error(&format!(
                "{}: broken at index {}",
                report.chain_key,
                report.broken_at.map(|i| i.to_string()).unwrap_or_else(|| "?".to_string())
            ));
            if let Some(problem) = &report.problem {
                display::kv("problem", &format!("{:?}", problem));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrix_audit::{AuditAction, AuditLedger, AuditStore, DecisionLog, InMemoryAuditStore, ProofSubject};
    use agentrix_types::{AgentId, PaymentIntentId};
    use std::sync::Arc;

    async fn export(agents: &[&str], per_agent: usize) -> Vec<AuditProof> {
        let store = Arc::new(InMemoryAuditStore::new());
        let ledger = AuditLedger::new(store.clone(), 3);
        for agent in agents {
            for _ in 0..per_agent {
                ledger
                    .append(
                        ProofSubject::new(PaymentIntentId::new()).with_agent(AgentId::from_raw(*agent)),
                        DecisionLog::new(AuditAction::AgentExecutePaymentSuccess, "AUTHORIZED"),
                        None,
                    )
                    .await
                    .unwrap();
            }
        }
        let mut all = Vec::new();
        for agent in agents {
            all.extend(store.chain(agent).await.unwrap());
        }
        all
    }

    #[tokio::test]
    async fn test_verify_all_groups_by_chain() {
        let proofs = export(&["agent-a", "agent-b"], 3).await;
        let reports = verify_all(proofs, None).unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.valid && r.length == 3));
    }

    #[tokio::test]
    async fn test_tampered_export_is_reported() {
        let mut proofs = export(&["agent-a"], 3).await;
        proofs[1].payload.reason = "EDITED".to_string();

        let reports = verify_all(proofs, None).unwrap();
        assert!(!reports[0].valid);
        assert_eq!(reports[0].broken_at, Some(1));
    }

    #[tokio::test]
    async fn test_anchored_head_needs_single_chain() {
        let proofs = export(&["agent-a", "agent-b"], 1).await;
        assert!(verify_all(proofs, Some("00")).is_err());
    }
}
