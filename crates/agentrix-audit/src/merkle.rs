//! Binary Merkle tree over proof hashes
//!
//! Parent = SHA-256(left || right) over the raw 32-byte digests. A level
//! with an odd count pairs its last node with itself. A single leaf is its
//! own root.

use agentrix_types::{sha256, AgentrixError, Result};
use serde::{Deserialize, Serialize};

/// One step of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleStep {
    pub sibling: String,
    /// Sibling sits on the left of the running hash
    pub sibling_is_left: bool,
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256(&buf)
}

fn decode_leaf(leaf: &str) -> Result<[u8; 32]> {
    hex::decode(leaf)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .ok_or_else(|| AgentrixError::invalid_input("leaf", format!("{} is not a 32-byte hex digest", leaf)))
}

fn decode_leaves<S: AsRef<str>>(leaves: &[S]) -> Result<Vec<[u8; 32]>> {
    leaves.iter().map(|l| decode_leaf(l.as_ref())).collect()
}

fn next_level(level: &[[u8; 32]]) -> Vec<[u8; 32]> {
    level
        .chunks(2)
        .map(|chunk| {
            let left = chunk[0];
            let right = chunk.get(1).copied().unwrap_or(left);
            hash_pair(&left, &right)
        })
        .collect()
}

/// Root over raw digests; `None` for no leaves
pub fn merkle_root_bytes(leaves: &[[u8; 32]]) -> Option<[u8; 32]> {
    if leaves.is_empty() {
        return None;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level.into_iter().next()
}

/// Root over hex proof hashes
pub fn merkle_root<S: AsRef<str>>(leaves: &[S]) -> Result<Option<String>> {
    let leaves = decode_leaves(leaves)?;
    Ok(merkle_root_bytes(&leaves).map(hex::encode))
}

/// Inclusion proof for the leaf at `index`
pub fn merkle_proof<S: AsRef<str>>(leaves: &[S], index: usize) -> Result<Vec<MerkleStep>> {
    if index >= leaves.len() {
        return Err(AgentrixError::invalid_input(
            "index",
            format!("{} out of range for {} leaves", index, leaves.len()),
        ));
    }

    let mut level = decode_leaves(leaves)?;
    let mut idx = index;
    let mut steps = Vec::new();

    while level.len() > 1 {
        let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
        // Missing right sibling: the node was paired with itself
        let sibling = level.get(sibling_idx).copied().unwrap_or(level[idx]);
        steps.push(MerkleStep {
            sibling: hex::encode(sibling),
            sibling_is_left: idx % 2 == 1,
        });

        level = next_level(&level);
        idx /= 2;
    }

    Ok(steps)
}

/// Whether `proof` leads from `leaf` to `root`
pub fn verify_merkle_proof(leaf: &str, proof: &[MerkleStep], root: &str) -> bool {
    let Ok(mut current) = decode_leaf(leaf) else {
        return false;
    };

    for step in proof {
        let Ok(sibling) = decode_leaf(&step.sibling) else {
            return false;
        };
        current = if step.sibling_is_left {
            hash_pair(&sibling, &current)
        } else {
            hash_pair(&current, &sibling)
        };
    }

    hex::encode(current) == root
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrix_types::hash_sha256;

    fn leaves(n: usize) -> Vec<String> {
        (0..n).map(|i| hash_sha256(format!("proof-{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_empty_has_no_root() {
        assert_eq!(merkle_root::<String>(&[]).unwrap(), None);
    }

    #[test]
    fn test_single_leaf_is_root() {
        let l = leaves(1);
        assert_eq!(merkle_root(&l).unwrap(), Some(l[0].clone()));
    }

    #[test]
    fn test_odd_level_pairs_last_with_itself() {
        let l = leaves(3);
        let raw = decode_leaves(&l).unwrap();
        let left = hash_pair(&raw[0], &raw[1]);
        let right = hash_pair(&raw[2], &raw[2]);
        let expected = hex::encode(hash_pair(&left, &right));
        assert_eq!(merkle_root(&l).unwrap(), Some(expected));
    }

    #[test]
    fn test_pair_evaluation_order_does_not_matter() {
        let raw = decode_leaves(&leaves(4)).unwrap();
        // Build the first level right-to-left instead of left-to-right
        let mut level = vec![[0u8; 32]; 2];
        level[1] = hash_pair(&raw[2], &raw[3]);
        level[0] = hash_pair(&raw[0], &raw[1]);
        let root = hash_pair(&level[0], &level[1]);
        assert_eq!(merkle_root_bytes(&raw), Some(root));
    }

    #[test]
    fn test_root_changes_when_any_leaf_changes() {
        let mut l = leaves(5);
        let before = merkle_root(&l).unwrap();
        l[3] = hash_sha256(b"tampered");
        assert_ne!(merkle_root(&l).unwrap(), before);
    }

    #[test]
    fn test_inclusion_proofs_verify() {
        for n in [1, 2, 3, 5, 8] {
            let l = leaves(n);
            let root = merkle_root(&l).unwrap().unwrap();
            for (i, leaf) in l.iter().enumerate() {
                let proof = merkle_proof(&l, i).unwrap();
                assert!(verify_merkle_proof(leaf, &proof, &root), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_inclusion_proof_rejects_wrong_leaf() {
        let l = leaves(4);
        let root = merkle_root(&l).unwrap().unwrap();
        let proof = merkle_proof(&l, 0).unwrap();
        assert!(!verify_merkle_proof(&l[1], &proof, &root));
        assert!(!verify_merkle_proof("not-hex", &proof, &root));
    }

    #[test]
    fn test_rejects_malformed_leaf() {
        let err = merkle_root(&["abc"]).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        assert!(merkle_proof(&leaves(2), 2).is_err());
    }
}
