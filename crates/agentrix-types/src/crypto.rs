//! Hashing and signature helpers
//!
//! Digests are SHA-256 rendered as 64 lowercase hex characters. Decision
//! payloads may carry an Ed25519 signature from the caller; keys and
//! signatures travel hex-encoded.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{AgentrixError, Result};

/// Length of a hex-encoded SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

/// A keypair for signing decision payloads
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign a message, returning the hex signature
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

/// Verify a hex signature against a hex public key
pub fn verify_signature(public_key_hex: &str, message: &[u8], signature_hex: &str) -> Result<()> {
    let public_key_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|e| AgentrixError::Crypto {
            message: format!("Invalid public key hex: {}", e),
        })?
        .try_into()
        .map_err(|_| AgentrixError::Crypto {
            message: "Public key must be 32 bytes".to_string(),
        })?;

    let verifying_key =
        VerifyingKey::from_bytes(&public_key_bytes).map_err(|e| AgentrixError::Crypto {
            message: format!("Invalid public key: {}", e),
        })?;

    let signature_bytes: [u8; 64] = hex::decode(signature_hex)
        .map_err(|e| AgentrixError::InvalidSignature {
            reason: format!("signature is not hex: {}", e),
        })?
        .try_into()
        .map_err(|_| AgentrixError::InvalidSignature {
            reason: "signature must be 64 bytes".to_string(),
        })?;

    let signature = Signature::from_bytes(&signature_bytes);
    verifying_key.verify(message, &signature)?;
    Ok(())
}

/// SHA-256 of raw bytes as hex
pub fn hash_sha256(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// SHA-256 of raw bytes
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over the canonical JSON encoding of a value
///
/// Canonical here means serde's struct field order; callers hash typed
/// structs, never free-form maps.
pub fn hash_object<T: Serialize>(obj: &T) -> Result<String> {
    let json = serde_json::to_vec(obj)?;
    Ok(hash_sha256(&json))
}

/// Whether a string is a well-formed 64-char lowercase hex digest
pub fn is_hash_hex(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
