//! Agentrix Audit - Append-only, hash-chained evidence ledger
//!
//! Every authorization decision and payment outcome produces one
//! `AuditProof`. Proofs sharing a chain key (the agent id when present,
//! else the payment-intent id) form a singly linked SHA-256 chain seeded
//! with an all-zero sentinel. Periodically, every proof created in a time
//! window is digested into a Merkle root and published to an external
//! attestation service.
//!
//! Records are never updated or deleted. Anchoring summarizes; it never
//! replaces.

pub mod proof;
pub mod store;
pub mod ledger;
pub mod merkle;
pub mod anchor;

pub use proof::*;
pub use store::*;
pub use ledger::*;
pub use merkle::*;
pub use anchor::*;
