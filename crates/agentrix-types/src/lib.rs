//! Agentrix Types - Canonical types for the authorization & settlement engine
//!
//! This crate has no dependencies on other agentrix crates. It defines:
//!
//! - Identity types (UserId, AgentId, AuthorizationId, PoolId, ...)
//! - `MicroAmount`, the integer smallest-unit currency amount
//! - The shared error taxonomy (`AgentrixError`)
//! - Hashing and signature helpers (SHA-256, Ed25519)
//! - `EngineConfig`, loaded from the environment
//!
//! # Numeric discipline
//!
//! Pool, milestone and split amounts are integers in micro-units and are
//! never represented as floating point. Authorization limits are decimal
//! currency values (`rust_decimal::Decimal`).

pub mod identity;
pub mod amount;
pub mod crypto;
pub mod config;
pub mod error;

pub use identity::*;
pub use amount::*;
pub use crypto::*;
pub use config::*;
pub use error::*;

pub use rust_decimal::Decimal;

/// Basis points in one whole (100%)
pub const BPS_DENOMINATOR: u32 = 10_000;
