//! Agentrix Authz - Spending grants and real-time policy evaluation
//!
//! A user grants an agent bounded authority to spend on their behalf. This
//! crate owns those grants and decides, per candidate payment, whether the
//! agent may execute it:
//!
//! - `AuthorizationRegistry`: create, list, update, revoke, suspend grants
//!   and record usage after a payment actually executed
//! - `UsageAggregator`: daily / monthly consumption derived from the
//!   history of completed payments
//! - `PolicyCheck`: user-defined custom policies, dispatched through a trait
//! - `PolicyEvaluator`: the ordered check pipeline producing a `Decision`
//!
//! # Invariants
//!
//! 1. Evaluation never consumes a grant; only `record_usage` moves counters
//! 2. Counters never exceed their limit once accepted
//! 3. Counter updates are one atomic read-modify-write per grant
//! 4. A denial is a `Decision`, never an error

pub mod authorization;
pub mod store;
pub mod usage;
pub mod registry;
pub mod policy;
pub mod evaluator;

pub use authorization::*;
pub use store::*;
pub use usage::*;
pub use registry::*;
pub use policy::*;
pub use evaluator::*;
