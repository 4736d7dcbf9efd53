//! Agentrix Split - Fee and allocation engine
//!
//! Turns a gross amount into fee lines and per-recipient payout lines.
//!
//! # Computation order
//!
//! | Step | Amount |
//! |------|--------|
//! | On-ramp fee | `amount * onramp_bps / 10000` (if flagged) |
//! | Off-ramp fee | `amount * offramp_bps / 10000` (if flagged) |
//! | Split fee | `max(amount * split_bps / 10000, min_split_fee)` (if flagged) |
//! | Net | `amount - fees` |
//! | Distributable pool | `net * pool_bps / 10000` (3% by default) |
//! | Allocations | pool/platform rules from the pool, merchant rules from net |
//! | Merchant net | `net - allocations` |
//!
//! `fees + allocations + merchant_net == amount` always holds. Previews
//! are pure; only `record_usage` moves plan counters.

pub mod plan;
pub mod template;
pub mod allocation;
pub mod engine;

pub use plan::*;
pub use template::*;
pub use allocation::*;
pub use engine::*;
