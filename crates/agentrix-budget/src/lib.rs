//! Agentrix Budget - Milestone-gated budget pools
//!
//! A pool holds committed funds; milestones reserve part of them and, once
//! approved, release the reservation to their participants.
//!
//! # Pool lifecycle
//!
//! ```text
//! draft ──fund──> funded ──fully funded──> active ──released == funded──> depleted
//!   │               │                        │
//!   └───────────────┴──── cancel / expire ───┘
//! ```
//!
//! # Milestone lifecycle
//!
//! ```text
//! pending -> in_progress -> pending_review -> approved -> released
//!                                  │    (auto)  ^
//!                                  └-> rejected
//! ```
//!
//! For every pool `funded >= reserved + released` holds after each
//! operation. Reservation and release run under the engine's write lock so
//! concurrent callers never act on a stale `available`.

pub mod pool;
pub mod milestone;
pub mod collaborators;
pub mod engine;

pub use pool::*;
pub use milestone::*;
pub use collaborators::*;
pub use engine::*;
