//! Agentrix Gateway - Agent payment execution
//!
//! Ties the policy evaluator, the payment executor and the audit ledger
//! into the flow an agent payment takes:
//!
//! 1. Replay the cached outcome for a known idempotency key
//! 2. Verify the caller's signature over the payment, when one is supplied
//! 3. Evaluate against the user's grants
//! 4. Authorized: count usage, execute, audit the outcome
//! 5. Otherwise: downgrade to a user confirmation that expires
//!
//! Every path leaves exactly one audit proof per step on the agent's chain.
//! A payment that executed stays executed even if its proof could not be
//! appended.

pub mod executor;
pub mod confirmation;
pub mod gateway;

pub use executor::*;
pub use confirmation::*;
pub use gateway::*;
