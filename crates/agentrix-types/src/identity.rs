//! Identity types for Agentrix
//!
//! Every identifier is a strongly typed wrapper so a pool id can never be
//! passed where a milestone id is expected. Generated ids carry a type
//! prefix; ids handed in by external collaborators (users, agents,
//! merchants) are accepted verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate ID types with common implementations
macro_rules! define_id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::new_v4()))
            }

            /// Wrap an externally supplied identifier
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Parties (supplied by the identity collaborator)
define_id_type!(UserId, "user", "Identifier of the human owner of grants, pools and plans");
define_id_type!(AgentId, "agent", "Identifier of an autonomous agent acting for a user");
define_id_type!(MerchantId, "merchant", "Identifier of a merchant receiving a payment");

// Authorization
define_id_type!(AuthorizationId, "auth", "Unique identifier for a spending grant");
define_id_type!(PolicyId, "policy", "Unique identifier for a user-defined custom policy");
define_id_type!(PaymentIntentId, "pi", "Unique identifier for a candidate payment");
define_id_type!(PaymentId, "pay", "Unique identifier for an executed payment");
define_id_type!(ConfirmationId, "confirm", "Unique identifier for a pending user confirmation");

// Audit
define_id_type!(ProofId, "proof", "Unique identifier for an audit proof record");
define_id_type!(AnchorId, "anchor", "Unique identifier for a Merkle anchor");

// Budgets & splits
define_id_type!(PoolId, "pool", "Unique identifier for a budget pool");
define_id_type!(MilestoneId, "ms", "Unique identifier for a milestone");
define_id_type!(PlanId, "plan", "Unique identifier for a split/allocation plan");
