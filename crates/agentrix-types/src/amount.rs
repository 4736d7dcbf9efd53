//! Micro-unit currency amounts
//!
//! All pool, milestone and split figures are unsigned integers in the
//! smallest currency unit. Persisted values are integer strings; legacy
//! decimal strings such as `"0.000000"` are accepted and truncated at the
//! decimal point before parsing.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{AgentrixError, Result, BPS_DENOMINATOR};

/// Micro-units per whole currency unit (6 decimals)
pub const MICRO_UNITS_PER_UNIT: u128 = 1_000_000;

/// An amount in micro-units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MicroAmount(pub u128);

impl MicroAmount {
    pub const ZERO: MicroAmount = MicroAmount(0);

    pub fn new(micro_units: u128) -> Self {
        Self(micro_units)
    }

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Raw micro-unit value
    pub fn value(&self) -> u128 {
        self.0
    }

    pub fn checked_add(self, other: MicroAmount) -> Option<MicroAmount> {
        self.0.checked_add(other.0).map(MicroAmount)
    }

    pub fn checked_sub(self, other: MicroAmount) -> Option<MicroAmount> {
        self.0.checked_sub(other.0).map(MicroAmount)
    }

    pub fn saturating_sub(self, other: MicroAmount) -> MicroAmount {
        MicroAmount(self.0.saturating_sub(other.0))
    }

    /// Add, failing with `AmountOverflow`
    pub fn try_add(self, other: MicroAmount) -> Result<MicroAmount> {
        self.checked_add(other).ok_or(AgentrixError::AmountOverflow)
    }

    /// Subtract, failing with `AmountUnderflow`
    pub fn try_sub(self, other: MicroAmount) -> Result<MicroAmount> {
        self.checked_sub(other).ok_or(AgentrixError::AmountUnderflow)
    }

    /// `self * bps / 10000`, rounded down
    pub fn apply_bps(self, bps: u32) -> Result<MicroAmount> {
        self.0
            .checked_mul(bps as u128)
            .map(|v| MicroAmount(v / BPS_DENOMINATOR as u128))
            .ok_or(AgentrixError::AmountOverflow)
    }

    /// Parse a persisted amount, truncating any fractional part
    ///
    /// `"1500"`, `"1500.999"` and `"1500."` all parse to 1500; `"0.000000"`
    /// parses to zero. Signs, blanks and non-digits are rejected.
    pub fn parse_truncated(input: &str) -> Result<MicroAmount> {
        let trimmed = input.trim();
        let integer_part = trimmed.split('.').next().unwrap_or_default();
        let integer_part = if integer_part.is_empty() && trimmed.starts_with('.') {
            "0"
        } else {
            integer_part
        };

        if integer_part.is_empty() || !integer_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AgentrixError::invalid_input(
                "amount",
                format!("'{}' is not a non-negative integer amount", input),
            ));
        }

        integer_part
            .parse::<u128>()
            .map(MicroAmount)
            .map_err(|_| AgentrixError::AmountOverflow)
    }

    /// Convert a decimal currency value to micro-units, truncating below one micro-unit
    pub fn from_decimal(value: Decimal) -> Result<MicroAmount> {
        if value.is_sign_negative() {
            return Err(AgentrixError::invalid_input("amount", "must not be negative"));
        }
        value
            .checked_mul(Decimal::from(MICRO_UNITS_PER_UNIT as u64))
            .ok_or(AgentrixError::AmountOverflow)?
            .trunc()
            .to_u128()
            .map(MicroAmount)
            .ok_or(AgentrixError::AmountOverflow)
    }

    /// Convert to a decimal currency value
    pub fn to_decimal(&self) -> Result<Decimal> {
        let whole = Decimal::from_u128(self.0).ok_or(AgentrixError::AmountOverflow)?;
        Ok(whole / Decimal::from(MICRO_UNITS_PER_UNIT as u64))
    }
}

impl fmt::Display for MicroAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MicroAmount {
    type Err = AgentrixError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_truncated(s)
    }
}

impl From<u64> for MicroAmount {
    fn from(v: u64) -> Self {
        Self(v as u128)
    }
}

impl std::iter::Sum for MicroAmount {
    fn sum<I: Iterator<Item = MicroAmount>>(iter: I) -> Self {
        MicroAmount(iter.map(|a| a.0).sum())
    }
}

impl Serialize for MicroAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for MicroAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => MicroAmount::parse_truncated(&s).map_err(de::Error::custom),
            Raw::Int(v) => Ok(MicroAmount(v as u128)),
        }
    }
}
