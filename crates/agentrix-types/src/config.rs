//! Engine configuration

use std::str::FromStr;

use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::MicroAmount;

/// Tunables shared by the engine crates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Offset of "local midnight" from UTC, in minutes (usage windows)
    pub day_offset_minutes: i32,
    /// How long a downgraded payment waits for user confirmation
    pub confirmation_ttl_minutes: i64,
    /// How long a payment outcome is replayed for its idempotency key
    pub idempotency_ttl_hours: i64,
    /// Share of a split's net amount earmarked as the distributable pool
    pub distributable_pool_bps: u32,
    /// Width of an audit anchoring window
    pub anchor_window_hours: i64,
    /// Attempts for an audit append that loses a head race
    pub chain_append_retries: u32,
    /// Default on-ramp fee
    pub onramp_fee_bps: u32,
    /// Default off-ramp fee
    pub offramp_fee_bps: u32,
    /// Default split fee
    pub split_fee_bps: u32,
    /// Default minimum split fee
    pub min_split_fee: MicroAmount,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            day_offset_minutes: 0,
            confirmation_ttl_minutes: 30,
            idempotency_ttl_hours: 24,
            distributable_pool_bps: 300,
            anchor_window_hours: 24,
            chain_append_retries: 3,
            onramp_fee_bps: 10,
            offramp_fee_bps: 10,
            split_fee_bps: 30,
            min_split_fee: MicroAmount(100_000),
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables (loads `.env` if present)
    ///
    /// Unset variables fall back to the defaults; unparsable ones are
    /// logged and also fall back.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();
        Self {
            day_offset_minutes: env_or("AGENTRIX_DAY_OFFSET_MINUTES", defaults.day_offset_minutes),
            confirmation_ttl_minutes: env_or(
                "AGENTRIX_CONFIRMATION_TTL_MINUTES",
                defaults.confirmation_ttl_minutes,
            ),
            idempotency_ttl_hours: env_or(
                "AGENTRIX_IDEMPOTENCY_TTL_HOURS",
                defaults.idempotency_ttl_hours,
            ),
            distributable_pool_bps: env_or(
                "AGENTRIX_DISTRIBUTABLE_POOL_BPS",
                defaults.distributable_pool_bps,
            ),
            anchor_window_hours: env_or("AGENTRIX_ANCHOR_WINDOW_HOURS", defaults.anchor_window_hours),
            chain_append_retries: env_or(
                "AGENTRIX_CHAIN_APPEND_RETRIES",
                defaults.chain_append_retries,
            ),
            onramp_fee_bps: env_or("AGENTRIX_ONRAMP_FEE_BPS", defaults.onramp_fee_bps),
            offramp_fee_bps: env_or("AGENTRIX_OFFRAMP_FEE_BPS", defaults.offramp_fee_bps),
            split_fee_bps: env_or("AGENTRIX_SPLIT_FEE_BPS", defaults.split_fee_bps),
            min_split_fee: env_or("AGENTRIX_MIN_SPLIT_FEE", defaults.min_split_fee),
        }
    }

    /// The configured local-day offset; out-of-range values fall back to UTC
    pub fn day_offset(&self) -> FixedOffset {
        self.day_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn confirmation_ttl(&self) -> Duration {
        Duration::minutes(self.confirmation_ttl_minutes)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::hours(self.idempotency_ttl_hours)
    }

    pub fn anchor_window(&self) -> Duration {
        Duration::hours(self.anchor_window_hours)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
                default
            }
        },
        Err(_) => default,
    }
}
