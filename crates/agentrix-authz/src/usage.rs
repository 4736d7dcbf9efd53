//! Usage aggregation
//!
//! How much of a grant's allowance is already consumed is derived from the
//! history of completed payments, not from a separately stored total. The
//! daily window starts at local midnight; the monthly window at local
//! midnight on the first of the month.

use std::sync::Arc;

use agentrix_types::{AgentId, Result, UserId};
use chrono::{DateTime, Datelike, Days, Duration, FixedOffset, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::store::PaymentHistory;

/// Half-open `[start, end)` interval in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl UsageWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

fn local_midnight_utc(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let local_midnight = date.and_time(NaiveTime::MIN);
    let utc_naive = local_midnight - Duration::seconds(offset.local_minus_utc() as i64);
    Utc.from_utc_datetime(&utc_naive)
}

/// The local calendar day containing `now`
pub fn day_window(now: DateTime<Utc>, offset: FixedOffset) -> UsageWindow {
    let today = now.with_timezone(&offset).date_naive();
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    UsageWindow {
        start: local_midnight_utc(today, offset),
        end: local_midnight_utc(tomorrow, offset),
    }
}

/// The local calendar month containing `now`
pub fn month_window(now: DateTime<Utc>, offset: FixedOffset) -> UsageWindow {
    let today = now.with_timezone(&offset).date_naive();
    let first = today.with_day(1).unwrap_or(today);
    let next_first = first.checked_add_months(Months::new(1)).unwrap_or(first);
    UsageWindow {
        start: local_midnight_utc(first, offset),
        end: local_midnight_utc(next_first, offset),
    }
}

/// Consumption already recorded for (user, agent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub used_today: Decimal,
    pub used_this_month: Decimal,
}

/// Derives daily / monthly usage from completed payments
#[derive(Clone)]
pub struct UsageAggregator {
    history: Arc<dyn PaymentHistory>,
    offset: FixedOffset,
}

impl UsageAggregator {
    pub fn new(history: Arc<dyn PaymentHistory>, offset: FixedOffset) -> Self {
        Self { history, offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn history(&self) -> &Arc<dyn PaymentHistory> {
        &self.history
    }

    /// Sum of completed payments since local midnight
    pub async fn daily_usage(
        &self,
        user: &UserId,
        agent: Option<&AgentId>,
        now: DateTime<Utc>,
    ) -> Result<Decimal> {
        let window = day_window(now, self.offset);
        self.history
            .sum_completed(user, agent, window.start, window.end)
            .await
    }

    /// Sum of completed payments since the start of the local month
    pub async fn monthly_usage(
        &self,
        user: &UserId,
        agent: Option<&AgentId>,
        now: DateTime<Utc>,
    ) -> Result<Decimal> {
        let window = month_window(now, self.offset);
        self.history
            .sum_completed(user, agent, window.start, window.end)
            .await
    }

    pub async fn snapshot(
        &self,
        user: &UserId,
        agent: Option<&AgentId>,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot> {
        Ok(UsageSnapshot {
            used_today: self.daily_usage(user, agent, now).await?,
            used_this_month: self.monthly_usage(user, agent, now).await?,
        })
    }
}
