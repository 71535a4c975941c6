//! Absolute time ranges and date-range bucketing.

use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Result};

/// An absolute `[from, to]` time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from > to {
            return Err(EvalError::InvalidTimeRange(format!(
                "from {from} is after to {to}"
            )));
        }
        Ok(TimeRange { from, to })
    }

    /// Build a range from Unix epoch milliseconds.
    pub fn from_millis(from_ms: i64, to_ms: i64) -> Result<Self> {
        let from = Utc
            .timestamp_millis_opt(from_ms)
            .single()
            .ok_or_else(|| EvalError::InvalidTimeRange(format!("bad timestamp {from_ms}")))?;
        let to = Utc
            .timestamp_millis_opt(to_ms)
            .single()
            .ok_or_else(|| EvalError::InvalidTimeRange(format!("bad timestamp {to_ms}")))?;
        TimeRange::new(from, to)
    }

    pub fn duration(&self) -> Duration {
        self.to - self.from
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.from && instant <= self.to
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.from.to_rfc3339(), self.to.to_rfc3339())
    }
}

/// Split `range` into sliding buckets of `within_ms`, one starting every
/// `every_ms`, until a bucket reaches `range.to`.
///
/// Always yields at least one bucket. A non-positive hop yields exactly one.
pub fn build_date_range_buckets(range: &TimeRange, within_ms: u64, every_ms: u64) -> Vec<TimeRange> {
    let within = Duration::milliseconds(within_ms.min(i64::MAX as u64) as i64);
    let every = Duration::milliseconds(every_ms.min(i64::MAX as u64) as i64);

    let mut buckets = Vec::new();
    let mut from = range.from;
    loop {
        let to = from.checked_add_signed(within).unwrap_or(DateTime::<Utc>::MAX_UTC);
        buckets.push(TimeRange { from, to });
        if every <= Duration::zero() || to >= range.to {
            break;
        }
        match from.checked_add_signed(every) {
            Some(next) => from = next,
            None => break,
        }
    }
    buckets
}
