use std::fmt;

use serde::Serialize;

use crate::error::{DefinitionError, Result};

// =============================================================================
// Timespans: search window and execution interval sizes
// =============================================================================

/// Unit of time for a [`Timespan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimespanUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

impl fmt::Display for TimespanUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            TimespanUnit::Millisecond => "ms",
            TimespanUnit::Second => "s",
            TimespanUnit::Minute => "m",
            TimespanUnit::Hour => "h",
            TimespanUnit::Day => "d",
            TimespanUnit::Week => "w",
        };
        write!(f, "{c}")
    }
}

/// A parsed timespan like `500ms`, `15s`, `5m`, `1h`, `7d`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timespan {
    pub count: u64,
    pub unit: TimespanUnit,
    /// Equivalent duration in milliseconds.
    pub millis: u64,
    /// Original string representation.
    pub original: String,
}

impl Timespan {
    /// Parse a timespan string like `"5m"`, `"15s"`, `"250ms"`.
    ///
    /// Supported units: `ms`, `s`, `m`, `h`, `d`, `w`.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| DefinitionError::InvalidTimespan(s.to_string()))?;
        let (count_str, unit_str) = trimmed.split_at(split);
        if count_str.is_empty() {
            return Err(DefinitionError::InvalidTimespan(s.to_string()));
        }
        let count: u64 = count_str
            .parse()
            .map_err(|_| DefinitionError::InvalidTimespan(s.to_string()))?;

        let (unit, multiplier) = match unit_str {
            "ms" => (TimespanUnit::Millisecond, 1u64),
            "s" => (TimespanUnit::Second, 1_000),
            "m" => (TimespanUnit::Minute, 60_000),
            "h" => (TimespanUnit::Hour, 3_600_000),
            "d" => (TimespanUnit::Day, 86_400_000),
            "w" => (TimespanUnit::Week, 604_800_000),
            _ => return Err(DefinitionError::InvalidTimespan(s.to_string())),
        };

        let millis = count
            .checked_mul(multiplier)
            .ok_or_else(|| DefinitionError::InvalidTimespan(s.to_string()))?;

        Ok(Timespan {
            count,
            unit,
            millis,
            original: trimmed.to_string(),
        })
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}
