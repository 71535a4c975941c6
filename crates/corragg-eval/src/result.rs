//! Normalized aggregation result types.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use corragg_parser::Series;
use serde::Serialize;
use serde_json::Value;

use crate::window::TimeRange;

/// One series value of a key result. `value` is NaN when the backend
/// reported null or nothing at all.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationSeriesValue {
    pub key: Vec<String>,
    pub value: f64,
    pub series: Series,
}

/// One group combination with its series values.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationKeyResult {
    /// Group-by values in definition order; empty when ungrouped.
    pub key: Vec<String>,
    /// The row's date-range bucket key. Backends key a bucket by its end, so
    /// this matches the `to` of one of the request's `time_buckets`.
    pub timestamp: Option<DateTime<Utc>>,
    pub series_values: Vec<AggregationSeriesValue>,
    /// Streams reported for this row; empty when the backend does not report them.
    pub source_streams: BTreeSet<String>,
}

impl AggregationKeyResult {
    /// Series values keyed by series id, the lookup table conditions run against.
    pub fn values_by_series_id(&self) -> HashMap<&str, f64> {
        self.series_values
            .iter()
            .map(|v| (v.series.id.as_str(), v.value))
            .collect()
    }
}

/// The normalized answer to an aggregation request.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationResult {
    pub effective_timerange: TimeRange,
    pub total_aggregated_messages: i64,
    pub source_streams: BTreeSet<String>,
    pub key_results: Vec<AggregationKeyResult>,
    pub additional_results: BTreeMap<String, Value>,
}
