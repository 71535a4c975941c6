//! Search backend interface: pivot aggregations and record scrolling.
//!
//! The backend is an injected collaborator. This module defines the request
//! and raw response shapes the processor exchanges with it, the metric
//! identifier encoding, and a drop guard that closes scroll cursors.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use corragg_parser::{AggregationFunction, Series};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::window::TimeRange;

// =============================================================================
// Errors
// =============================================================================

/// Failures reported by a [`SearchBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("query failed: {0}")]
    Query(String),

    #[error("scroll failed: {0}")]
    Scroll(String),

    #[error("record {index}/{id} not found")]
    RecordNotFound { index: String, id: String },

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// Records
// =============================================================================

/// A stored, time-stamped record as returned by a scroll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub index: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub stream_ids: BTreeSet<String>,
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

impl Record {
    /// Origin reference stored on events created from this record.
    pub fn origin_context(&self) -> String {
        format!("urn:corragg:record:{}:{}", self.index, self.id)
    }

    /// Inverse of [`Record::origin_context`]: `(index, id)`.
    pub fn parse_origin_context(context: &str) -> Option<(&str, &str)> {
        let rest = context.strip_prefix("urn:corragg:record:")?;
        let (index, id) = rest.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        Some((index, id))
    }
}

// =============================================================================
// Metric identifiers
// =============================================================================

/// Composite identifier of a metric cell: `metric/<function>/<field or ->/<series_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricKey {
    pub function: AggregationFunction,
    pub field: Option<String>,
    pub series_id: String,
}

impl MetricKey {
    pub fn for_series(series: &Series) -> Self {
        MetricKey {
            function: series.function,
            field: series.field.clone(),
            series_id: series.id.clone(),
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "metric/{}/{}/{}",
            self.function,
            self.field.as_deref().unwrap_or("-"),
            self.series_id
        )
    }
}

impl FromStr for MetricKey {
    type Err = String;

    /// The field may itself contain `/`; function and series id may not.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() < 4 || parts[0] != "metric" {
            return Err(format!("malformed metric identifier '{s}'"));
        }
        let function: AggregationFunction = parts[1]
            .parse()
            .map_err(|_| format!("unknown function in metric identifier '{s}'"))?;
        let series_id = parts[parts.len() - 1];
        if series_id.is_empty() {
            return Err(format!("metric identifier '{s}' has no series id"));
        }
        let field = parts[2..parts.len() - 1].join("/");
        Ok(MetricKey {
            function,
            field: (field != "-" && !field.is_empty()).then_some(field),
            series_id: series_id.to_string(),
        })
    }
}

// =============================================================================
// Requests
// =============================================================================

/// An opaque extra query contributed by an event query modifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalQuery {
    pub id: String,
    pub query: Value,
}

/// A grouped pivot aggregation over a time range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationRequest {
    pub definition_id: String,
    pub query: String,
    pub filters: Vec<String>,
    pub streams: BTreeSet<String>,
    pub timerange: TimeRange,
    /// Row pivots after the leading date-range bucket.
    pub group_by: Vec<String>,
    pub series: Vec<Series>,
    /// Date-range buckets, the first row pivot.
    pub time_buckets: Vec<TimeRange>,
    pub additional_queries: Vec<AdditionalQuery>,
}

impl AggregationRequest {
    /// Encoded metric identifiers, one per series, in series order.
    pub fn metric_keys(&self) -> Vec<String> {
        self.series
            .iter()
            .map(|s| MetricKey::for_series(s).to_string())
            .collect()
    }
}

/// A record scroll over a time range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrollRequest {
    pub definition_id: String,
    pub query: String,
    pub filters: Vec<String>,
    pub streams: BTreeSet<String>,
    pub timerange: TimeRange,
    pub batch_size: usize,
}

// =============================================================================
// Raw pivot response
// =============================================================================

pub const ROW_LEAF: &str = "leaf";
pub const ROW_NON_LEAF: &str = "non-leaf";
pub const CELL_ROW_LEAF: &str = "row-leaf";
pub const CELL_ROW_INNER: &str = "row-inner";

/// One metric cell of a pivot row. The last element of `key` is the metric identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotValue {
    pub key: Vec<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub rollup: bool,
    pub source: String,
}

/// One pivot row: key is `[bucket_end, g1..gn]` for result rows and
/// `[stream_id]` for stream rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotRow {
    pub key: Vec<String>,
    #[serde(default)]
    pub values: Vec<PivotValue>,
    pub source: String,
    /// Streams the row's records came from, when the backend reports them.
    #[serde(default)]
    pub source_streams: BTreeSet<String>,
}

/// The backend's raw answer to an [`AggregationRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAggregationResponse {
    pub effective_timerange: TimeRange,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub rows: Vec<PivotRow>,
    #[serde(default)]
    pub stream_rows: Vec<PivotRow>,
    #[serde(default)]
    pub additional_results: BTreeMap<String, Value>,
}

// =============================================================================
// Backend traits
// =============================================================================

/// A forward-only cursor over scrolled records.
pub trait ScrollCursor: Send {
    /// Next batch, or `None` once exhausted.
    fn next_batch(&mut self) -> Result<Option<Vec<Record>>, BackendError>;

    /// Release backend resources. Called exactly once by [`CursorGuard`].
    fn close(&mut self) -> Result<(), BackendError>;
}

/// The search/query backend.
pub trait SearchBackend: Send + Sync {
    fn run_aggregation(
        &self,
        request: &AggregationRequest,
    ) -> Result<RawAggregationResponse, BackendError>;

    fn open_scroll(&self, request: &ScrollRequest) -> Result<Box<dyn ScrollCursor>, BackendError>;

    fn get_record(&self, index: &str, id: &str) -> Result<Record, BackendError>;
}

/// Per-batch continuation signal for scroll loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollControl {
    Continue,
    Stop,
}

/// Closes the wrapped cursor when dropped, on every exit path.
pub struct CursorGuard {
    cursor: Box<dyn ScrollCursor>,
    closed: bool,
}

impl CursorGuard {
    pub fn new(cursor: Box<dyn ScrollCursor>) -> Self {
        CursorGuard {
            cursor,
            closed: false,
        }
    }

    pub fn next_batch(&mut self) -> Result<Option<Vec<Record>>, BackendError> {
        self.cursor.next_batch()
    }

    /// Drive the cursor until it is exhausted or `on_batch` asks to stop.
    /// Returns the number of records handed to `on_batch`.
    pub fn for_each_batch<E>(
        &mut self,
        mut on_batch: impl FnMut(Vec<Record>) -> Result<ScrollControl, E>,
    ) -> Result<usize, E>
    where
        E: From<BackendError>,
    {
        let mut seen = 0;
        while let Some(batch) = self.next_batch()? {
            if batch.is_empty() {
                break;
            }
            seen += batch.len();
            if on_batch(batch)? == ScrollControl::Stop {
                break;
            }
        }
        Ok(seen)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.cursor.close() {
            log::warn!("Failed to close scroll cursor: {e}");
        }
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.close();
    }
}
