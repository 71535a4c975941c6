//! Turns a raw pivot response into an [`AggregationResult`].
//!
//! Only `leaf` rows and `row-leaf` cells carry per-group values; everything
//! else (sub-totals, column totals) is dropped. Metric cells are matched to
//! series by the series id embedded in their identifier, never by
//! `(function, field)`, so two series with the same function on the same field
//! stay distinct.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeZone, Utc};
use corragg_parser::AggregationDefinition;
use serde_json::Value;

use crate::backend::{
    AggregationRequest, CELL_ROW_LEAF, MetricKey, PivotRow, RawAggregationResponse, ROW_LEAF,
};
use crate::error::{EvalError, Result};
use crate::result::{AggregationKeyResult, AggregationResult, AggregationSeriesValue};

/// Normalize `raw` for `definition`. Any shape anomaly aborts with
/// [`EvalError::Normalization`].
pub fn normalize(
    definition: &AggregationDefinition,
    request: &AggregationRequest,
    raw: RawAggregationResponse,
) -> Result<AggregationResult> {
    let mut key_results = Vec::with_capacity(raw.rows.len());
    for row in &raw.rows {
        if row.source != ROW_LEAF {
            continue;
        }
        key_results.push(normalize_row(definition, row)?);
    }

    let source_streams: BTreeSet<String> = raw
        .stream_rows
        .iter()
        .filter(|row| row.source == ROW_LEAF)
        .filter_map(|row| row.key.first())
        .filter(|stream| !stream.is_empty())
        .cloned()
        .collect();

    let requested: BTreeSet<&str> = request
        .additional_queries
        .iter()
        .map(|q| q.id.as_str())
        .collect();
    let additional_results: BTreeMap<String, Value> = raw
        .additional_results
        .into_iter()
        .filter(|(id, _)| requested.contains(id.as_str()))
        .collect();

    Ok(AggregationResult {
        effective_timerange: raw.effective_timerange,
        total_aggregated_messages: raw.total,
        source_streams,
        key_results,
        additional_results,
    })
}

fn normalize_row(definition: &AggregationDefinition, row: &PivotRow) -> Result<AggregationKeyResult> {
    let Some((bucket, group_key)) = row.key.split_first() else {
        return Err(EvalError::Normalization("leaf row with an empty key".into()));
    };

    let timestamp = parse_bucket_timestamp(bucket).ok_or_else(|| {
        EvalError::Normalization(format!("unparseable bucket timestamp '{bucket}'"))
    })?;

    if group_key.len() != definition.group_by.len() {
        return Err(EvalError::Normalization(format!(
            "row key {:?} has {} group values, definition groups by {} fields",
            row.key,
            group_key.len(),
            definition.group_by.len()
        )));
    }

    let mut values: Vec<Option<f64>> = vec![None; definition.series.len()];
    for cell in &row.values {
        if cell.source != CELL_ROW_LEAF {
            continue;
        }

        let identifier = cell
            .key
            .last()
            .ok_or_else(|| EvalError::Normalization("metric cell without a key".into()))?;
        let metric: MetricKey = identifier.parse().map_err(EvalError::Normalization)?;

        let index = definition
            .series
            .iter()
            .position(|s| s.id == metric.series_id)
            .ok_or_else(|| {
                EvalError::Normalization(format!(
                    "metric '{identifier}' references unknown series '{}'",
                    metric.series_id
                ))
            })?;

        let series = &definition.series[index];
        if series.function != metric.function || series.field != metric.field {
            return Err(EvalError::Normalization(format!(
                "metric '{identifier}' does not match series '{}' ({})",
                series.id,
                series.literal()
            )));
        }

        values[index] = Some(cell_value(identifier, cell.value.as_ref())?);
    }

    let series_values = definition
        .series
        .iter()
        .zip(values)
        .map(|(series, value)| AggregationSeriesValue {
            key: group_key.to_vec(),
            value: value.unwrap_or(f64::NAN),
            series: series.clone(),
        })
        .collect();

    Ok(AggregationKeyResult {
        key: group_key.to_vec(),
        timestamp: Some(timestamp),
        series_values,
        source_streams: row.source_streams.clone(),
    })
}

fn cell_value(identifier: &str, value: Option<&Value>) -> Result<f64> {
    match value {
        None | Some(Value::Null) => Ok(f64::NAN),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| {
            EvalError::Normalization(format!("metric '{identifier}' value {n} is not representable"))
        }),
        Some(other) => Err(EvalError::Normalization(format!(
            "metric '{identifier}' has non-numeric value {other}"
        ))),
    }
}

/// RFC 3339 or epoch milliseconds.
fn parse_bucket_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    s.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}
