//! YAML/JSON → [`AggregationDefinition`] loading.
//!
//! Handles:
//! - Single- and multi-document YAML (`---` separated)
//! - JSON files holding one definition object or an array of them
//! - Timespans as strings (`5m`) or raw milliseconds
//! - Conditions as condition-language strings or as the tagged JSON tree
//! - Directory loading with per-file error collection

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::ast::*;
use crate::condition::parse_condition;
use crate::error::{DefinitionError, Result};
use crate::value::Timespan;

// =============================================================================
// Public API
// =============================================================================

/// Parse a YAML string containing one or more definition documents.
///
/// A malformed document is recorded in [`DefinitionCollection::errors`] and
/// does not prevent the remaining documents from loading.
pub fn parse_definitions_yaml(yaml: &str) -> Result<DefinitionCollection> {
    let mut collection = DefinitionCollection::new();

    for (index, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value: Value = match Value::deserialize(doc) {
            Ok(v) => v,
            Err(e) => {
                collection
                    .errors
                    .push(format!("document {index}: YAML parse error: {e}"));
                continue;
            }
        };

        push_document(&mut collection, index, &value);
    }

    Ok(collection)
}

/// Parse a JSON string holding one definition object or an array of them.
///
/// Malformed JSON fails the whole input with [`DefinitionError::Json`]. An
/// array element that is not a valid definition is recorded in
/// [`DefinitionCollection::errors`] like a bad YAML document.
pub fn parse_definitions_json(json: &str) -> Result<DefinitionCollection> {
    let documents = match serde_json::from_str::<Value>(json)? {
        Value::Sequence(items) => items,
        other => vec![other],
    };

    let mut collection = DefinitionCollection::new();
    for (index, value) in documents.iter().enumerate() {
        push_document(&mut collection, index, value);
    }
    Ok(collection)
}

/// Parse a single definition file; `.json` files are read as JSON, anything
/// else as YAML.
pub fn parse_definition_file(path: &Path) -> Result<DefinitionCollection> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_definitions_json(&content),
        _ => parse_definitions_yaml(&content),
    }
}

/// Parse all definition files (`.yml`, `.yaml`, `.json`) under a directory,
/// recursively.
pub fn parse_definition_directory(dir: &Path) -> Result<DefinitionCollection> {
    let mut collection = DefinitionCollection::new();

    fn walk(dir: &Path, collection: &mut DefinitionCollection) -> Result<()> {
        let mut entries = std::fs::read_dir(dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        entries.sort();

        for path in entries {
            if path.is_dir() {
                walk(&path, collection)?;
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yml" | "yaml" | "json")
            ) {
                match parse_definition_file(&path) {
                    Ok(sub) => {
                        collection.definitions.extend(sub.definitions);
                        collection
                            .errors
                            .extend(sub.errors.into_iter().map(|e| format!("{}: {e}", path.display())));
                    }
                    Err(e) => {
                        collection.errors.push(format!("{}: {e}", path.display()));
                    }
                }
            }
        }
        Ok(())
    }

    walk(dir, &mut collection)?;
    Ok(collection)
}

fn push_document(collection: &mut DefinitionCollection, index: usize, value: &Value) {
    if value.is_null() {
        return;
    }

    match parse_definition_value(value) {
        Ok(def) => collection.definitions.push(def),
        Err(e) => {
            let label = value
                .as_mapping()
                .and_then(|m| get_str(m, "id"))
                .map(|id| format!("definition '{id}'"))
                .unwrap_or_else(|| format!("document {index}"));
            collection.errors.push(format!("{label}: {e}"));
        }
    }
}

/// Parse a single YAML value into a definition.
pub fn parse_definition_value(value: &Value) -> Result<AggregationDefinition> {
    let m = value
        .as_mapping()
        .ok_or_else(|| DefinitionError::InvalidDefinition("Document is not a mapping".into()))?;

    let id = get_scalar_string(m, "id").ok_or_else(|| DefinitionError::MissingField("id".into()))?;
    let title = get_str(m, "title").map(str::to_string).unwrap_or_else(|| id.clone());
    let query = get_str(m, "query").unwrap_or_default().to_string();

    let group_by = match m.get(val_key("group_by")).or_else(|| m.get(val_key("group-by"))) {
        Some(v) => string_list(v, "group_by")?,
        None => Vec::new(),
    };

    let series = match m.get(val_key("series")) {
        Some(Value::Sequence(seq)) => seq
            .iter()
            .enumerate()
            .map(|(i, v)| parse_series(v, i))
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(DefinitionError::InvalidSeries(
                "'series' must be a list".into(),
            ));
        }
    };

    let conditions = match m.get(val_key("conditions")) {
        Some(v) => parse_conditions_value(v)?,
        None => None,
    };

    Ok(AggregationDefinition {
        id,
        title,
        query,
        filters: match m.get(val_key("filters")) {
            Some(v) => string_list(v, "filters")?,
            None => Vec::new(),
        },
        streams: match m.get(val_key("streams")) {
            Some(v) => string_list(v, "streams")?.into_iter().collect(),
            None => BTreeSet::new(),
        },
        group_by,
        series,
        conditions,
        search_within_ms: parse_duration_field(m, "search_within")?.unwrap_or(60_000),
        execute_every_ms: parse_duration_field(m, "execute_every")?.unwrap_or(60_000),
        batch_size: get_u64(m, "batch_size")?.map(|v| v as usize),
        event_limit: get_u64(m, "event_limit")?.unwrap_or(0) as usize,
    })
}

/// Parse a `conditions` value: a condition-language string, the tagged JSON
/// tree, or either of those wrapped as `{expression: ...}`. Null means none.
pub fn parse_conditions_value(value: &Value) -> Result<Option<Expr>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => parse_condition(s).map(Some),
        Value::Bool(true) => Ok(Some(Expr::True)),
        Value::Mapping(m) => {
            if let Some(inner) = m.get(val_key("expression")) {
                return parse_conditions_value(inner);
            }
            let expr: Expr = serde_yaml::from_value(value.clone())?;
            Ok(Some(expr))
        }
        _ => Err(DefinitionError::Condition(
            "conditions must be a string or an expression mapping".into(),
        )),
    }
}

// =============================================================================
// Series
// =============================================================================

fn parse_series(value: &Value, index: usize) -> Result<Series> {
    let m = value
        .as_mapping()
        .ok_or_else(|| DefinitionError::InvalidSeries(format!("series {index} is not a mapping")))?;

    let id = get_scalar_string(m, "id")
        .ok_or_else(|| DefinitionError::InvalidSeries(format!("series {index} has no id")))?;

    let function_name = get_str(m, "function")
        .or_else(|| get_str(m, "type"))
        .ok_or_else(|| DefinitionError::InvalidSeries(format!("series '{id}' has no function")))?;
    let function: AggregationFunction = function_name.parse()?;

    let field = get_str(m, "field")
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string);

    let percentile = match m.get(val_key("percentile")) {
        Some(v) => Some(v.as_f64().ok_or_else(|| {
            DefinitionError::InvalidSeries(format!("series '{id}': percentile must be a number"))
        })?),
        None => None,
    };

    Ok(Series {
        id,
        function,
        field,
        percentile,
    })
}

// =============================================================================
// Helpers
// =============================================================================

fn val_key(s: &str) -> Value {
    Value::String(s.to_string())
}

fn get_str<'a>(m: &'a Mapping, key: &str) -> Option<&'a str> {
    m.get(val_key(key)).and_then(|v| v.as_str())
}

/// Strings or numbers (YAML happily reads `id: 42` as an integer).
fn get_scalar_string(m: &Mapping, key: &str) -> Option<String> {
    match m.get(val_key(key))? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn get_u64(m: &Mapping, key: &str) -> Result<Option<u64>> {
    match m.get(val_key(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            DefinitionError::InvalidDefinition(format!("'{key}' must be a non-negative integer"))
        }),
    }
}

fn string_list(value: &Value, key: &str) -> Result<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Sequence(seq) => seq
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(DefinitionError::InvalidDefinition(format!(
                    "'{key}' must contain only strings"
                ))),
            })
            .collect(),
        _ => Err(DefinitionError::InvalidDefinition(format!(
            "'{key}' must be a string or a list of strings"
        ))),
    }
}

/// `<name>` as a timespan string or integer milliseconds, or `<name>_ms`.
fn parse_duration_field(m: &Mapping, name: &str) -> Result<Option<u64>> {
    match m.get(val_key(name)) {
        Some(Value::String(s)) => return Timespan::parse(s).map(|t| Some(t.millis)),
        Some(Value::Number(n)) => {
            return n
                .as_u64()
                .map(Some)
                .ok_or_else(|| DefinitionError::InvalidTimespan(n.to_string()));
        }
        Some(Value::Null) | None => {}
        Some(_) => return Err(DefinitionError::InvalidTimespan(format!("{name}: not a timespan"))),
    }
    get_u64(m, &format!("{name}_ms"))
}

// =============================================================================
// Tests
// =============================================================================
