//! Correlation events and the hooks that shape them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use corragg_parser::AggregationDefinition;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::backend::{AdditionalQuery, Record};
use crate::result::AggregationKeyResult;

/// An event field value: series values are numbers, keys are text.
///
/// A series with no value is `Number(NaN)`, which JSON cannot represent: it
/// serializes as `null`, and `null` deserializes back to `Number(NaN)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(#[serde(deserialize_with = "null_as_nan")] f64),
    Text(String),
}

fn null_as_nan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Number(_) => None,
        }
    }
}

/// What a user needs to re-run the search behind an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayInfo {
    pub timerange_start: DateTime<Utc>,
    pub timerange_end: DateTime<Utc>,
    pub query: String,
    pub streams: BTreeSet<String>,
    pub filters: Vec<String>,
}

/// An emitted correlation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEvent {
    pub id: String,
    pub definition_id: String,
    pub definition_title: String,
    pub event_timestamp: DateTime<Utc>,
    pub timerange_start: DateTime<Utc>,
    pub timerange_end: DateTime<Utc>,
    pub message: String,
    pub source_streams: BTreeSet<String>,
    /// Group-by field names and their values, in definition order.
    pub group_by_fields: Vec<(String, String)>,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_info: Option<ReplayInfo>,
}

impl CorrelationEvent {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn group_by_value(&self, field: &str) -> Option<&str> {
        self.group_by_fields
            .iter()
            .find(|(k, _)| k == field)
            .map(|(_, v)| v.as_str())
    }
}

/// An event plus the context it was created in.
#[derive(Debug, Clone, Serialize)]
pub struct EventWithContext {
    pub event: CorrelationEvent,
    /// The source record, for events created per record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    /// State contributed by event query modifiers.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub modifier_state: BTreeMap<String, Value>,
}

/// Creates the skeleton of an event; the processor fills in the rest.
pub trait EventFactory: Send + Sync {
    fn create_event(
        &self,
        definition: &AggregationDefinition,
        timestamp: DateTime<Utc>,
        message: &str,
    ) -> CorrelationEvent;
}

/// Assigns a random v4 UUID to every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEventFactory;

impl EventFactory for DefaultEventFactory {
    fn create_event(
        &self,
        definition: &AggregationDefinition,
        timestamp: DateTime<Utc>,
        message: &str,
    ) -> CorrelationEvent {
        CorrelationEvent {
            id: uuid::Uuid::new_v4().to_string(),
            definition_id: definition.id.clone(),
            definition_title: definition.title.clone(),
            event_timestamp: timestamp,
            timerange_start: timestamp,
            timerange_end: timestamp,
            message: message.to_string(),
            source_streams: BTreeSet::new(),
            group_by_fields: Vec::new(),
            fields: BTreeMap::new(),
            origin_context: None,
            replay_info: None,
        }
    }
}

/// Hook that runs on every event before it is emitted.
///
/// `key_result` is the group that produced the event in aggregation mode and
/// `None` for events built from individual records in filter-only mode.
pub trait EventDecorator: Send + Sync {
    fn decorate(
        &self,
        event: &mut CorrelationEvent,
        definition: &AggregationDefinition,
        key_result: Option<&AggregationKeyResult>,
    );
}

/// Contributes extra queries to the aggregation request and turns their
/// results into per-event state.
pub trait EventQueryModifier: Send + Sync {
    fn additional_queries(&self, definition: &AggregationDefinition) -> Vec<AdditionalQuery>;

    fn event_modifier_data(
        &self,
        additional_results: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_factory_ids_are_unique() {
        let def = AggregationDefinition::new("d1", "Title", "*");
        let now = Utc::now();
        let a = DefaultEventFactory.create_event(&def, now, "m");
        let b = DefaultEventFactory.create_event(&def, now, "m");
        assert_ne!(a.id, b.id);
        assert_eq!(a.definition_title, "Title");
        assert_eq!(a.event_timestamp, now);
    }

    #[test]
    fn test_field_value_serializes_untagged() {
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), FieldValue::Number(1.5));
        fields.insert("s".to_string(), FieldValue::Text("a|b".into()));
        let json = serde_json::to_value(&fields).unwrap();
        assert_eq!(json, serde_json::json!({"n": 1.5, "s": "a|b"}));
    }

    #[test]
    fn test_nan_field_is_null_in_json() {
        let json = serde_json::to_string(&FieldValue::Number(f64::NAN)).unwrap();
        assert_eq!(json, "null");

        let back: FieldValue = serde_json::from_str(&json).unwrap();
        assert!(back.as_f64().is_some_and(f64::is_nan));
        let text: FieldValue = serde_json::from_str("\"x\"").unwrap();
        assert_eq!(text, FieldValue::Text("x".into()));
    }
}
