mod helpers;

use std::collections::BTreeMap;
use std::sync::Arc;

use corragg_eval::{
    AdditionalQuery, AggregationKeyResult, CorrelationEvent, EvalError, EventDecorator,
    EventQueryModifier, ExecutionMode, FieldValue, ProcessorParameters,
};
use corragg_parser::AggregationDefinition;
use helpers::*;
use serde_json::{Value, json};

const FAILED_LOGINS: &str = r#"
id: failed-logins
title: Failed logins
query: action:login AND outcome:failure
streams: [stream-1]
group_by: [username]
series:
  - id: cnt
    function: count
"#;

const TWO_KEYS: &str = r#"
id: per-user-host
title: Per user and host
query: "*"
group_by: [username, host]
series:
  - id: cnt
    function: count
  - id: avg_took
    function: avg
    field: took
"#;

fn without_ids(events: &[CorrelationEvent]) -> Vec<CorrelationEvent> {
    events
        .iter()
        .cloned()
        .map(|mut e| {
            e.id.clear();
            e
        })
        .collect()
}

// =============================================================================
// Event shape
// =============================================================================

#[test]
fn aggregation_event_is_stamped_with_window_end() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![leaf_row(&["bob"], vec![cell("metric/count/-/cnt", json!(42))])],
    )));
    let processor = harness.processor(definition(FAILED_LOGINS));

    let (events, report) = processor.run(&ProcessorParameters::new(tr)).unwrap();

    assert_eq!(report.mode, ExecutionMode::Aggregation);
    assert_eq!(report.events_emitted, 1);
    let event = &events[0].event;
    assert_eq!(event.event_timestamp, ms(60_000));
    assert_eq!(event.timerange_start, ms(0));
    assert_eq!(event.timerange_end, ms(60_000));
    assert_eq!(event.definition_id, "failed-logins");
    assert_eq!(event.message, "Failed logins: bob - count()=42.0");
    assert_eq!(event.group_by_value("username"), Some("bob"));
    assert_eq!(
        event.field("aggregation_value_count"),
        Some(&FieldValue::Number(42.0))
    );
    assert_eq!(
        event.field("aggregation_key"),
        Some(&FieldValue::Text("bob".into()))
    );
    assert!(events[0].record.is_none());
}

#[test]
fn compound_key_is_joined_with_pipe() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![leaf_row(
            &["alice", "web-1"],
            vec![
                cell("metric/count/-/cnt", json!(3)),
                cell("metric/avg/took/avg_took", json!(12.5)),
            ],
        )],
    )));
    let processor = harness.processor(definition(TWO_KEYS));

    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();
    let event = &events[0].event;

    assert_eq!(
        event.field("aggregation_key"),
        Some(&FieldValue::Text("alice|web-1".into()))
    );
    assert_eq!(
        event.group_by_fields,
        vec![
            ("username".to_string(), "alice".to_string()),
            ("host".to_string(), "web-1".to_string())
        ]
    );
    assert_eq!(
        event.field("aggregation_value_avg_took"),
        Some(&FieldValue::Number(12.5))
    );
    assert_eq!(
        event.message,
        "Per user and host: alice|web-1 - count()=3.0 avg(took)=12.5"
    );
}

#[test]
fn null_metric_becomes_nan() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![leaf_row(
            &["alice", "web-1"],
            vec![
                cell("metric/count/-/cnt", json!(0)),
                cell("metric/avg/took/avg_took", Value::Null),
            ],
        )],
    )));
    let processor = harness.processor(definition(TWO_KEYS));

    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();
    let avg = events[0]
        .event
        .field("aggregation_value_avg_took")
        .and_then(FieldValue::as_f64)
        .unwrap();
    assert!(avg.is_nan());
    assert!(events[0].event.message.ends_with("avg(took)=NaN"));
}

#[test]
fn ungrouped_aggregation_has_empty_key() {
    let yaml = "id: total\ntitle: Total\nseries: [{id: cnt, function: count}]\n";
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![leaf_row(&[], vec![cell("metric/count/-/cnt", json!(7))])],
    )));
    let processor = harness.processor(definition(yaml));

    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();
    let event = &events[0].event;
    assert_eq!(event.message, "Total: count()=7.0");
    assert_eq!(
        event.field("aggregation_key"),
        Some(&FieldValue::Text(String::new()))
    );
    assert!(event.group_by_fields.is_empty());
}

#[test]
fn non_leaf_rows_produce_no_events() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![
            non_leaf_row(&[]),
            leaf_row(&["bob"], vec![cell("metric/count/-/cnt", json!(2))]),
        ],
    )));
    let processor = harness.processor(definition(FAILED_LOGINS));

    let (events, report) = processor.run(&ProcessorParameters::new(tr)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(report.key_results, 1);
}

// =============================================================================
// Request construction
// =============================================================================

#[test]
fn aggregation_request_carries_definition_and_buckets() {
    let yaml = r#"
id: w
title: W
query: level:error
streams: [stream-1, gone]
group_by: [host]
search_within: 5m
execute_every: 1m
series: [{id: cnt, function: count}]
"#;
    let tr = window(0, 300_000);
    let harness = Harness::new(FakeBackend::default());
    let processor = harness.processor(definition(yaml));

    processor.run(&ProcessorParameters::new(tr)).unwrap();

    let requests = harness.backend.aggregation_requests.lock().unwrap();
    let request = &requests[0];
    assert_eq!(request.query, "level:error");
    assert_eq!(request.group_by, vec!["host"]);
    assert_eq!(request.timerange, tr);
    // non-existing streams are dropped from the search
    assert_eq!(request.streams, set(&["stream-1"]));
    assert_eq!(request.time_buckets, vec![window(0, 300_000)]);
    assert_eq!(request.metric_keys(), vec!["metric/count/-/cnt"]);
}

const SLIDING: &str = r#"
id: sliding
title: Sliding
query: action:login
streams: [stream-1]
group_by: [username]
search_within: 1m
execute_every: 1m
series: [{id: cnt, function: count}]
"#;

#[test]
fn each_bucket_event_replays_its_own_bucket() {
    let tr = window(0, 120_000);
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![
            bucket_row("60000", &["bob"], vec![cell("metric/count/-/cnt", json!(3))]),
            bucket_row("120000", &["bob"], vec![cell("metric/count/-/cnt", json!(5))]),
        ],
    )));
    let processor = harness.processor(definition(SLIDING));

    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();

    let requests = harness.backend.aggregation_requests.lock().unwrap();
    assert_eq!(
        requests[0].time_buckets,
        vec![window(0, 60_000), window(60_000, 120_000)]
    );
    drop(requests);

    assert_eq!(events.len(), 2);
    let replays: Vec<_> = events
        .iter()
        .map(|e| {
            let replay = e.event.replay_info.as_ref().unwrap();
            (replay.timerange_start, replay.timerange_end)
        })
        .collect();
    assert_eq!(replays, vec![(ms(0), ms(60_000)), (ms(60_000), ms(120_000))]);
    for e in &events {
        assert_eq!(e.event.event_timestamp, ms(120_000));
        assert_eq!(e.event.timerange_start, ms(0));
        assert_eq!(e.event.timerange_end, ms(120_000));
    }

    processor
        .source_records_for_event(&events[1].event, 10, |_| Ok(()))
        .unwrap();
    let scrolls = harness.backend.scroll_requests.lock().unwrap();
    assert_eq!(scrolls[0].timerange, window(60_000, 120_000));
}

#[test]
fn unmatched_bucket_key_replays_the_window() {
    let tr = window(0, 120_000);
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![bucket_row("90000", &["bob"], vec![cell("metric/count/-/cnt", json!(3))])],
    )));
    let processor = harness.processor(definition(SLIDING));

    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();

    let replay = events[0].event.replay_info.as_ref().unwrap();
    assert_eq!((replay.timerange_start, replay.timerange_end), (tr.from, tr.to));
}

#[test]
fn parameter_streams_override_definition() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::default());
    let processor = harness.processor(definition(FAILED_LOGINS));

    processor
        .run(&ProcessorParameters::new(tr).with_streams(["stream-2"]))
        .unwrap();

    let requests = harness.backend.aggregation_requests.lock().unwrap();
    assert_eq!(requests[0].streams, set(&["stream-2"]));
}

#[test]
fn unconfigured_definition_searches_permitted_streams() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::default());
    harness.streams.set_permitted(set(&["stream-3"]));
    let processor = harness.processor(definition(TWO_KEYS));

    processor.run(&ProcessorParameters::new(tr)).unwrap();

    let requests = harness.backend.aggregation_requests.lock().unwrap();
    assert_eq!(requests[0].streams, set(&["stream-3"]));
}

// =============================================================================
// Source streams
// =============================================================================

fn single_bob(tr: corragg_eval::TimeRange) -> corragg_eval::RawAggregationResponse {
    response(
        tr,
        vec![leaf_row(&["bob"], vec![cell("metric/count/-/cnt", json!(1))])],
    )
}

#[test]
fn result_streams_win() {
    let tr = window(0, 60_000);
    let mut raw = single_bob(tr);
    raw.stream_rows = vec![stream_row("stream-2"), stream_row("stream-3")];
    let harness = Harness::new(FakeBackend::with_aggregation(raw));
    let processor = harness.processor(definition(FAILED_LOGINS));

    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();
    assert_eq!(events[0].event.source_streams, set(&["stream-2", "stream-3"]));
}

#[test]
fn configured_streams_when_result_has_none() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(single_bob(tr)));
    let processor = harness.processor(definition(FAILED_LOGINS));

    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();
    assert_eq!(events[0].event.source_streams, set(&["stream-1"]));
}

#[test]
fn all_streams_minus_defaults_when_nothing_configured() {
    let yaml = "id: any\ngroup_by: [username]\nseries: [{id: cnt, function: count}]\n";
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(single_bob(tr)));
    let processor = harness.processor(definition(yaml));

    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();
    assert_eq!(
        events[0].event.source_streams,
        set(&["stream-1", "stream-2", "stream-3"])
    );
}

// =============================================================================
// Conditions
// =============================================================================

#[test]
fn conditions_filter_key_results() {
    let yaml = r#"
id: busy
title: Busy users
group_by: [username]
series:
  - id: cnt
    function: count
  - id: errs
    function: sum
    field: errors
conditions: cnt > 23 and errs >= 1
"#;
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![
            leaf_row(
                &["bob"],
                vec![
                    cell("metric/count/-/cnt", json!(42)),
                    cell("metric/sum/errors/errs", json!(1)),
                ],
            ),
            leaf_row(
                &["alice"],
                vec![
                    cell("metric/count/-/cnt", json!(23)),
                    cell("metric/sum/errors/errs", json!(5)),
                ],
            ),
            // null sum never satisfies a comparison
            leaf_row(
                &["carol"],
                vec![
                    cell("metric/count/-/cnt", json!(99)),
                    cell("metric/sum/errors/errs", Value::Null),
                ],
            ),
        ],
    )));
    let processor = harness.processor(definition(yaml));

    let (events, report) = processor.run(&ProcessorParameters::new(tr)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.group_by_value("username"), Some("bob"));
    assert_eq!(report.key_results, 3);
    assert_eq!(report.key_results_skipped, 2);
}

#[test]
fn references_by_series_id() {
    let yaml = r#"
id: ids
group_by: [host]
series:
  - id: abc123
    function: max
    field: cpu
  - id: xyz789
    function: min
    field: cpu
conditions: abc123 > 40 and xyz789 < 2
"#;
    let tr = window(0, 60_000);
    let row = |host: &str, max: f64, min: f64| {
        leaf_row(
            &[host],
            vec![
                cell("metric/max/cpu/abc123", json!(max)),
                cell("metric/min/cpu/xyz789", json!(min)),
            ],
        )
    };
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![row("hot", 42.0, 1.0), row("cool", 23.0, 1.0)],
    )));
    let processor = harness.processor(definition(yaml));

    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.group_by_value("host"), Some("hot"));
    assert_eq!(
        events[0].event.field("aggregation_value_max_cpu"),
        Some(&FieldValue::Number(42.0))
    );
}

// =============================================================================
// Precondition, failures and state
// =============================================================================

#[test]
fn run_writes_state_once() {
    let tr = window(60_000, 120_000);
    let harness = Harness::new(FakeBackend::with_aggregation(single_bob(tr)));
    let processor = harness.processor(definition(FAILED_LOGINS));

    processor.run(&ProcessorParameters::new(tr)).unwrap();

    assert_eq!(harness.state.writes(), 1);
    let state = harness.state_for("failed-logins").unwrap();
    assert_eq!(state.last_processed_from, ms(60_000));
    assert_eq!(state.last_processed_to, ms(120_000));
}

#[test]
fn unindexed_window_is_a_clean_abort() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(single_bob(tr))).not_indexed();
    let processor = harness.processor(definition(FAILED_LOGINS));

    let mut consumed = 0;
    let err = processor
        .create_events(&ProcessorParameters::new(tr), |batch| {
            consumed += batch.len();
            Ok(())
        })
        .unwrap_err();

    assert!(err.is_precondition_failure(), "got {err}");
    assert!(err.to_string().contains("failed-logins/Failed logins"));
    assert_eq!(consumed, 0);
    assert_eq!(harness.backend.backend_calls(), 0);
    assert_eq!(harness.state.writes(), 0);
}

#[test]
fn backend_error_leaves_state_untouched() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::default());
    harness.backend.fail_aggregation("cluster unavailable");
    let processor = harness.processor(definition(FAILED_LOGINS));

    let err = processor.run(&ProcessorParameters::new(tr)).unwrap_err();
    assert!(matches!(err, EvalError::Backend(_)), "got {err}");
    assert!(!err.is_precondition_failure());
    assert_eq!(harness.state.writes(), 0);
}

#[test]
fn normalization_error_leaves_state_untouched() {
    let tr = window(0, 60_000);
    // two group values for a single group-by field
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![leaf_row(
            &["bob", "extra"],
            vec![cell("metric/count/-/cnt", json!(1))],
        )],
    )));
    let processor = harness.processor(definition(FAILED_LOGINS));

    let err = processor.run(&ProcessorParameters::new(tr)).unwrap_err();
    assert!(matches!(err, EvalError::Normalization(_)), "got {err}");
    assert_eq!(harness.state.writes(), 0);
}

#[test]
fn non_numeric_metric_is_a_normalization_error() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![leaf_row(&["bob"], vec![cell("metric/count/-/cnt", json!("many"))])],
    )));
    let processor = harness.processor(definition(FAILED_LOGINS));

    let err = processor.run(&ProcessorParameters::new(tr)).unwrap_err();
    assert!(matches!(err, EvalError::Normalization(_)), "got {err}");
}

#[test]
fn consumer_error_leaves_state_untouched() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(single_bob(tr)));
    let processor = harness.processor(definition(FAILED_LOGINS));

    let err = processor
        .create_events(&ProcessorParameters::new(tr), |_| {
            Err(EvalError::Consumer("queue full".into()))
        })
        .unwrap_err();
    assert!(matches!(err, EvalError::Consumer(_)));
    assert_eq!(harness.state.writes(), 0);
    assert!(harness.state_for("failed-logins").is_none());
}

#[test]
fn invalid_definition_is_rejected_up_front() {
    let mut def = definition(FAILED_LOGINS);
    def.group_by.push("username".into());
    let harness = Harness::new(FakeBackend::default());

    let err = corragg_eval::AggregationProcessor::new(
        def,
        corragg_eval::ProcessorConfig::default(),
        harness.collaborators(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, EvalError::InvalidDefinition(_)), "got {err}");
}

#[test]
fn rerunning_a_window_is_idempotent() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(response(
        tr,
        vec![
            leaf_row(&["bob"], vec![cell("metric/count/-/cnt", json!(4))]),
            leaf_row(&["eve"], vec![cell("metric/count/-/cnt", json!(9))]),
        ],
    )));
    let processor = harness.processor(definition(FAILED_LOGINS));
    let params = ProcessorParameters::new(tr);

    let (first, first_report) = processor.run(&params).unwrap();
    let first_state = harness.state_for("failed-logins");
    let (second, second_report) = processor.run(&params).unwrap();
    let second_state = harness.state_for("failed-logins");

    let first: Vec<_> = first.into_iter().map(|e| e.event).collect();
    let second: Vec<_> = second.into_iter().map(|e| e.event).collect();
    assert_eq!(without_ids(&first), without_ids(&second));
    assert_eq!(first_report, second_report);
    assert_eq!(first_state, second_state);
}

// =============================================================================
// Hooks
// =============================================================================

struct SeverityDecorator;

impl EventDecorator for SeverityDecorator {
    fn decorate(
        &self,
        event: &mut CorrelationEvent,
        definition: &AggregationDefinition,
        key_result: Option<&AggregationKeyResult>,
    ) {
        let key = key_result.map(|k| k.key.join(",")).unwrap_or_default();
        let label = format!("{}:{key}", definition.id);
        event.fields.insert("label".into(), FieldValue::Text(label));
    }
}

struct ThresholdModifier;

impl EventQueryModifier for ThresholdModifier {
    fn additional_queries(&self, definition: &AggregationDefinition) -> Vec<AdditionalQuery> {
        vec![AdditionalQuery {
            id: format!("{}-baseline", definition.id),
            query: json!({"type": "count"}),
        }]
    }

    fn event_modifier_data(
        &self,
        additional_results: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        additional_results
            .iter()
            .map(|(k, v)| (format!("baseline.{k}"), v.clone()))
            .collect()
    }
}

#[test]
fn decorator_and_query_modifier_shape_events() {
    let tr = window(0, 60_000);
    let mut raw = single_bob(tr);
    raw.additional_results
        .insert("failed-logins-baseline".into(), json!(17));
    raw.additional_results.insert("unrequested".into(), json!(1));
    let harness = Harness::new(FakeBackend::with_aggregation(raw));

    let mut processor = harness
        .processor(definition(FAILED_LOGINS))
        .with_decorator(Arc::new(SeverityDecorator));
    processor.add_query_modifier(Arc::new(ThresholdModifier));

    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();

    let requests = harness.backend.aggregation_requests.lock().unwrap();
    assert_eq!(requests[0].additional_queries.len(), 1);
    assert_eq!(requests[0].additional_queries[0].id, "failed-logins-baseline");

    assert_eq!(
        events[0].event.field("label"),
        Some(&FieldValue::Text("failed-logins:bob".into()))
    );
    let expected: BTreeMap<String, Value> =
        [("baseline.failed-logins-baseline".to_string(), json!(17))].into();
    assert_eq!(events[0].modifier_state, expected);
}

// =============================================================================
// Source records
// =============================================================================

#[test]
fn source_records_rescroll_with_group_values() {
    let tr = window(0, 60_000);
    let records = vec![
        vec![record("r1", 1_000, &["stream-1"]), record("r2", 2_000, &["stream-1"])],
        vec![record("r3", 3_000, &["stream-1"])],
    ];
    let backend = FakeBackend::with_batches(records);
    *backend.aggregation.lock().unwrap() = Some(single_bob(tr));
    let harness = Harness::new(backend);
    let processor = harness.processor(definition(FAILED_LOGINS));

    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();

    let mut seen = Vec::new();
    let delivered = processor
        .source_records_for_event(&events[0].event, 2, |batch| {
            seen.extend(batch.into_iter().map(|r| r.id));
            Ok(())
        })
        .unwrap();

    assert_eq!(delivered, 2);
    assert_eq!(seen, vec!["r1", "r2"]);
    let scrolls = harness.backend.scroll_requests.lock().unwrap();
    assert_eq!(
        scrolls[0].query,
        "(action:login AND outcome:failure) AND (username:\"bob\")"
    );
    assert_eq!(scrolls[0].batch_size, 2);
    assert_eq!(scrolls[0].timerange, tr);
    drop(scrolls);
    assert_eq!(harness.backend.open_cursors(), 0);
}

#[test]
fn source_records_with_zero_limit_touch_nothing() {
    let tr = window(0, 60_000);
    let harness = Harness::new(FakeBackend::with_aggregation(single_bob(tr)));
    let processor = harness.processor(definition(FAILED_LOGINS));
    let (events, _) = processor.run(&ProcessorParameters::new(tr)).unwrap();

    let delivered = processor
        .source_records_for_event(&events[0].event, 0, |_| Ok(()))
        .unwrap();
    assert_eq!(delivered, 0);
    assert_eq!(harness.backend.scroll_calls(), 0);
}
