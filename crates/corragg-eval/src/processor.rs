//! The aggregation processor: one scheduled run of one definition.
//!
//! A run moves through these phases:
//!
//! ```text
//! Idle → PreconditionCheck → Aborted
//!                          → Executing → Normalizing → Filtering → Emitting → StateUpdated
//! ```
//!
//! Definitions without group-by fields and series run in *filter-only* mode:
//! every matching record becomes one event. All others run a grouped pivot
//! aggregation and emit one event per group combination that passes the
//! definition's conditions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use corragg_parser::{AggregationDefinition, Series, ensure_valid};
use serde::Serialize;
use serde_json::Value;

use crate::backend::{
    AggregationRequest, CursorGuard, Record, ScrollControl, ScrollRequest, SearchBackend,
};
use crate::conditions::satisfies;
use crate::error::{EvalError, Result};
use crate::event::{
    CorrelationEvent, EventDecorator, EventFactory, EventQueryModifier, EventWithContext,
    FieldValue, ReplayInfo,
};
use crate::normalizer::normalize;
use crate::precondition::{IndexingProgress, PreconditionGate};
use crate::query::{concat_queries, group_by_query};
use crate::result::{AggregationKeyResult, AggregationResult};
use crate::state::{ProcessingStateStore, ProcessingStateTracker};
use crate::streams::{StreamService, default_excluded_stream_ids, resolve_source_streams};
use crate::window::{TimeRange, build_date_range_buckets};

// =============================================================================
// Configuration
// =============================================================================

/// Engine-wide tuning shared by all definitions.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Scroll batch size for filter-only runs when neither the parameters nor
    /// the definition set one.
    ///
    /// Default: 500.
    pub default_batch_size: usize,

    /// Streams never used for implicit source-stream attribution.
    ///
    /// Default: the two built-in event streams.
    pub excluded_stream_ids: BTreeSet<String>,

    /// Upper bound on the scroll batch size when replaying the records behind
    /// an aggregation event.
    ///
    /// Default: 500.
    pub max_source_records: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            default_batch_size: 500,
            excluded_stream_ids: default_excluded_stream_ids(),
            max_source_records: 500,
        }
    }
}

/// Inputs for a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorParameters {
    pub timerange: TimeRange,
    /// Non-empty overrides the definition's streams.
    pub streams: BTreeSet<String>,
    pub batch_size: Option<usize>,
}

impl ProcessorParameters {
    pub fn new(timerange: TimeRange) -> Self {
        ProcessorParameters {
            timerange,
            streams: BTreeSet::new(),
            batch_size: None,
        }
    }

    pub fn with_streams<I, S>(mut self, streams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.streams = streams.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// The external services a processor depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn SearchBackend>,
    pub progress: Arc<dyn IndexingProgress>,
    pub streams: Arc<dyn StreamService>,
    pub events: Arc<dyn EventFactory>,
    pub state: Arc<dyn ProcessingStateStore>,
}

// =============================================================================
// Run bookkeeping
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionMode {
    FilterOnly,
    Aggregation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    PreconditionCheck,
    Aborted,
    Executing,
    Normalizing,
    Filtering,
    Emitting,
    StateUpdated,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::PreconditionCheck => "precondition-check",
            RunPhase::Aborted => "aborted",
            RunPhase::Executing => "executing",
            RunPhase::Normalizing => "normalizing",
            RunPhase::Filtering => "filtering",
            RunPhase::Emitting => "emitting",
            RunPhase::StateUpdated => "state-updated",
        };
        write!(f, "{s}")
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub definition_id: String,
    pub mode: ExecutionMode,
    pub timerange: TimeRange,
    pub events_emitted: usize,
    /// Records scrolled in filter-only mode.
    pub records_scanned: usize,
    /// Key results returned by the aggregation.
    pub key_results: usize,
    /// Key results dropped by the conditions.
    pub key_results_skipped: usize,
    pub event_limit_reached: bool,
}

impl RunReport {
    fn new(definition_id: &str, mode: ExecutionMode, timerange: TimeRange) -> Self {
        RunReport {
            definition_id: definition_id.to_string(),
            mode,
            timerange,
            events_emitted: 0,
            records_scanned: 0,
            key_results: 0,
            key_results_skipped: 0,
            event_limit_reached: false,
        }
    }
}

// =============================================================================
// Processor
// =============================================================================

/// Runs one [`AggregationDefinition`] against a window.
pub struct AggregationProcessor {
    definition: AggregationDefinition,
    config: ProcessorConfig,
    backend: Arc<dyn SearchBackend>,
    streams: Arc<dyn StreamService>,
    events: Arc<dyn EventFactory>,
    gate: PreconditionGate,
    tracker: ProcessingStateTracker,
    decorator: Option<Arc<dyn EventDecorator>>,
    modifiers: Vec<Arc<dyn EventQueryModifier>>,
}

impl AggregationProcessor {
    /// Create a processor. Fails if the definition does not validate.
    pub fn new(
        definition: AggregationDefinition,
        config: ProcessorConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        ensure_valid(&definition)?;
        Ok(AggregationProcessor {
            definition,
            config,
            backend: collaborators.backend,
            streams: collaborators.streams,
            events: collaborators.events,
            gate: PreconditionGate::new(collaborators.progress),
            tracker: ProcessingStateTracker::new(collaborators.state),
            decorator: None,
            modifiers: Vec::new(),
        })
    }

    /// Install a hook that runs on every aggregation event.
    pub fn with_decorator(mut self, decorator: Arc<dyn EventDecorator>) -> Self {
        self.decorator = Some(decorator);
        self
    }

    pub fn add_query_modifier(&mut self, modifier: Arc<dyn EventQueryModifier>) {
        self.modifiers.push(modifier);
    }

    pub fn definition(&self) -> &AggregationDefinition {
        &self.definition
    }

    pub fn mode(&self) -> ExecutionMode {
        if self.definition.is_filter_only() {
            ExecutionMode::FilterOnly
        } else {
            ExecutionMode::Aggregation
        }
    }

    /// Run the definition for `params.timerange`, handing events to
    /// `consumer` batch by batch.
    ///
    /// The processing state is written once, after the last batch was
    /// accepted. Any error (including [`EvalError::PreconditionNotMet`])
    /// leaves it untouched.
    pub fn create_events<F>(&self, params: &ProcessorParameters, mut consumer: F) -> Result<RunReport>
    where
        F: FnMut(Vec<EventWithContext>) -> Result<()>,
    {
        self.enter(RunPhase::Idle);
        self.enter(RunPhase::PreconditionCheck);
        if let Err(e) = self.gate.check(&self.definition, &params.timerange) {
            self.enter(RunPhase::Aborted);
            return Err(e);
        }

        self.enter(RunPhase::Executing);
        let report = match self.mode() {
            ExecutionMode::FilterOnly => self.filter_search(params, &mut consumer)?,
            ExecutionMode::Aggregation => self.aggregated_search(params, &mut consumer)?,
        };

        self.tracker
            .record_window(&self.definition.id, &params.timerange)?;
        self.enter(RunPhase::StateUpdated);
        Ok(report)
    }

    /// [`create_events`](Self::create_events), collecting every event.
    pub fn run(&self, params: &ProcessorParameters) -> Result<(Vec<EventWithContext>, RunReport)> {
        let mut all = Vec::new();
        let report = self.create_events(params, |batch| {
            all.extend(batch);
            Ok(())
        })?;
        Ok((all, report))
    }

    /// Replay up to `limit` records behind `event`.
    ///
    /// Filter-only events resolve to their origin record. Aggregation events
    /// re-scroll the definition query narrowed to the event's group-by values
    /// over the event's replay range, which is the date-range bucket the group
    /// was reported under. Returns the number of records delivered.
    pub fn source_records_for_event<F>(
        &self,
        event: &CorrelationEvent,
        limit: usize,
        mut consumer: F,
    ) -> Result<usize>
    where
        F: FnMut(Vec<Record>) -> Result<()>,
    {
        if limit == 0 {
            return Ok(0);
        }

        if self.definition.series.is_empty() {
            let context = event.origin_context.as_deref().unwrap_or_default();
            let (index, id) = Record::parse_origin_context(context).ok_or_else(|| {
                EvalError::OriginContext(format!(
                    "event {} has no usable origin context '{context}'",
                    event.id
                ))
            })?;
            let record = self.backend.get_record(index, id).map_err(|e| {
                log::error!("Failed to load origin record {index}/{id}: {e}");
                e
            })?;
            consumer(vec![record])?;
            return Ok(1);
        }

        let pairs = event
            .group_by_fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()));
        let query = concat_queries(&self.definition.query, &group_by_query(pairs));
        log::debug!("Source record query for event {}: {query}", event.id);

        let request = ScrollRequest {
            definition_id: self.definition.id.clone(),
            query,
            filters: self.definition.filters.clone(),
            streams: self.definition.streams.clone(),
            timerange: match &event.replay_info {
                Some(replay) => TimeRange::new(replay.timerange_start, replay.timerange_end)?,
                None => TimeRange::new(event.timerange_start, event.timerange_end)?,
            },
            batch_size: limit.min(self.config.max_source_records).max(1),
        };

        let mut delivered = 0usize;
        let mut guard = self.open_scroll(&request)?;
        guard.for_each_batch(|mut records| {
            let remaining = limit - delivered;
            records.truncate(remaining);
            delivered += records.len();
            consumer(records)?;
            Ok::<_, EvalError>(if delivered >= limit {
                ScrollControl::Stop
            } else {
                ScrollControl::Continue
            })
        })?;
        Ok(delivered)
    }

    fn enter(&self, phase: RunPhase) {
        log::trace!("{}: {phase}", self.definition.id);
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Parameter streams override the definition's streams.
    fn configured_streams(&self, params: &ProcessorParameters) -> BTreeSet<String> {
        if params.streams.is_empty() {
            self.definition.streams.clone()
        } else {
            params.streams.clone()
        }
    }

    /// Configured streams that still exist, or every permitted stream when
    /// none are configured.
    fn search_streams(&self, configured: &BTreeSet<String>) -> BTreeSet<String> {
        if configured.is_empty() {
            return self.streams.permitted_stream_ids();
        }
        let existing = self.streams.existing_stream_ids(configured);
        let missing: Vec<&String> = configured.difference(&existing).collect();
        if !missing.is_empty() {
            log::warn!(
                "Removing non-existing streams <{missing:?}> from definition <{}>/<{}>",
                self.definition.id,
                self.definition.title
            );
        }
        existing
    }

    fn open_scroll(&self, request: &ScrollRequest) -> Result<CursorGuard> {
        let cursor = self.backend.open_scroll(request).map_err(|e| {
            log::error!(
                "Couldn't open scroll for <{}/{}>: {e}",
                self.definition.id,
                self.definition.title
            );
            e
        })?;
        Ok(CursorGuard::new(cursor))
    }

    // =========================================================================
    // Filter-only mode
    // =========================================================================

    fn filter_search<F>(&self, params: &ProcessorParameters, consumer: &mut F) -> Result<RunReport>
    where
        F: FnMut(Vec<EventWithContext>) -> Result<()>,
    {
        let def = &self.definition;
        let mut report = RunReport::new(&def.id, ExecutionMode::FilterOnly, params.timerange);

        let configured = self.configured_streams(params);
        let all_known = self.streams.all_stream_ids();
        let batch_size = params
            .batch_size
            .or(def.batch_size)
            .unwrap_or(self.config.default_batch_size)
            .max(1);

        let request = ScrollRequest {
            definition_id: def.id.clone(),
            query: def.query.clone(),
            filters: def.filters.clone(),
            streams: self.search_streams(&configured),
            timerange: params.timerange,
            batch_size,
        };

        let mut guard = self.open_scroll(&request)?;
        let scanned = guard.for_each_batch(|records| {
            let mut batch = Vec::with_capacity(records.len());
            let mut control = ScrollControl::Continue;

            for record in records {
                let source_streams = resolve_source_streams(
                    &record.stream_ids,
                    &configured,
                    &all_known,
                    &self.config.excluded_stream_ids,
                );
                let mut event = self.events.create_event(def, record.timestamp, &def.title);
                event.timerange_start = params.timerange.from;
                event.timerange_end = params.timerange.to;
                event.origin_context = Some(record.origin_context());
                event.replay_info = Some(ReplayInfo {
                    timerange_start: params.timerange.from,
                    timerange_end: params.timerange.to,
                    query: def.query.clone(),
                    streams: source_streams.clone(),
                    filters: def.filters.clone(),
                });
                event.source_streams = source_streams;
                if let Some(decorator) = &self.decorator {
                    decorator.decorate(&mut event, def, None);
                }

                batch.push(EventWithContext {
                    event,
                    record: Some(record),
                    modifier_state: BTreeMap::new(),
                });

                if def.event_limit != 0 && report.events_emitted + batch.len() >= def.event_limit {
                    control = ScrollControl::Stop;
                    break;
                }
            }

            report.events_emitted += batch.len();
            if !batch.is_empty() {
                consumer(batch)?;
            }
            if control == ScrollControl::Stop {
                report.event_limit_reached = true;
                log::debug!(
                    "Event limit reached at {} for '{}/{}'",
                    def.event_limit,
                    def.title,
                    def.id
                );
            }
            Ok::<_, EvalError>(control)
        })?;

        report.records_scanned = scanned;
        Ok(report)
    }

    // =========================================================================
    // Aggregation mode
    // =========================================================================

    fn aggregated_search<F>(&self, params: &ProcessorParameters, consumer: &mut F) -> Result<RunReport>
    where
        F: FnMut(Vec<EventWithContext>) -> Result<()>,
    {
        let def = &self.definition;
        let mut report = RunReport::new(&def.id, ExecutionMode::Aggregation, params.timerange);

        let configured = self.configured_streams(params);
        let request = self.build_aggregation_request(params, self.search_streams(&configured));

        let raw = self.backend.run_aggregation(&request).map_err(|e| {
            log::error!(
                "Couldn't run aggregation <{}/{}> because of search error: {e}",
                def.id,
                def.title
            );
            EvalError::from(e)
        })?;

        self.enter(RunPhase::Normalizing);
        let result = normalize(def, &request, raw)?;
        report.key_results = result.key_results.len();

        if result.key_results.is_empty() {
            log::debug!("Aggregated search returned empty result set.");
            return Ok(report);
        }
        log::debug!(
            "Got {} (total-aggregated-messages={}) results.",
            result.key_results.len(),
            result.total_aggregated_messages
        );

        self.enter(RunPhase::Filtering);
        let events = self.events_from_result(
            params,
            &request.time_buckets,
            &configured,
            &result,
            &mut report,
        )?;

        self.enter(RunPhase::Emitting);
        report.events_emitted = events.len();
        if !events.is_empty() {
            consumer(events)?;
        }
        Ok(report)
    }

    fn build_aggregation_request(
        &self,
        params: &ProcessorParameters,
        streams: BTreeSet<String>,
    ) -> AggregationRequest {
        let def = &self.definition;
        AggregationRequest {
            definition_id: def.id.clone(),
            query: def.query.clone(),
            filters: def.filters.clone(),
            streams,
            timerange: params.timerange,
            group_by: def.group_by.clone(),
            series: def.series.clone(),
            time_buckets: build_date_range_buckets(
                &params.timerange,
                def.search_within_ms,
                def.execute_every_ms,
            ),
            additional_queries: self
                .modifiers
                .iter()
                .flat_map(|m| m.additional_queries(def))
                .collect(),
        }
    }

    fn events_from_result(
        &self,
        params: &ProcessorParameters,
        buckets: &[TimeRange],
        configured: &BTreeSet<String>,
        result: &AggregationResult,
        report: &mut RunReport,
    ) -> Result<Vec<EventWithContext>> {
        let def = &self.definition;
        let all_known = self.streams.all_stream_ids();
        let modifier_state: BTreeMap<String, Value> = self
            .modifiers
            .iter()
            .flat_map(|m| m.event_modifier_data(&result.additional_results))
            .collect();

        let mut events = Vec::new();
        for key_result in &result.key_results {
            if let Some(conditions) = &def.conditions
                && !satisfies(conditions, &key_result.values_by_series_id())
            {
                log::debug!(
                    "Skipping result <{:?}> because the conditions <{conditions}> don't match",
                    key_result.key
                );
                report.key_results_skipped += 1;
                continue;
            }

            let result_streams = if key_result.source_streams.is_empty() {
                &result.source_streams
            } else {
                &key_result.source_streams
            };
            let source_streams = resolve_source_streams(
                result_streams,
                configured,
                &all_known,
                &self.config.excluded_stream_ids,
            );

            let event = self.aggregation_event(params, buckets, key_result, source_streams)?;
            events.push(EventWithContext {
                event,
                record: None,
                modifier_state: modifier_state.clone(),
            });
        }
        Ok(events)
    }

    fn aggregation_event(
        &self,
        params: &ProcessorParameters,
        buckets: &[TimeRange],
        key_result: &AggregationKeyResult,
        source_streams: BTreeSet<String>,
    ) -> Result<CorrelationEvent> {
        let def = &self.definition;
        if key_result.key.len() != def.group_by.len() {
            return Err(EvalError::GroupKeyMismatch {
                definition_id: def.id.clone(),
                group_by: def.group_by.clone(),
                key: key_result.key.clone(),
            });
        }

        let key_string = key_result.key.join("|");
        let message = self.event_message(&key_string, key_result);
        let window = params.timerange;

        let mut event = self.events.create_event(def, window.to, &message);
        event.timerange_start = window.from;
        event.timerange_end = window.to;
        event.group_by_fields = def
            .group_by
            .iter()
            .cloned()
            .zip(key_result.key.iter().cloned())
            .collect();

        for value in &key_result.series_values {
            event
                .fields
                .insert(aggregation_field_name(&value.series), FieldValue::Number(value.value));
        }
        event
            .fields
            .insert("aggregation_key".to_string(), FieldValue::Text(key_string));

        let pairs = event
            .group_by_fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()));
        let replay_range = bucket_for(buckets, key_result).unwrap_or(window);
        event.replay_info = Some(ReplayInfo {
            timerange_start: replay_range.from,
            timerange_end: replay_range.to,
            query: concat_queries(&def.query, &group_by_query(pairs)),
            streams: source_streams.clone(),
            filters: def.filters.clone(),
        });
        event.source_streams = source_streams;

        if let Some(decorator) = &self.decorator {
            decorator.decorate(&mut event, def, Some(key_result));
        }

        log::debug!(
            "Creating event {}/{} - {:?} {}",
            def.title,
            def.id,
            key_result.key,
            series_string(key_result)
        );
        Ok(event)
    }

    /// `"<title>: <key> - <series>=<value> ..."`; the key part is omitted when ungrouped.
    fn event_message(&self, key_string: &str, key_result: &AggregationKeyResult) -> String {
        let mut message = format!("{}: ", self.definition.title);
        if !key_result.key.is_empty() {
            message.push_str(key_string);
            message.push_str(" - ");
        }
        message.push_str(&series_string(key_result));
        message.trim().to_string()
    }
}

/// The request bucket a key result was reported under, matched on the bucket end.
fn bucket_for(buckets: &[TimeRange], key_result: &AggregationKeyResult) -> Option<TimeRange> {
    let timestamp = key_result.timestamp?;
    buckets.iter().find(|b| b.to == timestamp).copied()
}

/// `aggregation_value_<function>` or `aggregation_value_<function>_<field>`.
pub fn aggregation_field_name(series: &Series) -> String {
    match &series.field {
        Some(field) => format!("aggregation_value_{}_{field}", series.function),
        None => format!("aggregation_value_{}", series.function),
    }
}

fn series_string(key_result: &AggregationKeyResult) -> String {
    key_result
        .series_values
        .iter()
        .map(|v| format!("{}={:?}", v.series.literal(), v.value))
        .collect::<Vec<_>>()
        .join(" ")
}
