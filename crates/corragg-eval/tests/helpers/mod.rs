#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use corragg_eval::{
    AggregationProcessor, AggregationRequest, BackendError, Collaborators, DefaultEventFactory,
    IndexingProgress, MemoryStateStore, MemoryStreamService, PivotRow, PivotValue,
    ProcessingState, ProcessingStateStore, ProcessorConfig, RawAggregationResponse, Record,
    ScrollCursor, ScrollRequest, SearchBackend, TimeRange,
};
use corragg_parser::{AggregationDefinition, parse_definitions_yaml};
use serde_json::{Value, json};

pub fn ms(v: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(v).unwrap()
}

pub fn window(from_ms: i64, to_ms: i64) -> TimeRange {
    TimeRange::from_millis(from_ms, to_ms).unwrap()
}

pub fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

pub fn definition(yaml: &str) -> AggregationDefinition {
    let mut collection = parse_definitions_yaml(yaml).unwrap();
    assert!(collection.errors.is_empty(), "{:?}", collection.errors);
    collection.definitions.remove(0)
}

// =============================================================================
// Pivot response builders
// =============================================================================

pub fn cell(metric: &str, value: Value) -> PivotValue {
    PivotValue {
        key: vec![metric.to_string()],
        value: Some(value),
        rollup: true,
        source: "row-leaf".to_string(),
    }
}

/// Bucket key used by [`leaf_row`].
pub const BUCKET: &str = "2024-01-01T00:00:00Z";

/// A leaf row for the group `key`, in the single [`BUCKET`].
pub fn leaf_row(key: &[&str], values: Vec<PivotValue>) -> PivotRow {
    bucket_row(BUCKET, key, values)
}

/// A leaf row for the group `key` under the date-range bucket keyed `bucket`.
pub fn bucket_row(bucket: &str, key: &[&str], values: Vec<PivotValue>) -> PivotRow {
    let mut full_key = vec![bucket.to_string()];
    full_key.extend(key.iter().map(|s| s.to_string()));
    PivotRow {
        key: full_key,
        values,
        source: "leaf".to_string(),
        source_streams: BTreeSet::new(),
    }
}

pub fn non_leaf_row(key: &[&str]) -> PivotRow {
    PivotRow {
        key: std::iter::once(BUCKET)
            .chain(key.iter().copied())
            .map(str::to_string)
            .collect(),
        values: vec![cell("metric/count/-/cnt", json!(1000))],
        source: "non-leaf".to_string(),
        source_streams: BTreeSet::new(),
    }
}

pub fn stream_row(stream: &str) -> PivotRow {
    PivotRow {
        key: vec![stream.to_string()],
        values: Vec::new(),
        source: "leaf".to_string(),
        source_streams: BTreeSet::new(),
    }
}

pub fn response(tr: TimeRange, rows: Vec<PivotRow>) -> RawAggregationResponse {
    RawAggregationResponse {
        effective_timerange: tr,
        total: rows.len() as i64,
        rows,
        stream_rows: Vec::new(),
        additional_results: BTreeMap::new(),
    }
}

pub fn record(id: &str, ts_ms: i64, streams: &[&str]) -> Record {
    let mut fields = serde_json::Map::new();
    fields.insert("message".into(), json!(format!("record {id}")));
    Record {
        id: id.to_string(),
        index: "records_0".to_string(),
        timestamp: ms(ts_ms),
        stream_ids: set(streams),
        fields,
    }
}

// =============================================================================
// Fake backend
// =============================================================================

#[derive(Default)]
pub struct FakeBackend {
    pub aggregation: Mutex<Option<RawAggregationResponse>>,
    pub aggregation_error: Mutex<Option<String>>,
    pub batches: Mutex<Vec<Vec<Record>>>,
    /// Fail the scroll after this many batches were served.
    pub scroll_fail_after: Mutex<Option<usize>>,
    pub records: Mutex<HashMap<(String, String), Record>>,

    pub aggregation_requests: Mutex<Vec<AggregationRequest>>,
    pub scroll_requests: Mutex<Vec<ScrollRequest>>,
    pub cursors_opened: Arc<AtomicUsize>,
    pub cursors_closed: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn with_aggregation(response: RawAggregationResponse) -> Self {
        let backend = FakeBackend::default();
        *backend.aggregation.lock().unwrap() = Some(response);
        backend
    }

    pub fn with_batches(batches: Vec<Vec<Record>>) -> Self {
        let backend = FakeBackend::default();
        for record in batches.iter().flatten() {
            backend
                .records
                .lock()
                .unwrap()
                .insert((record.index.clone(), record.id.clone()), record.clone());
        }
        *backend.batches.lock().unwrap() = batches;
        backend
    }

    pub fn fail_aggregation(&self, message: &str) {
        *self.aggregation_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_scroll_after(&self, batches: usize) {
        *self.scroll_fail_after.lock().unwrap() = Some(batches);
    }

    pub fn aggregation_calls(&self) -> usize {
        self.aggregation_requests.lock().unwrap().len()
    }

    pub fn scroll_calls(&self) -> usize {
        self.scroll_requests.lock().unwrap().len()
    }

    pub fn backend_calls(&self) -> usize {
        self.aggregation_calls() + self.scroll_calls()
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors_opened.load(Ordering::SeqCst) - self.cursors_closed.load(Ordering::SeqCst)
    }
}

struct FakeCursor {
    batches: VecDeque<Vec<Record>>,
    served: usize,
    fail_after: Option<usize>,
    closed: Arc<AtomicUsize>,
}

impl ScrollCursor for FakeCursor {
    fn next_batch(&mut self) -> Result<Option<Vec<Record>>, BackendError> {
        if self.fail_after == Some(self.served) {
            return Err(BackendError::Scroll("scroll context lost".into()));
        }
        self.served += 1;
        Ok(self.batches.pop_front())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl SearchBackend for FakeBackend {
    fn run_aggregation(
        &self,
        request: &AggregationRequest,
    ) -> Result<RawAggregationResponse, BackendError> {
        self.aggregation_requests.lock().unwrap().push(request.clone());
        if let Some(message) = self.aggregation_error.lock().unwrap().clone() {
            return Err(BackendError::Query(message));
        }
        Ok(self
            .aggregation
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| response(request.timerange, Vec::new())))
    }

    fn open_scroll(&self, request: &ScrollRequest) -> Result<Box<dyn ScrollCursor>, BackendError> {
        self.scroll_requests.lock().unwrap().push(request.clone());
        self.cursors_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCursor {
            batches: self.batches.lock().unwrap().clone().into(),
            served: 0,
            fail_after: *self.scroll_fail_after.lock().unwrap(),
            closed: self.cursors_closed.clone(),
        }))
    }

    fn get_record(&self, index: &str, id: &str) -> Result<Record, BackendError> {
        self.records
            .lock()
            .unwrap()
            .get(&(index.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::RecordNotFound {
                index: index.to_string(),
                id: id.to_string(),
            })
    }
}

// =============================================================================
// Other collaborators
// =============================================================================

pub struct StaticProgress(pub bool);

impl IndexingProgress for StaticProgress {
    fn has_indexed_up_to(&self, _instant: DateTime<Utc>) -> bool {
        self.0
    }
}

/// Counts writes so tests can assert "exactly once" / "never".
#[derive(Default)]
pub struct CountingStateStore {
    pub inner: MemoryStateStore,
    pub writes: AtomicUsize,
}

impl CountingStateStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl ProcessingStateStore for CountingStateStore {
    fn set_state(&self, state: ProcessingState) -> corragg_eval::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set_state(state)
    }

    fn get_state(&self, definition_id: &str) -> corragg_eval::Result<Option<ProcessingState>> {
        self.inner.get_state(definition_id)
    }

    fn delete_state(&self, definition_id: &str) -> corragg_eval::Result<bool> {
        self.inner.delete_state(definition_id)
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub streams: Arc<MemoryStreamService>,
    pub state: Arc<CountingStateStore>,
    pub indexed: bool,
}

impl Harness {
    pub fn new(backend: FakeBackend) -> Self {
        Harness {
            backend: Arc::new(backend),
            streams: Arc::new(MemoryStreamService::with_streams([
                "stream-1",
                "stream-2",
                "stream-3",
                "000000000000000000000002",
                "000000000000000000000003",
            ])),
            state: Arc::new(CountingStateStore::default()),
            indexed: true,
        }
    }

    pub fn not_indexed(mut self) -> Self {
        self.indexed = false;
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            backend: self.backend.clone(),
            progress: Arc::new(StaticProgress(self.indexed)),
            streams: self.streams.clone(),
            events: Arc::new(DefaultEventFactory),
            state: self.state.clone(),
        }
    }

    pub fn processor(&self, definition: AggregationDefinition) -> AggregationProcessor {
        AggregationProcessor::new(definition, ProcessorConfig::default(), self.collaborators())
            .unwrap()
    }

    pub fn state_for(&self, definition_id: &str) -> Option<ProcessingState> {
        self.state.get_state(definition_id).unwrap()
    }
}
