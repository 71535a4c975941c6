//! # corragg-eval
//!
//! Runs scheduled aggregation definitions parsed by [`corragg_parser`] and
//! turns matching group combinations into correlation events.
//!
//! ## Architecture
//!
//! - **Precondition gate**: a window only runs once ingestion has caught up to
//!   its end; otherwise the run stops cleanly with
//!   [`EvalError::PreconditionNotMet`] and nothing is written.
//! - **Filter-only mode**: no group-by and no series; every scrolled record
//!   becomes an event stamped with the record's own timestamp.
//! - **Aggregation mode**: a grouped pivot aggregation, normalized into key
//!   results, filtered by the definition's conditions, one event per key.
//! - **Source streams**: result streams, else configured streams, else every
//!   known stream minus the built-in event streams.
//! - **Collaborators**: the search backend, indexing progress, stream service,
//!   event factory and state store are injected `Send + Sync` trait objects;
//!   in-memory implementations are provided for the last four.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use corragg_parser::parse_definitions_yaml;
//! use corragg_eval::{
//!     AggregationProcessor, AggregationRequest, BackendError, Collaborators, DefaultEventFactory,
//!     ExecutionMode, MemoryStateStore, MemoryStreamService, ProcessingStatusRecorder,
//!     ProcessorConfig, ProcessorParameters, RawAggregationResponse, Record, ScrollCursor,
//!     ScrollRequest, SearchBackend, TimeRange,
//! };
//!
//! struct NoRecords;
//!
//! struct Empty;
//! impl ScrollCursor for Empty {
//!     fn next_batch(&mut self) -> Result<Option<Vec<Record>>, BackendError> { Ok(None) }
//!     fn close(&mut self) -> Result<(), BackendError> { Ok(()) }
//! }
//!
//! impl SearchBackend for NoRecords {
//!     fn run_aggregation(&self, req: &AggregationRequest) -> Result<RawAggregationResponse, BackendError> {
//!         Ok(RawAggregationResponse {
//!             effective_timerange: req.timerange,
//!             total: 0,
//!             rows: vec![],
//!             stream_rows: vec![],
//!             additional_results: Default::default(),
//!         })
//!     }
//!     fn open_scroll(&self, _: &ScrollRequest) -> Result<Box<dyn ScrollCursor>, BackendError> {
//!         Ok(Box::new(Empty))
//!     }
//!     fn get_record(&self, index: &str, id: &str) -> Result<Record, BackendError> {
//!         Err(BackendError::RecordNotFound { index: index.into(), id: id.into() })
//!     }
//! }
//!
//! let yaml = "id: errors\ntitle: Errors\nquery: level:error\n";
//! let definition = parse_definitions_yaml(yaml).unwrap().definitions.remove(0);
//!
//! let progress = Arc::new(ProcessingStatusRecorder::new());
//! let window = TimeRange::from_millis(0, 60_000).unwrap();
//! progress.advance_to(window.to);
//!
//! let processor = AggregationProcessor::new(
//!     definition,
//!     ProcessorConfig::default(),
//!     Collaborators {
//!         backend: Arc::new(NoRecords),
//!         progress,
//!         streams: Arc::new(MemoryStreamService::with_streams(["s1"])),
//!         events: Arc::new(DefaultEventFactory),
//!         state: Arc::new(MemoryStateStore::new()),
//!     },
//! )
//! .unwrap();
//!
//! let (events, report) = processor.run(&ProcessorParameters::new(window)).unwrap();
//! assert!(events.is_empty());
//! assert_eq!(report.mode, ExecutionMode::FilterOnly);
//! ```

pub mod backend;
pub mod conditions;
pub mod error;
pub mod event;
pub mod normalizer;
pub mod precondition;
pub mod processor;
pub mod query;
pub mod result;
pub mod state;
pub mod streams;
pub mod window;

pub use backend::{
    AdditionalQuery, AggregationRequest, BackendError, CursorGuard, MetricKey, PivotRow,
    PivotValue, RawAggregationResponse, Record, ScrollControl, ScrollCursor, ScrollRequest,
    SearchBackend,
};
pub use conditions::{evaluate, satisfies};
pub use error::{EvalError, Result};
pub use event::{
    CorrelationEvent, DefaultEventFactory, EventDecorator, EventFactory, EventQueryModifier,
    EventWithContext, FieldValue, ReplayInfo,
};
pub use normalizer::normalize;
pub use precondition::{IndexingProgress, PreconditionGate, ProcessingStatusRecorder};
pub use processor::{
    AggregationProcessor, Collaborators, ExecutionMode, ProcessorConfig, ProcessorParameters,
    RunPhase, RunReport, aggregation_field_name,
};
pub use result::{AggregationKeyResult, AggregationResult, AggregationSeriesValue};
pub use state::{MemoryStateStore, ProcessingState, ProcessingStateStore, ProcessingStateTracker};
pub use streams::{
    DEFAULT_EXCLUDED_STREAM_IDS, MemoryStreamService, StreamService, resolve_source_streams,
};
pub use window::{TimeRange, build_date_range_buckets};
