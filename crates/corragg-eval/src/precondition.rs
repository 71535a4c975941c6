//! Indexing-completeness check run before any backend access.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use corragg_parser::AggregationDefinition;

use crate::error::{EvalError, Result};
use crate::window::TimeRange;

/// Reports whether ingestion has caught up to an instant.
pub trait IndexingProgress: Send + Sync {
    fn has_indexed_up_to(&self, instant: DateTime<Utc>) -> bool;
}

/// Refuses to run a window the data store has not fully ingested.
#[derive(Clone)]
pub struct PreconditionGate {
    progress: Arc<dyn IndexingProgress>,
}

impl PreconditionGate {
    pub fn new(progress: Arc<dyn IndexingProgress>) -> Self {
        PreconditionGate { progress }
    }

    pub fn is_window_fully_indexed(&self, to: DateTime<Utc>) -> bool {
        self.progress.has_indexed_up_to(to)
    }

    pub fn check(&self, definition: &AggregationDefinition, window: &TimeRange) -> Result<()> {
        if self.is_window_fully_indexed(window.to) {
            return Ok(());
        }
        log::debug!(
            "Window {window} of '{}/{}' not fully indexed yet",
            definition.title,
            definition.id
        );
        Err(EvalError::PreconditionNotMet {
            definition_id: definition.id.clone(),
            title: definition.title.clone(),
            from: window.from,
            to: window.to,
        })
    }
}

const NOTHING_INDEXED: i64 = i64::MIN;

/// Thread-safe high-water mark of ingestion progress.
#[derive(Debug)]
pub struct ProcessingStatusRecorder {
    indexed_up_to_ms: AtomicI64,
}

impl ProcessingStatusRecorder {
    pub fn new() -> Self {
        ProcessingStatusRecorder {
            indexed_up_to_ms: AtomicI64::new(NOTHING_INDEXED),
        }
    }

    /// Move the mark forward; earlier instants are ignored.
    pub fn advance_to(&self, instant: DateTime<Utc>) {
        self.indexed_up_to_ms
            .fetch_max(instant.timestamp_millis(), Ordering::AcqRel);
    }

    pub fn indexed_up_to(&self) -> Option<DateTime<Utc>> {
        match self.indexed_up_to_ms.load(Ordering::Acquire) {
            NOTHING_INDEXED => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

impl Default for ProcessingStatusRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexingProgress for ProcessingStatusRecorder {
    fn has_indexed_up_to(&self, instant: DateTime<Utc>) -> bool {
        self.indexed_up_to_ms.load(Ordering::Acquire) >= instant.timestamp_millis()
    }
}
