//! Per-definition record of the last processed window.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Result};
use crate::window::TimeRange;

/// The last window a definition completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub definition_id: String,
    pub last_processed_from: DateTime<Utc>,
    pub last_processed_to: DateTime<Utc>,
}

/// Storage for [`ProcessingState`], keyed by definition id.
pub trait ProcessingStateStore: Send + Sync {
    fn set_state(&self, state: ProcessingState) -> Result<()>;

    fn get_state(&self, definition_id: &str) -> Result<Option<ProcessingState>>;

    /// Returns whether a state was removed.
    fn delete_state(&self, definition_id: &str) -> Result<bool>;
}

/// In-memory [`ProcessingStateStore`].
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, ProcessingState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> EvalError {
    EvalError::State("state store lock poisoned".into())
}

impl ProcessingStateStore for MemoryStateStore {
    fn set_state(&self, state: ProcessingState) -> Result<()> {
        self.states
            .write()
            .map_err(poisoned)?
            .insert(state.definition_id.clone(), state);
        Ok(())
    }

    fn get_state(&self, definition_id: &str) -> Result<Option<ProcessingState>> {
        Ok(self.states.read().map_err(poisoned)?.get(definition_id).cloned())
    }

    fn delete_state(&self, definition_id: &str) -> Result<bool> {
        Ok(self
            .states
            .write()
            .map_err(poisoned)?
            .remove(definition_id)
            .is_some())
    }
}

/// Writes the processed window once a run has handed off all its events.
#[derive(Clone)]
pub struct ProcessingStateTracker {
    store: Arc<dyn ProcessingStateStore>,
}

impl ProcessingStateTracker {
    pub fn new(store: Arc<dyn ProcessingStateStore>) -> Self {
        ProcessingStateTracker { store }
    }

    pub fn record_window(&self, definition_id: &str, window: &TimeRange) -> Result<()> {
        self.store.set_state(ProcessingState {
            definition_id: definition_id.to_string(),
            last_processed_from: window.from,
            last_processed_to: window.to,
        })
    }

    pub fn last_window(&self, definition_id: &str) -> Result<Option<TimeRange>> {
        Ok(self.store.get_state(definition_id)?.map(|s| TimeRange {
            from: s.last_processed_from,
            to: s.last_processed_to,
        }))
    }
}
