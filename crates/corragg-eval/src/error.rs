//! Evaluation-specific error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::backend::BackendError;

/// Errors that can occur while running an aggregation definition.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The data store has not ingested the whole window yet. Not a failure:
    /// the scheduler should retry the same window later.
    #[error(
        "Couldn't run aggregation <{definition_id}/{title}> for timerange <{from} to {to}> because required records haven't been indexed yet"
    )]
    PreconditionNotMet {
        definition_id: String,
        title: String,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    /// The search backend failed.
    #[error("search backend error: {0}")]
    Backend(#[from] BackendError),

    /// The backend response did not have the expected pivot shape.
    #[error("normalization error: {0}")]
    Normalization(String),

    /// A key result's tuple does not line up with the definition's group-by fields.
    #[error(
        "group-by mismatch for definition '{definition_id}': {} fields {group_by:?} but key {key:?}",
        group_by.len()
    )]
    GroupKeyMismatch {
        definition_id: String,
        group_by: Vec<String>,
        key: Vec<String>,
    },

    /// A condition referenced a series that has no value.
    #[error("unknown series reference: {0}")]
    UnknownReference(String),

    /// A condition node was used where a boolean or a number was expected.
    #[error("condition type error: {0}")]
    ConditionType(String),

    /// The definition failed validation.
    #[error("invalid definition: {0}")]
    InvalidDefinition(#[from] corragg_parser::DefinitionError),

    /// An invalid time range (e.g. `from` after `to`).
    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),

    /// An event's origin context does not name a record.
    #[error("invalid origin context: {0}")]
    OriginContext(String),

    /// The event consumer rejected a batch.
    #[error("event consumer error: {0}")]
    Consumer(String),

    /// The processing state store failed.
    #[error("state store error: {0}")]
    State(String),
}

impl EvalError {
    /// `true` for the clean "window not indexed yet" signal, `false` for real failures.
    pub fn is_precondition_failure(&self) -> bool {
        matches!(self, EvalError::PreconditionNotMet { .. })
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, EvalError>;
