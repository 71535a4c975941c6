use thiserror::Error;

use crate::validate::ValidationIssue;

/// Errors that can occur while loading or validating aggregation definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Condition parse error: {0}")]
    Condition(String),

    #[error("Unknown aggregation function '{0}'")]
    UnknownFunction(String),

    #[error("Invalid series: {0}")]
    InvalidSeries(String),

    #[error("Invalid timespan '{0}'")]
    InvalidTimespan(String),

    #[error("Missing required field '{0}'")]
    MissingField(String),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Definition '{id}' failed validation: {}", format_issues(.issues))]
    Validation {
        id: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, DefinitionError>;
