//! Structural validation of aggregation definitions.
//!
//! The parser accepts anything that has the right shape; [`validate`] checks
//! the semantic constraints a definition must meet before it can be scheduled.
//!
//! ```rust
//! use corragg_parser::{AggregationDefinition, validate::validate};
//!
//! let mut def = AggregationDefinition::new("d1", "Failed logins", "action:login_failed");
//! def.group_by.push("username".into());
//! let issues = validate(&def);
//! assert_eq!(issues.len(), 1); // group-by without series
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::ast::AggregationDefinition;
use crate::error::{DefinitionError, Result};

// =============================================================================
// Public types
// =============================================================================

/// Identifies which validation rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValidationRule {
    EmptyId,
    NonPositiveWindow,
    NonPositiveInterval,
    NonPositiveBatchSize,
    EmptySeriesId,
    DuplicateSeriesId,
    MissingSeriesField,
    InvalidPercentile,
    GroupByWithoutSeries,
    ConditionsWithoutSeries,
    UnknownSeriesReference,
    EmptyGroupByField,
    DuplicateGroupByField,
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationRule::EmptyId => "empty_id",
            ValidationRule::NonPositiveWindow => "non_positive_window",
            ValidationRule::NonPositiveInterval => "non_positive_interval",
            ValidationRule::NonPositiveBatchSize => "non_positive_batch_size",
            ValidationRule::EmptySeriesId => "empty_series_id",
            ValidationRule::DuplicateSeriesId => "duplicate_series_id",
            ValidationRule::MissingSeriesField => "missing_series_field",
            ValidationRule::InvalidPercentile => "invalid_percentile",
            ValidationRule::GroupByWithoutSeries => "group_by_without_series",
            ValidationRule::ConditionsWithoutSeries => "conditions_without_series",
            ValidationRule::UnknownSeriesReference => "unknown_series_reference",
            ValidationRule::EmptyGroupByField => "empty_group_by_field",
            ValidationRule::DuplicateGroupByField => "duplicate_group_by_field",
        };
        write!(f, "{s}")
    }
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub rule: ValidationRule,
    /// Location inside the definition, e.g. `"/series/1/field"`.
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(rule: ValidationRule, path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            rule,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.rule, self.path, self.message)
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Check a definition and return every issue found (empty = valid).
pub fn validate(def: &AggregationDefinition) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if def.id.trim().is_empty() {
        issues.push(ValidationIssue::new(
            ValidationRule::EmptyId,
            "/id",
            "definition id must not be empty",
        ));
    }
    if def.search_within_ms == 0 {
        issues.push(ValidationIssue::new(
            ValidationRule::NonPositiveWindow,
            "/search_within",
            "search window must be greater than 0",
        ));
    }
    if def.execute_every_ms == 0 {
        issues.push(ValidationIssue::new(
            ValidationRule::NonPositiveInterval,
            "/execute_every",
            "execution interval must be greater than 0",
        ));
    }
    if def.batch_size == Some(0) {
        issues.push(ValidationIssue::new(
            ValidationRule::NonPositiveBatchSize,
            "/batch_size",
            "batch size must be greater than 0",
        ));
    }

    validate_series(def, &mut issues);
    validate_group_by(def, &mut issues);
    validate_conditions(def, &mut issues);

    issues
}

/// Like [`validate`], but returns an error carrying every issue.
pub fn ensure_valid(def: &AggregationDefinition) -> Result<()> {
    let issues = validate(def);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(DefinitionError::Validation {
            id: def.id.clone(),
            issues,
        })
    }
}

fn validate_series(def: &AggregationDefinition, issues: &mut Vec<ValidationIssue>) {
    let mut seen = HashSet::new();
    for (i, series) in def.series.iter().enumerate() {
        if series.id.trim().is_empty() {
            issues.push(ValidationIssue::new(
                ValidationRule::EmptySeriesId,
                format!("/series/{i}/id"),
                "series id must not be empty",
            ));
        } else if !seen.insert(series.id.as_str()) {
            issues.push(ValidationIssue::new(
                ValidationRule::DuplicateSeriesId,
                format!("/series/{i}/id"),
                format!("series id '{}' is used more than once", series.id),
            ));
        }

        let has_field = series.field.as_deref().is_some_and(|f| !f.trim().is_empty());
        if series.function.requires_field() && !has_field {
            issues.push(ValidationIssue::new(
                ValidationRule::MissingSeriesField,
                format!("/series/{i}/field"),
                format!("function '{}' requires a field", series.function),
            ));
        }

        if series.function == crate::ast::AggregationFunction::Percentile {
            match series.percentile {
                Some(p) if p > 0.0 && p <= 100.0 => {}
                Some(p) => issues.push(ValidationIssue::new(
                    ValidationRule::InvalidPercentile,
                    format!("/series/{i}/percentile"),
                    format!("percentile {p} is outside (0, 100]"),
                )),
                None => issues.push(ValidationIssue::new(
                    ValidationRule::InvalidPercentile,
                    format!("/series/{i}/percentile"),
                    "percentile series needs a percentile value",
                )),
            }
        }
    }
}

fn validate_group_by(def: &AggregationDefinition, issues: &mut Vec<ValidationIssue>) {
    if !def.group_by.is_empty() && def.series.is_empty() {
        issues.push(ValidationIssue::new(
            ValidationRule::GroupByWithoutSeries,
            "/group_by",
            "group-by fields require at least one series",
        ));
    }

    let mut seen = HashSet::new();
    for (i, field) in def.group_by.iter().enumerate() {
        if field.trim().is_empty() {
            issues.push(ValidationIssue::new(
                ValidationRule::EmptyGroupByField,
                format!("/group_by/{i}"),
                "group-by field must not be empty",
            ));
        } else if !seen.insert(field.as_str()) {
            issues.push(ValidationIssue::new(
                ValidationRule::DuplicateGroupByField,
                format!("/group_by/{i}"),
                format!("group-by field '{field}' is listed more than once"),
            ));
        }
    }
}

fn validate_conditions(def: &AggregationDefinition, issues: &mut Vec<ValidationIssue>) {
    let Some(conditions) = &def.conditions else {
        return;
    };

    if def.series.is_empty() {
        issues.push(ValidationIssue::new(
            ValidationRule::ConditionsWithoutSeries,
            "/conditions",
            "conditions require at least one series",
        ));
        return;
    }

    for reference in conditions.references() {
        if def.series_by_id(reference).is_none() {
            issues.push(ValidationIssue::new(
                ValidationRule::UnknownSeriesReference,
                "/conditions",
                format!("condition references unknown series '{reference}'"),
            ));
        }
    }
}
