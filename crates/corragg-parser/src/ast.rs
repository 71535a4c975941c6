//! Strongly-typed definitions for aggregation event processing.
//!
//! An [`AggregationDefinition`] describes a scheduled search: a query, the
//! streams it targets, the fields it groups by, the metrics ([`Series`]) it
//! computes per group, and an optional boolean [`Expr`] over those metrics.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

// =============================================================================
// Aggregation functions and series
// =============================================================================

/// The closed set of metric functions a series can compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFunction {
    Count,
    Card,
    Sum,
    Avg,
    Min,
    Max,
    Stddev,
    Variance,
    Sumofsquares,
    Percentile,
}

impl AggregationFunction {
    pub const ALL: [AggregationFunction; 10] = [
        AggregationFunction::Count,
        AggregationFunction::Card,
        AggregationFunction::Sum,
        AggregationFunction::Avg,
        AggregationFunction::Min,
        AggregationFunction::Max,
        AggregationFunction::Stddev,
        AggregationFunction::Variance,
        AggregationFunction::Sumofsquares,
        AggregationFunction::Percentile,
    ];

    /// Every function except `count` operates on a field.
    pub fn requires_field(&self) -> bool {
        !matches!(self, AggregationFunction::Count)
    }

    /// Lowercase name used in metric identifiers and event field names.
    pub fn name(&self) -> &'static str {
        match self {
            AggregationFunction::Count => "count",
            AggregationFunction::Card => "card",
            AggregationFunction::Sum => "sum",
            AggregationFunction::Avg => "avg",
            AggregationFunction::Min => "min",
            AggregationFunction::Max => "max",
            AggregationFunction::Stddev => "stddev",
            AggregationFunction::Variance => "variance",
            AggregationFunction::Sumofsquares => "sumofsquares",
            AggregationFunction::Percentile => "percentile",
        }
    }
}

impl FromStr for AggregationFunction {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        AggregationFunction::ALL
            .into_iter()
            .find(|f| f.name() == lower)
            .ok_or_else(|| DefinitionError::UnknownFunction(s.to_string()))
    }
}

impl fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A named metric computed per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub id: String,
    pub function: AggregationFunction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Only meaningful for [`AggregationFunction::Percentile`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentile: Option<f64>,
}

impl Series {
    pub fn new(id: impl Into<String>, function: AggregationFunction, field: Option<&str>) -> Self {
        Series {
            id: id.into(),
            function,
            field: field.map(str::to_string),
            percentile: None,
        }
    }

    pub fn with_percentile(mut self, percentile: f64) -> Self {
        self.percentile = Some(percentile);
        self
    }

    /// Human-readable form used in event messages, e.g. `count()`,
    /// `avg(took_ms)` or `percentile(took_ms,99)`.
    pub fn literal(&self) -> String {
        let field = self.field.as_deref().unwrap_or("");
        match (self.function, self.percentile) {
            (AggregationFunction::Percentile, Some(p)) => {
                format!("{}({field},{p})", self.function)
            }
            _ => format!("{}({field})", self.function),
        }
    }
}

// =============================================================================
// Condition expressions
// =============================================================================

/// Boolean condition over named numeric aggregates.
///
/// The serde form is the tagged JSON tree (`{"expr": "&&", "left": .., "right": ..}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr")]
pub enum Expr {
    #[serde(rename = "&&")]
    And { left: Box<Expr>, right: Box<Expr> },
    #[serde(rename = "||")]
    Or { left: Box<Expr>, right: Box<Expr> },
    #[serde(rename = "!")]
    Not { left: Box<Expr> },
    #[serde(rename = ">")]
    Greater { left: Box<Expr>, right: Box<Expr> },
    #[serde(rename = ">=")]
    GreaterEqual { left: Box<Expr>, right: Box<Expr> },
    #[serde(rename = "<")]
    Lesser { left: Box<Expr>, right: Box<Expr> },
    #[serde(rename = "<=")]
    LesserEqual { left: Box<Expr>, right: Box<Expr> },
    #[serde(rename = "==")]
    Equals { left: Box<Expr>, right: Box<Expr> },
    #[serde(rename = "number-ref")]
    NumberReference {
        #[serde(rename = "ref")]
        reference: String,
    },
    #[serde(rename = "number")]
    NumberValue { value: f64 },
    #[serde(rename = "true")]
    True,
    #[serde(rename = "group")]
    Group {
        child: Box<Expr>,
        #[serde(default)]
        operator: String,
    },
}

impl Expr {
    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::And {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Expr::Or {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn not(inner: Expr) -> Self {
        Expr::Not {
            left: Box::new(inner),
        }
    }

    pub fn greater(left: Expr, right: Expr) -> Self {
        Expr::Greater {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn greater_equal(left: Expr, right: Expr) -> Self {
        Expr::GreaterEqual {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn lesser(left: Expr, right: Expr) -> Self {
        Expr::Lesser {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn lesser_equal(left: Expr, right: Expr) -> Self {
        Expr::LesserEqual {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn equals(left: Expr, right: Expr) -> Self {
        Expr::Equals {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn reference(series_id: impl Into<String>) -> Self {
        Expr::NumberReference {
            reference: series_id.into(),
        }
    }

    pub fn number(value: f64) -> Self {
        Expr::NumberValue { value }
    }

    pub fn group(child: Expr) -> Self {
        Expr::Group {
            child: Box::new(child),
            operator: String::new(),
        }
    }

    /// All series IDs referenced anywhere in the expression, in first-seen order.
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::And { left, right }
            | Expr::Or { left, right }
            | Expr::Greater { left, right }
            | Expr::GreaterEqual { left, right }
            | Expr::Lesser { left, right }
            | Expr::LesserEqual { left, right }
            | Expr::Equals { left, right } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            Expr::Not { left } => left.collect_references(out),
            Expr::Group { child, .. } => child.collect_references(out),
            Expr::NumberReference { reference } => {
                if !out.contains(&reference.as_str()) {
                    out.push(reference);
                }
            }
            Expr::NumberValue { .. } | Expr::True => {}
        }
    }
}

fn is_bare_reference(s: &str) -> bool {
    let mut chars = s.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let keyword = matches!(
        s.to_ascii_lowercase().as_str(),
        "and" | "or" | "not" | "true"
    );
    starts_ok
        && !keyword
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Prints the textual condition language; the output parses back to an
/// equivalent expression.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::And { left, right } => write!(f, "({left} and {right})"),
            Expr::Or { left, right } => write!(f, "({left} or {right})"),
            Expr::Not { left } => write!(f, "not {left}"),
            Expr::Greater { left, right } => write!(f, "{left} > {right}"),
            Expr::GreaterEqual { left, right } => write!(f, "{left} >= {right}"),
            Expr::Lesser { left, right } => write!(f, "{left} < {right}"),
            Expr::LesserEqual { left, right } => write!(f, "{left} <= {right}"),
            Expr::Equals { left, right } => write!(f, "{left} == {right}"),
            Expr::NumberReference { reference } => {
                if is_bare_reference(reference) {
                    write!(f, "{reference}")
                } else {
                    write!(f, "\"{reference}\"")
                }
            }
            Expr::NumberValue { value } => write!(f, "{value}"),
            Expr::True => write!(f, "true"),
            Expr::Group { child, .. } => write!(f, "({child})"),
        }
    }
}

// =============================================================================
// Aggregation definition
// =============================================================================

/// A scheduled aggregation: what to search, how to group, what to compute and
/// which groups qualify.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationDefinition {
    pub id: String,
    pub title: String,
    pub query: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
    /// Target streams; empty means all streams.
    pub streams: BTreeSet<String>,
    pub group_by: Vec<String>,
    pub series: Vec<Series>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Expr>,
    pub search_within_ms: u64,
    pub execute_every_ms: u64,
    /// Scroll batch size for filter-only runs; falls back to the processor default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Maximum events per filter-only run; 0 means unlimited.
    pub event_limit: usize,
}

impl AggregationDefinition {
    /// A definition with the given id/title/query and no grouping, series or
    /// conditions. Window and interval default to one minute.
    pub fn new(id: impl Into<String>, title: impl Into<String>, query: impl Into<String>) -> Self {
        AggregationDefinition {
            id: id.into(),
            title: title.into(),
            query: query.into(),
            filters: Vec::new(),
            streams: BTreeSet::new(),
            group_by: Vec::new(),
            series: Vec::new(),
            conditions: None,
            search_within_ms: 60_000,
            execute_every_ms: 60_000,
            batch_size: None,
            event_limit: 0,
        }
    }

    /// No grouping and no series: every matching record becomes an event.
    pub fn is_filter_only(&self) -> bool {
        self.group_by.is_empty() && self.series.is_empty()
    }

    pub fn series_by_id(&self, id: &str) -> Option<&Series> {
        self.series.iter().find(|s| s.id == id)
    }
}

// =============================================================================
// Collection
// =============================================================================

/// Definitions loaded from one or more YAML/JSON documents.
#[derive(Debug, Clone, Serialize)]
pub struct DefinitionCollection {
    pub definitions: Vec<AggregationDefinition>,
    /// Per-document errors; one bad document does not fail the whole load.
    #[serde(skip)]
    pub errors: Vec<String>,
}

impl DefinitionCollection {
    pub fn new() -> Self {
        DefinitionCollection {
            definitions: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&AggregationDefinition> {
        self.definitions.iter().find(|d| d.id == id)
    }
}

impl Default for DefinitionCollection {
    fn default() -> Self {
        Self::new()
    }
}
