//! # corragg-parser
//!
//! Strongly-typed aggregation definitions for scheduled correlation searches.
//!
//! This crate turns YAML/JSON definition documents into an
//! [`AggregationDefinition`]:
//!
//! - **Series**: named metrics (`count`, `card`, `sum`, `avg`, `min`, `max`,
//!   `stddev`, `variance`, `sumofsquares`, `percentile`) computed per group
//! - **Conditions**: boolean expressions over series values, written either in a
//!   small condition language (`cnt > 5 and avg_took < 200`) or as a tagged
//!   JSON tree
//! - **Timespans**: `search_within` / `execute_every` as `5m`, `30s`, `1h`, ...
//! - **Validation**: semantic checks a definition must pass before it runs
//!
//! ## Architecture
//!
//! - **PEG grammar** ([`pest`]) for condition parsing with Pratt operator
//!   precedence (`not` > `and` > `or`)
//! - **serde_yaml** for document structure
//!
//! ## Quick Start
//!
//! ```rust
//! use corragg_parser::parse_definitions_yaml;
//!
//! let yaml = r#"
//! id: failed-logins
//! title: Failed logins
//! query: "action:login AND outcome:failure"
//! group_by: [username]
//! series:
//!   - id: cnt
//!     function: count
//! conditions: cnt > 5
//! search_within: 5m
//! execute_every: 1m
//! "#;
//!
//! let collection = parse_definitions_yaml(yaml).unwrap();
//! assert_eq!(collection.definitions.len(), 1);
//! assert_eq!(collection.definitions[0].search_within_ms, 300_000);
//! ```

pub mod ast;
pub mod condition;
pub mod error;
pub mod parser;
pub mod validate;
pub mod value;

// Re-export the most commonly used types and functions at crate root
pub use ast::*;
pub use condition::parse_condition;
pub use error::{DefinitionError, Result};
pub use parser::{
    parse_conditions_value, parse_definition_directory, parse_definition_file,
    parse_definition_value, parse_definitions_json, parse_definitions_yaml,
};
pub use validate::{ValidationIssue, ValidationRule, ensure_valid, validate};
pub use value::{Timespan, TimespanUnit};
