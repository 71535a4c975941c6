//! Condition expression parser using a pest PEG grammar + Pratt parser.
//!
//! Parses condition strings like:
//! - `"abc123 > 40 and xyz789 < 2"`
//! - `"not (errors == 0 || \"p99 latency\" >= 1500)"`
//! - `"true"`
//!
//! The result is the same [`Expr`] tree that the JSON wire form deserializes to.

use pest::Parser;
use pest::iterators::Pair;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest_derive::Parser;

use crate::ast::Expr;
use crate::error::{DefinitionError, Result};

// ---------------------------------------------------------------------------
// Pest parser (generated from condition.pest grammar)
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[grammar = "src/condition.pest"]
struct ConditionParser;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse a condition expression string into an [`Expr`].
///
/// # Examples
///
/// ```
/// use corragg_parser::condition::parse_condition;
///
/// let expr = parse_condition("abc123 > 40 and xyz789 < 2").unwrap();
/// assert_eq!(expr.references(), vec!["abc123", "xyz789"]);
/// ```
pub fn parse_condition(input: &str) -> Result<Expr> {
    let pairs = ConditionParser::parse(Rule::condition, input)
        .map_err(|e| DefinitionError::Condition(e.to_string()))?;

    let pratt = PrattParser::new()
        .op(Op::infix(Rule::or_op, Assoc::Left))
        .op(Op::infix(Rule::and_op, Assoc::Left))
        .op(Op::prefix(Rule::not_op));

    // condition = { SOI ~ expr ~ EOI }
    let expr_pair = pairs
        .into_iter()
        .next()
        .and_then(|condition| condition.into_inner().find(|p| p.as_rule() == Rule::expr))
        .ok_or_else(|| DefinitionError::Condition("empty condition".into()))?;

    parse_expr(expr_pair, &pratt)
}

// ---------------------------------------------------------------------------
// Internal parsing helpers
// ---------------------------------------------------------------------------

fn parse_expr(pair: Pair<'_, Rule>, pratt: &PrattParser<Rule>) -> Result<Expr> {
    pratt
        .map_primary(|primary| match primary.as_rule() {
            Rule::comparison => parse_comparison(primary),
            Rule::true_kw => Ok(Expr::True),
            Rule::group => {
                let inner = primary
                    .into_inner()
                    .next()
                    .ok_or_else(|| DefinitionError::Condition("empty group".into()))?;
                parse_expr(inner, pratt)
            }
            other => Err(unexpected(other)),
        })
        .map_prefix(|op, rhs| match op.as_rule() {
            Rule::not_op => Ok(Expr::not(rhs?)),
            other => Err(unexpected(other)),
        })
        .map_infix(|lhs, op, rhs| match op.as_rule() {
            Rule::and_op => Ok(Expr::and(lhs?, rhs?)),
            Rule::or_op => Ok(Expr::or(lhs?, rhs?)),
            other => Err(unexpected(other)),
        })
        .parse(pair.into_inner())
}

fn parse_comparison(pair: Pair<'_, Rule>) -> Result<Expr> {
    let mut inner = pair.into_inner();
    let (Some(lhs), Some(op), Some(rhs)) = (inner.next(), inner.next(), inner.next()) else {
        return Err(DefinitionError::Condition(
            "comparison needs two operands".into(),
        ));
    };

    let left = parse_operand(lhs)?;
    let right = parse_operand(rhs)?;

    Ok(match op.as_str() {
        ">" => Expr::greater(left, right),
        ">=" => Expr::greater_equal(left, right),
        "<" => Expr::lesser(left, right),
        "<=" => Expr::lesser_equal(left, right),
        "==" => Expr::equals(left, right),
        other => {
            return Err(DefinitionError::Condition(format!(
                "unknown comparison operator '{other}'"
            )));
        }
    })
}

fn parse_operand(pair: Pair<'_, Rule>) -> Result<Expr> {
    match pair.as_rule() {
        Rule::number => pair
            .as_str()
            .parse::<f64>()
            .map(Expr::number)
            .map_err(|e| DefinitionError::Condition(format!("bad number '{}': {e}", pair.as_str()))),
        Rule::reference => Ok(Expr::reference(pair.as_str())),
        Rule::quoted_ref => {
            let name = pair
                .into_inner()
                .next()
                .map(|p| p.as_str())
                .unwrap_or_default();
            if name.is_empty() {
                return Err(DefinitionError::Condition("empty series reference".into()));
            }
            Ok(Expr::reference(name))
        }
        other => Err(unexpected(other)),
    }
}

fn unexpected(rule: Rule) -> DefinitionError {
    DefinitionError::Condition(format!("unexpected rule: {rule:?}"))
}

// =============================================================================
// Tests
// =============================================================================
