//! Boolean evaluation of condition expressions over series values.
//!
//! Comparisons follow IEEE-754: anything compared with NaN is false, so a
//! series the backend reported as null never satisfies `>`, `<` or `==`.
//! A reference to a series without a value is an error, and callers treat any
//! error as "condition not satisfied".

use std::collections::HashMap;

use corragg_parser::Expr;

use crate::error::{EvalError, Result};

/// Evaluate `expr` as a boolean against `values` (series id → value).
///
/// Both operands of `and`/`or` are always evaluated, so a bad reference on
/// either side is reported even when the other side decides the outcome.
pub fn evaluate(expr: &Expr, values: &HashMap<&str, f64>) -> Result<bool> {
    match expr {
        Expr::And { left, right } => {
            let l = evaluate(left, values);
            let r = evaluate(right, values);
            Ok(l? & r?)
        }
        Expr::Or { left, right } => {
            let l = evaluate(left, values);
            let r = evaluate(right, values);
            Ok(l? | r?)
        }
        Expr::Not { left } => Ok(!evaluate(left, values)?),
        Expr::Group { child, .. } => evaluate(child, values),
        Expr::True => Ok(true),
        Expr::Greater { left, right } => compare(left, right, values, |l, r| l > r),
        Expr::GreaterEqual { left, right } => compare(left, right, values, |l, r| l >= r),
        Expr::Lesser { left, right } => compare(left, right, values, |l, r| l < r),
        Expr::LesserEqual { left, right } => compare(left, right, values, |l, r| l <= r),
        Expr::Equals { left, right } => compare(left, right, values, |l, r| l == r),
        Expr::NumberReference { .. } | Expr::NumberValue { .. } => Err(EvalError::ConditionType(
            format!("numeric expression '{expr}' used as a condition"),
        )),
    }
}

/// [`evaluate`], failing closed: any evaluation error counts as `false`.
pub fn satisfies(expr: &Expr, values: &HashMap<&str, f64>) -> bool {
    match evaluate(expr, values) {
        Ok(matched) => matched,
        Err(e) => {
            log::debug!("Condition '{expr}' not satisfied: {e}");
            false
        }
    }
}

fn compare(
    left: &Expr,
    right: &Expr,
    values: &HashMap<&str, f64>,
    op: impl Fn(f64, f64) -> bool,
) -> Result<bool> {
    let l = number(left, values)?;
    let r = number(right, values)?;
    Ok(op(l, r))
}

fn number(expr: &Expr, values: &HashMap<&str, f64>) -> Result<f64> {
    match expr {
        Expr::NumberValue { value } => Ok(*value),
        Expr::NumberReference { reference } => values
            .get(reference.as_str())
            .copied()
            .ok_or_else(|| EvalError::UnknownReference(reference.clone())),
        Expr::Group { child, .. } => number(child, values),
        other => Err(EvalError::ConditionType(format!(
            "boolean expression '{other}' used as a number"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================
