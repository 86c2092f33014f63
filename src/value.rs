//! Runtime values produced by expression evaluation
//!
//! Every operand is an `Option<Value>` at runtime: `None` models a missing
//! measurement and propagates through arithmetic, comparisons, and casts.
//! Casting never coerces across families. A text operand in an arithmetic
//! position is a type error, not a parse attempt.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ExpressionError, Result};
use crate::multi_values::MultiValues;

/// A single evaluated operand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    Text(String),
    Boolean(bool),
    /// Collected values produced by a period or org-unit scope
    Multi(MultiValues),
}

impl Value {
    /// Cast to a number; `None` passes through, non-numbers are a type error
    pub fn as_number(value: Option<&Value>) -> Result<Option<f64>> {
        match value {
            None => Ok(None),
            Some(Value::Number(n)) => Ok(Some(*n)),
            Some(other) => Err(cast_error(other, "a number")),
        }
    }

    /// Cast to text; `None` passes through
    pub fn as_text(value: Option<&Value>) -> Result<Option<String>> {
        match value {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(other) => Err(cast_error(other, "text")),
        }
    }

    /// Cast to a boolean; `None` passes through
    pub fn as_boolean(value: Option<&Value>) -> Result<Option<bool>> {
        match value {
            None => Ok(None),
            Some(Value::Boolean(b)) => Ok(Some(*b)),
            Some(other) => Err(cast_error(other, "a boolean")),
        }
    }

    /// Compare two operands for the relational and equality operators.
    ///
    /// Either side null, or a pair from different families, yields `None`
    /// rather than an error. Only a container operand is rejected, since it
    /// must be aggregated before it can stand in a scalar position.
    pub fn compare(left: Option<&Value>, right: Option<&Value>) -> Result<Option<Ordering>> {
        if let Some(multi @ Value::Multi(_)) = left {
            return Err(cast_error(multi, "a comparable value"));
        }
        if let Some(multi @ Value::Multi(_)) = right {
            return Err(cast_error(multi, "a comparable value"));
        }
        match (left, right) {
            (None, _) | (_, None) => Ok(None),
            (Some(Value::Number(a)), Some(Value::Number(b))) => Ok(a.partial_cmp(b)),
            (Some(Value::Text(a)), Some(Value::Text(b))) => Ok(Some(a.cmp(b))),
            (Some(Value::Boolean(a)), Some(Value::Boolean(b))) => Ok(Some(a.cmp(b))),
            _ => Ok(None),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "a number",
            Value::Text(_) => "text",
            Value::Boolean(_) => "a boolean",
            Value::Multi(_) => "multiple values",
        }
    }
}

fn cast_error(value: &Value, wanted: &str) -> ExpressionError {
    match value {
        Value::Multi(_) => ExpressionError::Type(format!(
            "found multiple values where {} was expected; aggregate them first",
            wanted
        )),
        other => ExpressionError::Type(format!("expected {}, found {}", wanted, other.kind_name())),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Multi(m) => write!(f, "[{} values]", m.len()),
        }
    }
}
