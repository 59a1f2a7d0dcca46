//! Error types for expression construction

use serde_json::Value;
use thiserror::Error;

/// An operand did not have the shape its operator requires.
///
/// Raised while an expression is being built, never while it is compiled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("operator '{operator}' expects {expected}, got {actual}")]
    OperandShape {
        operator: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("operator '$mod' cannot use a zero divisor")]
    ZeroDivisor,

    #[error("field path cannot be empty")]
    EmptyPath,
}

impl ExprError {
    pub(crate) fn shape(operator: &'static str, expected: &'static str, actual: &Value) -> Self {
        ExprError::OperandShape {
            operator,
            expected,
            actual: describe(actual),
        }
    }
}

/// Short name of a JSON value's kind, used in error messages
pub fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
