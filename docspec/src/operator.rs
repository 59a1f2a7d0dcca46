//! Operator vocabulary of the wire protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExprError;

/// Comparison, containment, existence and text-match operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Nin,
    All,
    Size,
    Exists,
    Mod,
    Type,
    Where,
    Slice,
    ElemMatch,
    Regex,
    Options,
}

impl Operator {
    /// Key used for this operator in a compiled operator map
    pub fn wire_key(self) -> &'static str {
        match self {
            Operator::Eq => "$eq",
            Operator::Ne => "$ne",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::In => "$in",
            Operator::Nin => "$nin",
            Operator::All => "$all",
            Operator::Size => "$size",
            Operator::Exists => "$exists",
            Operator::Mod => "$mod",
            Operator::Type => "$type",
            Operator::Where => "$where",
            Operator::Slice => "$slice",
            Operator::ElemMatch => "$elemMatch",
            Operator::Regex => "$regex",
            Operator::Options => "$options",
        }
    }

    /// Inverse of [`Operator::wire_key`]
    pub fn from_wire_key(key: &str) -> Option<Self> {
        let op = match key {
            "$eq" => Operator::Eq,
            "$ne" => Operator::Ne,
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$in" => Operator::In,
            "$nin" => Operator::Nin,
            "$all" => Operator::All,
            "$size" => Operator::Size,
            "$exists" => Operator::Exists,
            "$mod" => Operator::Mod,
            "$type" => Operator::Type,
            "$where" => Operator::Where,
            "$slice" => Operator::Slice,
            "$elemMatch" => Operator::ElemMatch,
            "$regex" => Operator::Regex,
            "$options" => Operator::Options,
            _ => return None,
        };
        Some(op)
    }

    /// The operator whose condition is the logical negation of this one.
    ///
    /// `Exists` is its own dual with a flipped operand and is handled by the
    /// caller. Operators without a dual are negated with a `$not` wrapper.
    pub fn dual(self) -> Option<Self> {
        match self {
            Operator::Eq => Some(Operator::Ne),
            Operator::Ne => Some(Operator::Eq),
            Operator::Lt => Some(Operator::Gte),
            Operator::Gte => Some(Operator::Lt),
            Operator::Gt => Some(Operator::Lte),
            Operator::Lte => Some(Operator::Gt),
            Operator::In => Some(Operator::Nin),
            Operator::Nin => Some(Operator::In),
            _ => None,
        }
    }

    /// Check that `operand` has the shape this operator needs on the wire
    pub fn check_operand(self, operand: &Value) -> Result<(), ExprError> {
        let key = self.wire_key();
        match self {
            Operator::In | Operator::Nin | Operator::All => {
                if !operand.is_array() {
                    return Err(ExprError::shape(key, "an array", operand));
                }
            }
            Operator::Size => {
                if operand.as_u64().is_none() {
                    return Err(ExprError::shape(key, "a non-negative integer", operand));
                }
            }
            Operator::Exists => {
                if !operand.is_boolean() {
                    return Err(ExprError::shape(key, "a bool", operand));
                }
            }
            Operator::Mod => match operand.as_array().map(Vec::as_slice) {
                Some([divisor, remainder]) if divisor.is_number() && remainder.is_number() => {
                    if divisor.as_f64() == Some(0.0) {
                        return Err(ExprError::ZeroDivisor);
                    }
                }
                _ => return Err(ExprError::shape(key, "[divisor, remainder]", operand)),
            },
            Operator::Type => {
                if !(operand.is_i64() || operand.is_string()) {
                    return Err(ExprError::shape(key, "a type code or alias", operand));
                }
            }
            Operator::Where | Operator::Regex | Operator::Options => {
                if !operand.is_string() {
                    return Err(ExprError::shape(key, "a string", operand));
                }
            }
            Operator::Slice => {
                let ok = match operand {
                    Value::Number(n) => n.is_i64(),
                    Value::Array(items) => items.len() == 2 && items.iter().all(Value::is_i64),
                    _ => false,
                };
                if !ok {
                    return Err(ExprError::shape(key, "a count or [skip, limit]", operand));
                }
            }
            Operator::ElemMatch => {
                if !operand.is_object() {
                    return Err(ExprError::shape(key, "an object", operand));
                }
            }
            Operator::Eq
            | Operator::Ne
            | Operator::Lt
            | Operator::Lte
            | Operator::Gt
            | Operator::Gte => {}
        }
        Ok(())
    }
}

/// Document-modifying operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationOp {
    Set,
    Unset,
    Inc,
    Push,
    PushAll,
    Pull,
    PullAll,
    AddToSet,
    Pop,
}

impl MutationOp {
    pub fn wire_key(self) -> &'static str {
        match self {
            MutationOp::Set => "$set",
            MutationOp::Unset => "$unset",
            MutationOp::Inc => "$inc",
            MutationOp::Push => "$push",
            MutationOp::PushAll => "$pushAll",
            MutationOp::Pull => "$pull",
            MutationOp::PullAll => "$pullAll",
            MutationOp::AddToSet => "$addToSet",
            MutationOp::Pop => "$pop",
        }
    }

    pub fn from_wire_key(key: &str) -> Option<Self> {
        let op = match key {
            "$set" => MutationOp::Set,
            "$unset" => MutationOp::Unset,
            "$inc" => MutationOp::Inc,
            "$push" => MutationOp::Push,
            "$pushAll" => MutationOp::PushAll,
            "$pull" => MutationOp::Pull,
            "$pullAll" => MutationOp::PullAll,
            "$addToSet" => MutationOp::AddToSet,
            "$pop" => MutationOp::Pop,
            _ => return None,
        };
        Some(op)
    }

    pub fn check_operand(self, operand: &Value) -> Result<(), ExprError> {
        let key = self.wire_key();
        match self {
            MutationOp::PushAll | MutationOp::PullAll => {
                if !operand.is_array() {
                    return Err(ExprError::shape(key, "an array", operand));
                }
            }
            MutationOp::Inc => {
                if !operand.is_number() {
                    return Err(ExprError::shape(key, "a number", operand));
                }
            }
            MutationOp::Pop => {
                if !matches!(operand.as_i64(), Some(1) | Some(-1)) {
                    return Err(ExprError::shape(key, "1 or -1", operand));
                }
            }
            MutationOp::Set
            | MutationOp::Unset
            | MutationOp::Push
            | MutationOp::Pull
            | MutationOp::AddToSet => {}
        }
        Ok(())
    }
}
