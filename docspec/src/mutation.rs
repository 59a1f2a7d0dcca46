//! Mutation expressions: instructions that compile to an update document

use serde_json::{Map, Number, Value};

use crate::error::ExprError;
use crate::operator::MutationOp;
use crate::WireMap;

/// An ordered set of `(operator, path) -> operand` instructions
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mutation {
    entries: Vec<MutationEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationEntry {
    pub op: MutationOp,
    pub path: String,
    pub operand: Value,
}

impl Mutation {
    pub fn new(
        op: MutationOp,
        path: impl Into<String>,
        operand: impl Into<Value>,
    ) -> Result<Self, ExprError> {
        let path = path.into();
        if path.is_empty() {
            return Err(ExprError::EmptyPath);
        }
        let operand = operand.into();
        op.check_operand(&operand)?;
        Ok(Self {
            entries: vec![MutationEntry { op, path, operand }],
        })
    }

    /// `$unset` with the conventional `1` marker
    pub fn unset(path: impl Into<String>) -> Result<Self, ExprError> {
        Self::new(MutationOp::Unset, path, 1)
    }

    /// `$pop` from the end, or from the front when `first` is set
    pub fn pop(path: impl Into<String>, first: bool) -> Result<Self, ExprError> {
        Self::new(MutationOp::Pop, path, if first { -1 } else { 1 })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MutationEntry] {
        &self.entries
    }

    /// Combine two mutations.
    ///
    /// `$pushAll`/`$pullAll` on the same path concatenate (left first),
    /// `$inc` on the same path sums, anything else is last-write-wins.
    pub fn and(mut self, other: Mutation) -> Self {
        for entry in other.entries {
            let existing = self
                .entries
                .iter_mut()
                .find(|e| e.op == entry.op && e.path == entry.path);
            match existing {
                Some(current) => current.operand = combine(entry.op, &current.operand, entry.operand),
                None => self.entries.push(entry),
            }
        }
        self
    }

    /// Render the canonical update document
    pub fn compile(&self) -> WireMap {
        let mut doc = Map::new();
        for entry in &self.entries {
            let slot = doc
                .entry(entry.op.wire_key())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(fields) = slot {
                fields.insert(entry.path.clone(), entry.operand.clone());
            }
        }
        doc
    }
}

fn combine(op: MutationOp, left: &Value, right: Value) -> Value {
    match (op, left, right) {
        (MutationOp::PushAll | MutationOp::PullAll, Value::Array(items), Value::Array(more)) => {
            let mut items = items.clone();
            items.extend(more);
            Value::Array(items)
        }
        (MutationOp::Inc, Value::Number(a), Value::Number(b)) => add_numbers(a, &b),
        (_, _, right) => right,
    }
}

fn add_numbers(a: &Number, b: &Number) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Value::Number(sum.into());
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).map(Value::Number).unwrap_or(Value::Null)
}
