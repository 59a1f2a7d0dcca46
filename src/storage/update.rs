//! Update document application
//!
//! Applies a compiled update (`{"$set": {...}, "$inc": {...}}`) or a
//! replacement record to a stored record in place.

use super::matcher::{self, values_equal};
use crate::error::{Error, Result};
use crate::schema::ID_KEY;
use docspec::{MutationOp, WireMap};
use serde_json::Value;

/// Whether `update` is a full replacement rather than operator based
pub fn is_replacement(update: &WireMap) -> bool {
    !update.keys().any(|k| k.starts_with('$'))
}

/// Apply `update` to `doc`. `filter` is the query that selected `doc`,
/// used to resolve the positional `$` segment.
pub fn apply(doc: &mut WireMap, update: &WireMap, filter: &WireMap) -> Result<()> {
    if is_replacement(update) {
        let id = doc.remove(ID_KEY);
        if let (Some(old), Some(new)) = (&id, update.get(ID_KEY)) {
            if !values_equal(old, new) {
                return Err(rejected("the primary key cannot be changed"));
            }
        }
        doc.clear();
        if let Some(id) = id {
            doc.insert(ID_KEY.to_string(), id);
        }
        for (k, v) in update {
            if k != ID_KEY {
                doc.insert(k.clone(), v.clone());
            }
        }
        return Ok(());
    }

    for (op_key, fields) in update {
        let op = MutationOp::from_wire_key(op_key)
            .ok_or_else(|| rejected(format!("unknown update operator '{op_key}'")))?;
        let fields = fields
            .as_object()
            .ok_or_else(|| rejected(format!("{op_key} expects an object")))?;
        for (path, operand) in fields {
            if path == ID_KEY {
                return Err(rejected("the primary key cannot be changed"));
            }
            let path = resolve_positional(doc, path, filter)?;
            apply_one(doc, op, &path, operand)?;
        }
    }
    Ok(())
}

fn rejected(message: impl Into<String>) -> Error {
    Error::Operation {
        message: message.into(),
    }
}

fn apply_one(doc: &mut WireMap, op: MutationOp, path: &str, operand: &Value) -> Result<()> {
    match op {
        MutationOp::Set => {
            *slot(doc, path)? = operand.clone();
        }
        MutationOp::Unset => {
            remove(doc, path);
        }
        MutationOp::Inc => {
            let target = slot(doc, path)?;
            *target = match (&*target, operand) {
                (Value::Null, n @ Value::Number(_)) => n.clone(),
                (Value::Number(a), Value::Number(b)) => {
                    match (a.as_i64(), b.as_i64()) {
                        (Some(x), Some(y)) => x
                            .checked_add(y)
                            .map(Value::from)
                            .ok_or_else(|| rejected("$inc overflowed"))?,
                        _ => serde_json::Number::from_f64(
                            a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0),
                        )
                        .map(Value::Number)
                        .ok_or_else(|| rejected("$inc produced a non-finite number"))?,
                    }
                }
                _ => return Err(rejected(format!("cannot apply $inc to '{path}'"))),
            };
        }
        MutationOp::Push => array_at(doc, path, op)?.push(operand.clone()),
        MutationOp::PushAll => {
            let items = operand.as_array().cloned().unwrap_or_default();
            array_at(doc, path, op)?.extend(items);
        }
        MutationOp::AddToSet => {
            let items = array_at(doc, path, op)?;
            if !items.iter().any(|i| values_equal(i, operand)) {
                items.push(operand.clone());
            }
        }
        MutationOp::Pull => {
            let condition = operand.as_object().cloned();
            let items = array_at(doc, path, op)?;
            let mut kept = Vec::with_capacity(items.len());
            for item in items.drain(..) {
                let hit = match &condition {
                    Some(inner) => matcher::element_matches(&item, operand, inner)?,
                    None => values_equal(&item, operand),
                };
                if !hit {
                    kept.push(item);
                }
            }
            *items = kept;
        }
        MutationOp::PullAll => {
            let drop = operand.as_array().cloned().unwrap_or_default();
            array_at(doc, path, op)?.retain(|i| !drop.iter().any(|d| values_equal(i, d)));
        }
        MutationOp::Pop => {
            let items = array_at(doc, path, op)?;
            if !items.is_empty() {
                if operand.as_i64() == Some(-1) {
                    items.remove(0);
                } else {
                    items.pop();
                }
            }
        }
    }
    Ok(())
}

/// Replace the first `$` segment with the index of the first element
/// selected by the filter
fn resolve_positional(doc: &WireMap, path: &str, filter: &WireMap) -> Result<String> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some(pos) = segments.iter().position(|s| *s == "$") else {
        return Ok(path.to_string());
    };
    let prefix = segments[..pos].join(".");
    let not_found =
        || rejected("the positional operator did not find the match needed from the query");

    let items = matcher::lookup(doc, &prefix)
        .into_iter()
        .find_map(Value::as_array)
        .ok_or_else(not_found)?;

    let nested = format!("{prefix}.");
    let mut element_filter = WireMap::new();
    let mut direct = Vec::new();
    for (key, condition) in filter {
        if key == &prefix {
            direct.push(condition);
        } else if let Some(rest) = key.strip_prefix(&nested) {
            element_filter.insert(rest.to_string(), condition.clone());
        }
    }
    if direct.is_empty() && element_filter.is_empty() {
        return Err(not_found());
    }

    for (index, item) in items.iter().enumerate() {
        let mut hit = true;
        for condition in &direct {
            let wrapper: WireMap = [("v".to_string(), item.clone())].into_iter().collect();
            let probe: WireMap = [("v".to_string(), (*condition).clone())].into_iter().collect();
            hit &= matcher::matches(&wrapper, &probe)?;
        }
        if hit && !element_filter.is_empty() {
            hit = match item.as_object() {
                Some(fields) => matcher::matches(fields, &element_filter)?,
                None => false,
            };
        }
        if hit {
            let mut out: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
            out[pos] = index.to_string();
            return Ok(out.join("."));
        }
    }
    Err(not_found())
}

/// Null elements an update may append to reach an array index
const MAX_ARRAY_PADDING: usize = 1500;

/// Mutable slot at `path`, creating intermediate objects and padding arrays
fn slot<'a>(doc: &'a mut WireMap, path: &str) -> Result<&'a mut Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let (first, rest) = segments
        .split_first()
        .ok_or_else(|| rejected("empty update path"))?;
    let mut current = doc.entry(first.to_string()).or_insert(Value::Null);
    for segment in rest {
        if current.is_null() {
            *current = Value::Object(WireMap::new());
        }
        current = match current {
            Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| rejected(format!("cannot create field '{segment}' in an array")))?;
                if index >= items.len() {
                    if index - items.len() > MAX_ARRAY_PADDING {
                        return Err(rejected(format!(
                            "index {index} in '{path}' is too far past the end of the array"
                        )));
                    }
                    items.resize(index + 1, Value::Null);
                }
                &mut items[index]
            }
            _ => return Err(rejected(format!("cannot traverse '{path}'"))),
        };
    }
    Ok(current)
}

fn array_at<'a>(doc: &'a mut WireMap, path: &str, op: MutationOp) -> Result<&'a mut Vec<Value>> {
    let target = slot(doc, path)?;
    if target.is_null() {
        *target = Value::Array(Vec::new());
    }
    match target {
        Value::Array(items) => Ok(items),
        _ => Err(rejected(format!(
            "cannot apply {} to non-array field '{path}'",
            op.wire_key()
        ))),
    }
}

fn remove(doc: &mut WireMap, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    if parents.is_empty() {
        doc.remove(*last);
        return;
    }
    let mut current = match doc.get_mut(parents[0]) {
        Some(v) => v,
        None => return,
    };
    for segment in &parents[1..] {
        current = match current {
            Value::Object(map) => match map.get_mut(*segment) {
                Some(v) => v,
                None => return,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(v) => v,
                None => return,
            },
            _ => return,
        };
    }
    match current {
        Value::Object(map) => {
            map.remove(*last);
        }
        Value::Array(items) => {
            if let Some(item) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *item = Value::Null;
            }
        }
        _ => {}
    }
}
