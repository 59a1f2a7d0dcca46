//! Query document evaluation
//!
//! Evaluates a compiled filter against a stored record with the usual
//! document-store semantics: dotted paths reach into embedded objects and
//! across arrays, and a condition on an array field matches when any
//! element matches.

use crate::error::{Error, Result};
use docspec::WireMap;
use serde_json::Value;
use std::cmp::Ordering;

/// Evaluate `filter` against `doc`
pub fn matches(doc: &WireMap, filter: &WireMap) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$or" => any_branch(doc, key, condition)?,
            "$nor" => !any_branch(doc, key, condition)?,
            "$and" => all_branches(doc, key, condition)?,
            "$where" => return Err(unsupported("$where")),
            _ => {
                let candidates = lookup(doc, key);
                matches_condition(&candidates, condition)?
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn branches<'a>(key: &str, condition: &'a Value) -> Result<&'a Vec<Value>> {
    condition.as_array().ok_or_else(|| Error::Operation {
        message: format!("{key} expects an array"),
    })
}

fn any_branch(doc: &WireMap, key: &str, condition: &Value) -> Result<bool> {
    for branch in branches(key, condition)? {
        if matches(doc, as_filter(key, branch)?)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn all_branches(doc: &WireMap, key: &str, condition: &Value) -> Result<bool> {
    for branch in branches(key, condition)? {
        if !matches(doc, as_filter(key, branch)?)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn as_filter<'a>(key: &str, value: &'a Value) -> Result<&'a WireMap> {
    value.as_object().ok_or_else(|| Error::Operation {
        message: format!("{key} entries must be objects"),
    })
}

fn unsupported(operator: &str) -> Error {
    Error::Operation {
        message: format!("{operator} is not supported by this store"),
    }
}

// =============================================================================
// Path lookup
// =============================================================================

/// All values reachable at `path`, crossing arrays of objects
pub fn lookup<'a>(doc: &'a WireMap, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some(first) = doc.get(segments[0]) {
        collect(first, &segments[1..], &mut out);
    }
    out
}

fn collect<'a>(value: &'a Value, rest: &[&str], out: &mut Vec<&'a Value>) {
    let Some((segment, tail)) = rest.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*segment) {
                collect(next, tail, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = segment.parse::<usize>() {
                if let Some(next) = items.get(index) {
                    collect(next, tail, out);
                }
            }
            for item in items.iter().filter(|i| i.is_object()) {
                collect(item, rest, out);
            }
        }
        _ => {}
    }
}

/// Candidates plus the elements of any array candidate
fn expanded<'a>(candidates: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(candidates.len());
    for value in candidates {
        out.push(*value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

// =============================================================================
// Conditions
// =============================================================================

fn is_operator_map(value: &Value) -> bool {
    value
        .as_object()
        .map(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
        .unwrap_or(false)
}

fn matches_condition(candidates: &[&Value], condition: &Value) -> Result<bool> {
    match condition.as_object() {
        Some(ops) if is_operator_map(condition) => {
            let options = ops.get("$options").and_then(Value::as_str);
            for (op, operand) in ops {
                if !evaluate_operator(candidates, op, operand, options)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(equals_any(candidates, condition)),
    }
}

fn equals_any(candidates: &[&Value], target: &Value) -> bool {
    if target.is_null() && candidates.is_empty() {
        return true;
    }
    expanded(candidates)
        .into_iter()
        .any(|v| values_equal(v, target))
}

fn evaluate_operator(
    candidates: &[&Value],
    op: &str,
    operand: &Value,
    options: Option<&str>,
) -> Result<bool> {
    let values = expanded(candidates);
    Ok(match op {
        "$eq" => equals_any(candidates, operand),
        "$ne" => !equals_any(candidates, operand),
        "$lt" => any_ordered(&values, operand, |o| o == Ordering::Less),
        "$lte" => any_ordered(&values, operand, |o| o != Ordering::Greater),
        "$gt" => any_ordered(&values, operand, |o| o == Ordering::Greater),
        "$gte" => any_ordered(&values, operand, |o| o != Ordering::Less),
        "$in" => members(op, operand)?
            .iter()
            .any(|m| equals_any(candidates, m)),
        "$nin" => !members(op, operand)?
            .iter()
            .any(|m| equals_any(candidates, m)),
        "$all" => {
            let members = members(op, operand)?;
            !members.is_empty() && members.iter().all(|m| equals_any(candidates, m))
        }
        "$exists" => operand.as_bool().unwrap_or(true) != candidates.is_empty(),
        "$size" => {
            let len = operand.as_u64();
            candidates
                .iter()
                .any(|v| v.as_array().map(|a| Some(a.len() as u64) == len).unwrap_or(false))
        }
        "$mod" => {
            let (divisor, remainder) = match operand.as_array().map(Vec::as_slice) {
                Some([d, r]) => (d.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0)),
                _ => return Err(malformed(op)),
            };
            if divisor == 0.0 {
                return Err(malformed(op));
            }
            values
                .iter()
                .filter_map(|v| v.as_f64())
                .any(|n| (n.trunc() % divisor.trunc()) == remainder.trunc())
        }
        "$type" => candidates.iter().any(|v| has_type(v, operand)),
        "$regex" => {
            let pattern = operand.as_str().ok_or_else(|| malformed(op))?;
            let regex = build_regex(pattern, options)?;
            values
                .iter()
                .filter_map(|v| v.as_str())
                .any(|s| regex.is_match(s))
        }
        "$options" => true,
        "$elemMatch" => {
            let inner = operand.as_object().ok_or_else(|| malformed(op))?;
            let mut found = false;
            for candidate in candidates {
                if let Value::Array(items) = candidate {
                    for item in items {
                        if element_matches(item, operand, inner)? {
                            found = true;
                            break;
                        }
                    }
                }
            }
            found
        }
        "$not" => !matches_condition(candidates, operand)?,
        "$slice" => return Err(Error::Operation {
            message: "$slice is only valid in projections".to_string(),
        }),
        "$where" => return Err(unsupported(op)),
        other => return Err(unsupported(other)),
    })
}

/// Whether one array element satisfies an `$elemMatch` condition or a
/// `$pull` condition
pub fn element_matches(item: &Value, condition: &Value, inner: &WireMap) -> Result<bool> {
    if is_operator_map(condition) {
        return matches_condition(&[item], condition);
    }
    match item.as_object() {
        Some(fields) => matches(fields, inner),
        None => Ok(false),
    }
}

fn members<'a>(op: &str, operand: &'a Value) -> Result<&'a Vec<Value>> {
    operand.as_array().ok_or_else(|| malformed(op))
}

fn malformed(op: &str) -> Error {
    Error::Operation {
        message: format!("malformed {op} operand"),
    }
}

fn any_ordered(values: &[&Value], operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    values
        .iter()
        .filter_map(|v| compare_values(v, operand))
        .any(accept)
}

fn build_regex(pattern: &str, options: Option<&str>) -> Result<regex::Regex> {
    let mut builder = regex::RegexBuilder::new(pattern);
    for flag in options.unwrap_or("").chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            _ => &mut builder,
        };
    }
    builder.build().map_err(|e| Error::Operation {
        message: format!("invalid $regex '{pattern}': {e}"),
    })
}

fn has_type(value: &Value, operand: &Value) -> bool {
    let alias = match operand {
        Value::Number(n) => match n.as_i64() {
            Some(1) => "double",
            Some(2) => "string",
            Some(3) => "object",
            Some(4) => "array",
            Some(8) => "bool",
            Some(10) => "null",
            Some(16) => "int",
            Some(18) => "long",
            _ => return false,
        },
        Value::String(s) => s.as_str(),
        _ => return false,
    };
    match alias {
        "double" => value.is_f64(),
        "string" => value.is_string(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "bool" => value.is_boolean(),
        "null" => value.is_null(),
        "int" | "long" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        _ => false,
    }
}

// =============================================================================
// Value comparison
// =============================================================================

/// Equality that treats `1` and `1.0` as equal
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Ordering between two values of the same kind; `None` across kinds
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_doc() -> WireMap {
        json!({
            "_id": "a1",
            "title": "Test Document",
            "priority": 5,
            "done": false,
            "tags": ["rust", "database"],
            "followers": [2, 5, 9],
            "comments": [
                {"author": "bob", "votes": 3},
                {"author": "eve", "votes": 7}
            ],
            "address": {"city": "Oslo"}
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn check(filter: Value) -> bool {
        matches(&make_doc(), filter.as_object().unwrap()).unwrap()
    }

    #[test]
    fn test_equality() {
        assert!(check(json!({"title": "Test Document"})));
        assert!(check(json!({"priority": 5.0})));
        assert!(!check(json!({"title": "Other"})));
        assert!(check(json!({"missing": null})));
    }

    #[test]
    fn test_comparison() {
        assert!(check(json!({"priority": {"$gt": 3, "$lt": 10}})));
        assert!(!check(json!({"priority": {"$gte": 6}})));
        assert!(!check(json!({"priority": {"$lt": "z"}})));
    }

    #[test]
    fn test_arrays_match_any_element() {
        assert!(check(json!({"tags": "rust"})));
        assert!(check(json!({"followers": {"$in": [5, 100]}})));
        assert!(!check(json!({"followers": {"$nin": [5]}})));
        assert!(check(json!({"followers": {"$all": [2, 9]}})));
        assert!(check(json!({"followers": {"$size": 3}})));
        assert!(check(json!({"comments.author": "eve"})));
        assert!(check(json!({"comments.1.votes": 7})));
    }

    #[test]
    fn test_existence_and_types() {
        assert!(check(json!({"address.city": {"$exists": true}})));
        assert!(check(json!({"address.zip": {"$exists": false}})));
        assert!(check(json!({"title": {"$type": 2}})));
        assert!(check(json!({"tags": {"$type": "array"}})));
    }

    #[test]
    fn test_mod_and_not() {
        assert!(check(json!({"priority": {"$mod": [5, 0]}})));
        assert!(check(json!({"priority": {"$not": {"$mod": [2, 0]}}})));
    }

    #[test]
    fn test_regex() {
        assert!(check(json!({"title": {"$regex": "^test", "$options": "i"}})));
        assert!(!check(json!({"title": {"$regex": "^test"}})));
    }

    #[test]
    fn test_elem_match() {
        assert!(check(json!({"comments": {"$elemMatch": {"author": "bob", "votes": {"$gt": 2}}}})));
        assert!(!check(json!({"comments": {"$elemMatch": {"author": "bob", "votes": {"$gt": 5}}}})));
        assert!(check(json!({"followers": {"$elemMatch": {"$gt": 8}}})));
    }

    #[test]
    fn test_and_or_nor() {
        assert!(check(json!({"$or": [{"priority": 1}, {"done": false}]})));
        assert!(!check(json!({"$nor": [{"priority": 1}, {"done": false}]})));
        assert!(check(json!({"$and": [{"$or": [{"priority": 5}]}, {"$or": [{"tags": "rust"}]}]})));
    }

    #[test]
    fn test_where_is_rejected() {
        let filter = json!({"priority": {"$where": "this.priority > 1"}});
        assert!(matches(&make_doc(), filter.as_object().unwrap()).is_err());
    }
}
