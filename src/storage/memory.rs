//! In-memory document store
//!
//! Keeps records per namespace and evaluates the wire format with
//! [`super::matcher`] and [`super::update`]. When attached to a
//! [`MemoryOplog`] every write is also logged the way a replicated store
//! would log it.

use super::matcher::{self, compare_values};
use super::update;
use super::{FindOptions, SortOrder, Store, UpdateOptions};
use crate::error::{Error, Result};
use crate::feed::{MemoryOplog, OperationKind};
use crate::schema::ID_KEY;
use crate::validation;
use async_trait::async_trait;
use docspec::WireMap;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct StoreState {
    collections: HashMap<String, Vec<WireMap>>,
    /// Every find issued, for inspection in tests
    finds: Vec<(String, WireMap)>,
    /// Pending injected failures
    failures: usize,
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    oplog: Option<MemoryOplog>,
    id_seed: u32,
    id_counter: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self {
            state: Mutex::new(StoreState::default()),
            oplog: None,
            id_seed: seed,
            id_counter: AtomicU64::new(1),
        }
    }

    /// Log every write to `oplog`
    pub fn with_oplog(mut self, oplog: MemoryOplog) -> Self {
        self.oplog = Some(oplog);
        self
    }

    /// Generate a fresh 24 hex character object id
    pub fn generate_id(&self) -> String {
        let n = self.id_counter.fetch_add(1, AtomicOrdering::Relaxed);
        format!("{:08x}{:016x}", self.id_seed, n)
    }

    /// Make the next `count` calls fail with a reconnect error
    pub async fn fail_next(&self, count: usize) {
        self.state.lock().await.failures = count;
    }

    /// Namespaces and filters of every find issued so far
    pub async fn finds(&self) -> Vec<(String, WireMap)> {
        self.state.lock().await.finds.clone()
    }

    async fn log(&self, namespace: &str, kind: OperationKind, o: JsonValue, o2: Option<JsonValue>) {
        if let Some(oplog) = &self.oplog {
            oplog.append(namespace, kind, o, o2).await;
        }
    }

    fn take_failure(state: &mut StoreState) -> Result<()> {
        if state.failures > 0 {
            state.failures -= 1;
            return Err(Error::Reconnect {
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(())
    }
}

fn id_filter(id: &JsonValue) -> JsonValue {
    let mut map = WireMap::new();
    map.insert(ID_KEY.to_string(), id.clone());
    JsonValue::Object(map)
}

fn command_namespace(namespace: &str) -> String {
    let db = namespace.split('.').next().unwrap_or(namespace);
    format!("{db}.$cmd")
}

#[async_trait]
impl Store for MemoryStore {
    async fn find(
        &self,
        namespace: &str,
        filter: &WireMap,
        options: &FindOptions,
    ) -> Result<Vec<WireMap>> {
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state)?;
        state.finds.push((namespace.to_string(), filter.clone()));

        let mut found = Vec::new();
        for record in state.collections.get(namespace).into_iter().flatten() {
            if matcher::matches(record, filter)? {
                found.push(record);
            }
        }
        if !options.sort.is_empty() {
            found.sort_by(|a, b| compare_by(a, b, &options.sort));
        }
        let records = found
            .into_iter()
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|record| match &options.projection {
                Some(projection) => project(record, projection),
                None => record.clone(),
            })
            .collect();
        Ok(records)
    }

    async fn count(&self, namespace: &str, filter: &WireMap) -> Result<usize> {
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state)?;
        let mut n = 0;
        for record in state.collections.get(namespace).into_iter().flatten() {
            if matcher::matches(record, filter)? {
                n += 1;
            }
        }
        Ok(n)
    }

    async fn insert(&self, namespace: &str, mut record: WireMap) -> Result<String> {
        validation::validate_namespace(namespace)?;
        let id = {
            let mut state = self.state.lock().await;
            Self::take_failure(&mut state)?;
            let id = match record.get(ID_KEY) {
                Some(JsonValue::String(id)) => id.clone(),
                Some(other) => other.to_string(),
                None => {
                    let id = self.generate_id();
                    record.insert(ID_KEY.to_string(), JsonValue::String(id.clone()));
                    id
                }
            };
            let collection = state.collections.entry(namespace.to_string()).or_default();
            let id_value = record.get(ID_KEY).cloned().unwrap_or(JsonValue::Null);
            if collection
                .iter()
                .any(|r| r.get(ID_KEY).map(|v| matcher::values_equal(v, &id_value)).unwrap_or(false))
            {
                return Err(Error::Operation {
                    message: format!("duplicate key {id} in {namespace}"),
                });
            }
            collection.push(record.clone());
            id
        };
        debug!(ns = namespace, id = %id, "inserted");
        self.log(namespace, OperationKind::Insert, JsonValue::Object(record), None)
            .await;
        Ok(id)
    }

    async fn update(
        &self,
        namespace: &str,
        filter: &WireMap,
        update_doc: &WireMap,
        options: UpdateOptions,
    ) -> Result<usize> {
        let mut logged: Vec<(OperationKind, JsonValue, Option<JsonValue>)> = Vec::new();
        let touched = {
            let mut state = self.state.lock().await;
            Self::take_failure(&mut state)?;
            let collection = state.collections.entry(namespace.to_string()).or_default();

            // Every matching record is updated on a copy first; nothing is
            // committed unless all of them apply.
            let mut staged = Vec::new();
            for (index, record) in collection.iter().enumerate() {
                if !matcher::matches(record, filter)? {
                    continue;
                }
                let mut next = record.clone();
                update::apply(&mut next, update_doc, filter)?;
                staged.push((index, next));
                if !options.multi {
                    break;
                }
            }

            let mut touched = 0;
            for (index, next) in staged {
                let id = next.get(ID_KEY).cloned().unwrap_or(JsonValue::Null);
                let o = if update::is_replacement(update_doc) {
                    JsonValue::Object(next.clone())
                } else {
                    JsonValue::Object(update_doc.clone())
                };
                logged.push((OperationKind::Update, o, Some(id_filter(&id))));
                collection[index] = next;
                touched += 1;
            }

            if touched == 0 && options.upsert {
                let mut seed = upsert_seed(filter);
                if update::is_replacement(update_doc) {
                    seed.retain(|k, _| k == ID_KEY);
                }
                update::apply(&mut seed, update_doc, filter)?;
                if !seed.contains_key(ID_KEY) {
                    seed.insert(ID_KEY.to_string(), JsonValue::String(self.generate_id()));
                }
                collection.push(seed.clone());
                logged.push((OperationKind::Insert, JsonValue::Object(seed), None));
                touched = 1;
            }
            touched
        };
        for (kind, o, o2) in logged {
            self.log(namespace, kind, o, o2).await;
        }
        Ok(touched)
    }

    async fn remove(&self, namespace: &str, filter: &WireMap) -> Result<usize> {
        let removed = {
            let mut state = self.state.lock().await;
            Self::take_failure(&mut state)?;
            let Some(collection) = state.collections.get_mut(namespace) else {
                return Ok(0);
            };
            let hits = collection
                .iter()
                .map(|record| matcher::matches(record, filter))
                .collect::<Result<Vec<bool>>>()?;
            let mut removed = Vec::new();
            let mut hits = hits.into_iter();
            collection.retain(|record| {
                if hits.next().unwrap_or(false) {
                    removed.push(record.get(ID_KEY).cloned().unwrap_or(JsonValue::Null));
                    false
                } else {
                    true
                }
            });
            removed
        };
        for id in &removed {
            self.log(namespace, OperationKind::Delete, id_filter(id), None)
                .await;
        }
        Ok(removed.len())
    }

    async fn drop_collection(&self, namespace: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            Self::take_failure(&mut state)?;
            state.collections.remove(namespace);
        }
        let collection = namespace.split_once('.').map(|(_, c)| c).unwrap_or(namespace);
        let mut o = WireMap::new();
        o.insert("drop".to_string(), JsonValue::from(collection));
        self.log(&command_namespace(namespace), OperationKind::Command, JsonValue::Object(o), None)
            .await;
        Ok(())
    }
}

/// Top-level equality conditions of a filter, the base of an upserted record
fn upsert_seed(filter: &WireMap) -> WireMap {
    let mut seed = WireMap::new();
    for (key, value) in filter {
        let is_operator = value
            .as_object()
            .map(|m| m.keys().any(|k| k.starts_with('$')))
            .unwrap_or(false);
        if !key.starts_with('$') && !key.contains('.') && !is_operator {
            seed.insert(key.clone(), value.clone());
        }
    }
    seed
}

fn compare_by(a: &WireMap, b: &WireMap, keys: &[(String, SortOrder)]) -> Ordering {
    for (key, order) in keys {
        let left = matcher::lookup(a, key).first().copied();
        let right = matcher::lookup(b, key).first().copied();
        let cmp = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        };
        if cmp != Ordering::Equal {
            return match order {
                SortOrder::Ascending => cmp,
                SortOrder::Descending => cmp.reverse(),
            };
        }
    }
    Ordering::Equal
}

// =============================================================================
// Projection
// =============================================================================

fn is_included(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64() != Some(0.0),
        _ => false,
    }
}

fn is_excluded(value: &JsonValue) -> bool {
    matches!(value, JsonValue::Bool(false)) || value.as_f64() == Some(0.0)
}

/// Apply a `{path: 1}` / `{path: {"$slice": n}}` projection
pub(crate) fn project(record: &WireMap, projection: &WireMap) -> WireMap {
    let inclusive = projection
        .iter()
        .any(|(k, v)| k.as_str() != ID_KEY && is_included(v));
    // Sliced fields ride along with plain inclusions
    let inclusions: Vec<&String> = projection
        .iter()
        .filter(|(k, v)| k.as_str() != ID_KEY && (is_included(v) || v.get("$slice").is_some()))
        .map(|(k, _)| k)
        .collect();

    let mut out = if !inclusive {
        record.clone()
    } else {
        let mut out = WireMap::new();
        if let Some(id) = record.get(ID_KEY) {
            out.insert(ID_KEY.to_string(), id.clone());
        }
        for path in inclusions {
            let segments: Vec<&str> = path.split('.').collect();
            include(record, &segments, &mut out);
        }
        out
    };

    for (path, spec) in projection {
        if is_excluded(spec) {
            if path == ID_KEY || !path.contains('.') {
                out.remove(path);
            }
        } else if let Some(slice) = spec.get("$slice") {
            let segments: Vec<&str> = path.split('.').collect();
            slice_at(&mut out, &segments, slice);
        }
    }
    out
}

fn include(src: &WireMap, segments: &[&str], dst: &mut WireMap) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let Some(value) = src.get(*first) else {
        return;
    };
    if rest.is_empty() {
        dst.insert(first.to_string(), value.clone());
        return;
    }
    match value {
        JsonValue::Object(inner) => {
            let entry = dst
                .entry(first.to_string())
                .or_insert_with(|| JsonValue::Object(WireMap::new()));
            if let JsonValue::Object(target) = entry {
                include(inner, rest, target);
            }
        }
        JsonValue::Array(items) => {
            let entry = dst.entry(first.to_string()).or_insert_with(|| {
                JsonValue::Array(
                    items
                        .iter()
                        .filter(|i| i.is_object())
                        .map(|_| JsonValue::Object(WireMap::new()))
                        .collect(),
                )
            });
            if let JsonValue::Array(targets) = entry {
                let sources = items.iter().filter_map(JsonValue::as_object);
                for (source, target) in sources.zip(targets.iter_mut()) {
                    if let JsonValue::Object(target) = target {
                        include(source, rest, target);
                    }
                }
            }
        }
        _ => {}
    }
}

fn slice_at(doc: &mut WireMap, segments: &[&str], spec: &JsonValue) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let Some(value) = doc.get_mut(*first) else {
        return;
    };
    if !rest.is_empty() {
        if let JsonValue::Object(inner) = value {
            slice_at(inner, rest, spec);
        }
        return;
    }
    let JsonValue::Array(items) = value else {
        return;
    };
    let len = items.len() as i64;
    let (start, count) = match spec {
        JsonValue::Array(pair) => {
            let skip = pair.first().and_then(JsonValue::as_i64).unwrap_or(0);
            let limit = pair.get(1).and_then(JsonValue::as_i64).unwrap_or(len);
            let start = if skip < 0 { (len + skip).max(0) } else { skip.min(len) };
            (start, limit.max(0))
        }
        other => {
            let n = other.as_i64().unwrap_or(len);
            if n < 0 {
                ((len + n).max(0), -n)
            } else {
                (0, n)
            }
        }
    };
    let kept: Vec<JsonValue> = items
        .iter()
        .skip(start as usize)
        .take(count as usize)
        .cloned()
        .collect();
    *items = kept;
}
