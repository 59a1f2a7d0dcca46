//! In-memory search backend

use super::{SearchBackend, SearchHit, SearchRequest, SearchResponse};
use crate::error::{Error, Result};
use async_trait::async_trait;
use docspec::WireMap;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct SearchState {
    indexes: HashMap<String, BTreeMap<String, WireMap>>,
    bulk: Vec<(String, String, WireMap)>,
    attempts: usize,
    writes: usize,
    failures: usize,
}

/// A term-matching index kept in process memory.
///
/// Scoring counts matching query words per entry; a word ending in `*`
/// matches by prefix. Boolean syntax is not interpreted.
#[derive(Debug, Default)]
pub struct MemorySearch {
    state: Mutex<SearchState>,
}

impl MemorySearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with an index error
    pub async fn fail_next(&self, count: usize) {
        self.state.lock().await.failures = count;
    }

    /// Index and delete calls made, including failed ones
    pub async fn attempt_count(&self) -> usize {
        self.state.lock().await.attempts
    }

    /// Index and delete calls that changed the index
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn entry(&self, namespace: &str, id: &str) -> Option<WireMap> {
        let state = self.state.lock().await;
        state.indexes.get(namespace)?.get(id).cloned()
    }

    pub async fn len(&self, namespace: &str) -> usize {
        let state = self.state.lock().await;
        state.indexes.get(namespace).map(BTreeMap::len).unwrap_or(0)
    }

    /// Buffered bulk writes not yet flushed
    pub async fn pending_bulk(&self) -> usize {
        self.state.lock().await.bulk.len()
    }

    fn begin(state: &mut SearchState) -> Result<()> {
        state.attempts += 1;
        if state.failures > 0 {
            state.failures -= 1;
            return Err(Error::Index {
                message: "index unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn words(value: &JsonValue, out: &mut Vec<String>) {
    match value {
        JsonValue::String(s) => out.extend(
            s.split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .map(str::to_lowercase),
        ),
        JsonValue::Array(items) => items.iter().for_each(|item| words(item, out)),
        JsonValue::Object(map) => map.values().for_each(|item| words(item, out)),
        JsonValue::Null => {}
        other => out.push(other.to_string()),
    }
}

fn score(entry: &WireMap, query: &[String], boosts: &BTreeMap<String, f64>) -> f64 {
    let mut total = 0.0;
    for (key, value) in entry {
        let mut tokens = Vec::new();
        words(value, &mut tokens);
        let matched: usize = query
            .iter()
            .map(|q| match q.strip_suffix('*') {
                Some(prefix) => tokens.iter().filter(|t| t.starts_with(prefix)).count(),
                None => tokens.iter().filter(|t| *t == q).count(),
            })
            .sum();
        total += matched as f64 * boosts.get(key).copied().unwrap_or(1.0);
    }
    total
}

fn passes(entry: &WireMap, filters: &WireMap) -> bool {
    filters.iter().all(|(key, value)| entry.get(key) == Some(value))
}

#[async_trait]
impl SearchBackend for MemorySearch {
    async fn index(
        &self,
        namespace: &str,
        _doc_type: &str,
        id: &str,
        fields: WireMap,
        bulk: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::begin(&mut state)?;
        if bulk {
            state.bulk.push((namespace.to_string(), id.to_string(), fields));
        } else {
            state
                .indexes
                .entry(namespace.to_string())
                .or_default()
                .insert(id.to_string(), fields);
            state.writes += 1;
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, _doc_type: &str, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::begin(&mut state)?;
        let removed = state
            .indexes
            .get_mut(namespace)
            .and_then(|index| index.remove(id));
        match removed {
            Some(_) => {
                state.writes += 1;
                Ok(())
            }
            None => Err(Error::IndexNotFound {
                namespace: namespace.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();
        let state = self.state.lock().await;
        let query: Vec<String> = request
            .query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();

        let mut hits = Vec::new();
        for namespace in &request.namespaces {
            let Some(index) = state.indexes.get(namespace) else {
                return Err(Error::Index {
                    message: format!("no such index '{namespace}'"),
                });
            };
            for (id, entry) in index {
                if !passes(entry, &request.filters) {
                    continue;
                }
                let score = score(entry, &query, &request.boosts);
                if score > 0.0 {
                    hits.push(SearchHit {
                        namespace: namespace.clone(),
                        id: id.clone(),
                        score,
                    });
                }
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

        let total = hits.len();
        let max_score = hits.first().map(|h| h.score).unwrap_or(0.0);
        let hits = hits
            .into_iter()
            .skip(request.skip)
            .take(request.size)
            .collect();
        Ok(SearchResponse {
            total,
            took: started.elapsed(),
            max_score,
            hits,
        })
    }

    async fn create_index(&self, namespace: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.indexes.entry(namespace.to_string()).or_default();
        Ok(())
    }

    async fn delete_index(&self, namespace: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.indexes.remove(namespace) {
            Some(_) => Ok(()),
            None => Err(Error::IndexMissing {
                namespace: namespace.to_string(),
            }),
        }
    }

    async fn flush_bulk(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let pending = std::mem::take(&mut state.bulk);
        for (namespace, id, fields) in pending {
            state.indexes.entry(namespace).or_default().insert(id, fields);
            state.writes += 1;
        }
        Ok(())
    }
}
