//! In-memory replication log

use super::{FeedCursor, OperationKind, Position, ReplicationLog, MASTER_LOG, REPLICA_SET_LOG};
use crate::error::{Error, Result};
use crate::storage::matcher;
use async_trait::async_trait;
use docspec::WireMap;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug)]
struct LogState {
    replicated: bool,
    entries: Vec<WireMap>,
    last_ts: u64,
    /// Bumped to kill every open cursor
    generation: u64,
    /// Pending injected read failures
    failures: usize,
}

/// An append-only log shared by a [`crate::storage::MemoryStore`] and any
/// number of tailers. Clones share the same log.
#[derive(Debug, Clone)]
pub struct MemoryOplog {
    state: Arc<Mutex<LogState>>,
}

impl Default for MemoryOplog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOplog {
    /// A replica set log, exposed as `oplog.rs`
    pub fn new() -> Self {
        Self::with_topology(true)
    }

    /// A master/slave log, exposed as `oplog.$main`
    pub fn master() -> Self {
        Self::with_topology(false)
    }

    fn with_topology(replicated: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState {
                replicated,
                entries: Vec::new(),
                last_ts: 0,
                generation: 0,
                failures: 0,
            })),
        }
    }

    /// Name of the log collection this topology exposes
    pub async fn log_name(&self) -> &'static str {
        if self.state.lock().await.replicated {
            REPLICA_SET_LOG
        } else {
            MASTER_LOG
        }
    }

    /// Append an entry and return its position
    pub async fn append(
        &self,
        namespace: &str,
        kind: OperationKind,
        o: JsonValue,
        o2: Option<JsonValue>,
    ) -> Position {
        let mut state = self.state.lock().await;
        state.last_ts += 1;
        let mut entry = WireMap::new();
        entry.insert("ts".into(), JsonValue::from(state.last_ts));
        entry.insert("ns".into(), JsonValue::from(namespace));
        entry.insert("op".into(), JsonValue::from(kind.code()));
        entry.insert("o".into(), o);
        if let Some(o2) = o2 {
            entry.insert("o2".into(), o2);
        }
        state.entries.push(entry);
        Position(state.last_ts)
    }

    /// Append a heartbeat entry
    pub async fn append_noop(&self) -> Position {
        self.append("", OperationKind::Noop, JsonValue::Object(WireMap::new()), None)
            .await
    }

    /// Make the next `count` reads fail with a reconnect error
    pub async fn fail_next_reads(&self, count: usize) {
        self.state.lock().await.failures = count;
    }

    /// Kill all open cursors, as a server-side cursor timeout would
    pub async fn kill_cursors(&self) {
        self.state.lock().await.generation += 1;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn take_failure(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failures > 0 {
            state.failures -= 1;
            return Err(Error::Reconnect {
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(())
    }

    async fn check_log(&self, log: &str) -> Result<()> {
        let expected = self.log_name().await;
        if log != expected {
            return Err(Error::OperationFailure {
                message: format!("no such collection 'local.{log}'"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicationLog for MemoryOplog {
    async fn is_replicated(&self) -> Result<bool> {
        self.take_failure().await?;
        Ok(self.state.lock().await.replicated)
    }

    async fn latest_position(&self, log: &str) -> Result<Option<Position>> {
        self.take_failure().await?;
        self.check_log(log).await?;
        let state = self.state.lock().await;
        Ok(state.entries.last().map(|_| Position(state.last_ts)))
    }

    async fn open_cursor(&self, log: &str, filter: &WireMap) -> Result<Box<dyn FeedCursor>> {
        self.take_failure().await?;
        self.check_log(log).await?;
        let generation = self.state.lock().await.generation;
        Ok(Box::new(MemoryCursor {
            log: self.clone(),
            filter: filter.clone(),
            next_index: 0,
            generation,
            alive: true,
        }))
    }
}

struct MemoryCursor {
    log: MemoryOplog,
    filter: WireMap,
    next_index: usize,
    generation: u64,
    alive: bool,
}

#[async_trait]
impl FeedCursor for MemoryCursor {
    async fn next(&mut self) -> Result<Option<WireMap>> {
        self.log.take_failure().await?;
        let state = self.log.state.lock().await;
        if state.generation != self.generation {
            self.alive = false;
            return Ok(None);
        }
        while self.next_index < state.entries.len() {
            let entry = &state.entries[self.next_index];
            self.next_index += 1;
            if matcher::matches(entry, &self.filter)? {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}
