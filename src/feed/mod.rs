//! Change feed
//!
//! Tails a store's append-only replication log and dispatches decoded
//! per-document events to handlers registered by namespace and operation.
//!
//! # Delivery
//!
//! ```text
//!   log entry ──decode──▶ ChangeEvent ──token = position──▶ handler ──▶ checkpoint
//! ```
//!
//! The in-memory resume token moves before dispatch and the checkpoint is
//! written after it, so a crash mid-dispatch redelivers that one event on
//! restart and never skips the next one.

mod checkpoint;
mod memory;
mod tailer;

pub use checkpoint::{Checkpoint, FileCheckpoint, MemoryCheckpoint};
pub use memory::MemoryOplog;
pub use tailer::{Tailer, TailerState};

use crate::error::{Error, Result};
use crate::schema::ID_KEY;
use async_trait::async_trait;
use docspec::WireMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::watch;

/// Log collection on replica set members
pub const REPLICA_SET_LOG: &str = "oplog.rs";

/// Log collection on standalone master nodes
pub const MASTER_LOG: &str = "oplog.$main";

/// Opaque, strictly increasing position of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(pub u64);

/// Kind of a logged operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Command,
    DbDeclare,
    Noop,
}

impl OperationKind {
    /// Code used in the `op` field of log entries
    pub fn code(self) -> &'static str {
        match self {
            OperationKind::Insert => "i",
            OperationKind::Update => "u",
            OperationKind::Delete => "d",
            OperationKind::Command => "c",
            OperationKind::DbDeclare => "db",
            OperationKind::Noop => "n",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(OperationKind::Insert),
            "u" => Some(OperationKind::Update),
            "d" => Some(OperationKind::Delete),
            "c" => Some(OperationKind::Command),
            "db" => Some(OperationKind::DbDeclare),
            "n" => Some(OperationKind::Noop),
            _ => None,
        }
    }
}

/// A decoded log entry
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub namespace: String,
    pub kind: OperationKind,
    /// `o2._id` when present, else `o._id`
    pub id: Option<JsonValue>,
    /// The whole log entry
    pub raw: WireMap,
    pub position: Position,
}

impl ChangeEvent {
    /// Decode a raw log entry (`ts`, `ns`, `op`, `o`, optional `o2`)
    pub fn decode(raw: WireMap) -> Result<Self> {
        let malformed = |what: &str| Error::Other(format!("malformed log entry: {what}"));
        let position = raw
            .get("ts")
            .and_then(JsonValue::as_u64)
            .map(Position)
            .ok_or_else(|| malformed("missing ts"))?;
        let namespace = raw
            .get("ns")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| malformed("missing ns"))?
            .to_string();
        let code = raw
            .get("op")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| malformed("missing op"))?;
        let kind = OperationKind::from_code(code)
            .ok_or_else(|| malformed(&format!("unknown op '{code}'")))?;

        let id = ["o2", "o"]
            .iter()
            .filter_map(|key| raw.get(*key))
            .filter_map(|payload| payload.get(ID_KEY))
            .find(|id| !id.is_null())
            .cloned();

        Ok(Self {
            namespace,
            kind,
            id,
            raw,
            position,
        })
    }

    fn payload(&self) -> JsonValue {
        self.raw.get("o").cloned().unwrap_or(JsonValue::Null)
    }

    /// Kind-specific handler arguments
    pub fn into_action(self) -> FeedAction {
        match self.kind {
            OperationKind::Insert => FeedAction::Insert(self.payload()),
            OperationKind::Update => FeedAction::Update {
                id: self.id.unwrap_or(JsonValue::Null),
                raw: self.raw,
            },
            OperationKind::Delete => FeedAction::Delete {
                id: self.id.unwrap_or(JsonValue::Null),
            },
            OperationKind::Command => FeedAction::Command(self.raw),
            OperationKind::DbDeclare => FeedAction::DbDeclare(self.raw),
            OperationKind::Noop => FeedAction::Noop(self.position),
        }
    }
}

/// What a handler receives for one event
#[derive(Debug, Clone, PartialEq)]
pub enum FeedAction {
    /// The inserted document
    Insert(JsonValue),
    /// Affected id and the whole entry; the update document is under `o`
    Update { id: JsonValue, raw: WireMap },
    Delete { id: JsonValue },
    Command(WireMap),
    DbDeclare(WireMap),
    /// Heartbeat
    Noop(Position),
}

/// Receives the events of one `(namespace, kind)` pair
#[async_trait]
pub trait FeedHandler: Send + Sync {
    async fn handle(&self, action: FeedAction) -> Result<()>;
}

/// Read access to a store's replication log
#[async_trait]
pub trait ReplicationLog: Send + Sync {
    /// Whether the store runs as a replica set member
    async fn is_replicated(&self) -> Result<bool>;

    /// Position of the newest entry in `log`
    async fn latest_position(&self, log: &str) -> Result<Option<Position>>;

    /// Open a live cursor over the entries of `log` matching `filter`
    async fn open_cursor(&self, log: &str, filter: &WireMap) -> Result<Box<dyn FeedCursor>>;
}

/// A tailable cursor
#[async_trait]
pub trait FeedCursor: Send {
    /// Next entry, or `None` when nothing new has arrived yet
    async fn next(&mut self) -> Result<Option<WireMap>>;

    /// A dead cursor must be reopened
    fn is_alive(&self) -> bool;
}

// =============================================================================
// Cooperative cancellation
// =============================================================================

/// Owner side of a stop signal
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Checked by long-running tasks at loop tops and sleep boundaries.
/// Dropping the [`StopHandle`] never stops a task.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected stop handle and signal
pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop is requested
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration` unless stopped first. Returns whether stop was
    /// requested.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_stopped(),
            _ = self.stopped() => true,
        }
    }
}
