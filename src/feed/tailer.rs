//! Change-feed tailer
//!
//! ```text
//! Bootstrapping ──▶ Tailing ──▶ Stopped
//!                    ▲   │
//!                    │   ▼
//!             RecoverableError
//! ```

use super::{
    ChangeEvent, Checkpoint, FeedHandler, OperationKind, Position, ReplicationLog, StopSignal,
    MASTER_LOG, REPLICA_SET_LOG,
};
use crate::config::FeedSettings;
use crate::error::{Error, Result};
use docspec::{Operator, Predicate, WireMap};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    Bootstrapping,
    Tailing,
    RecoverableError,
    Stopped,
}

/// Tails one replication log and dispatches events sequentially
pub struct Tailer {
    log: Arc<dyn ReplicationLog>,
    namespaces: Vec<String>,
    poll_interval: Duration,
    handlers: HashMap<(String, OperationKind), Arc<dyn FeedHandler>>,
    checkpoint: Option<Arc<dyn Checkpoint>>,
    state: TailerState,
    log_name: Option<&'static str>,
    token: Option<Position>,
}

impl Tailer {
    pub fn new(log: Arc<dyn ReplicationLog>, settings: &FeedSettings) -> Self {
        Self {
            log,
            namespaces: settings.namespaces.clone(),
            poll_interval: settings.poll_interval(),
            handlers: HashMap::new(),
            checkpoint: None,
            state: TailerState::Bootstrapping,
            log_name: None,
            token: None,
        }
    }

    /// Resume from, and record progress to, `checkpoint`
    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Only follow these namespaces, in addition to any configured ones
    pub fn follow(&mut self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        if !self.namespaces.contains(&namespace) {
            self.namespaces.push(namespace);
        }
    }

    /// Register a handler, replacing any previous one for the same key
    pub fn add_handler(
        &mut self,
        namespace: impl Into<String>,
        kind: OperationKind,
        handler: Arc<dyn FeedHandler>,
    ) {
        self.handlers.insert((namespace.into(), kind), handler);
    }

    pub fn remove_handler(
        &mut self,
        namespace: &str,
        kind: OperationKind,
    ) -> Option<Arc<dyn FeedHandler>> {
        self.handlers.remove(&(namespace.to_string(), kind))
    }

    pub fn state(&self) -> TailerState {
        self.state
    }

    /// Position of the last event handed to a handler
    pub fn resume_token(&self) -> Option<Position> {
        self.token
    }

    /// Locate the log and the starting position
    pub async fn bootstrap(&mut self) -> Result<()> {
        self.state = TailerState::Bootstrapping;
        let log_name = match self.log.is_replicated().await {
            Ok(true) => REPLICA_SET_LOG,
            Ok(false) => MASTER_LOG,
            Err(Error::OperationFailure { .. }) => MASTER_LOG,
            Err(e) => return Err(e),
        };
        let saved = match &self.checkpoint {
            Some(checkpoint) => checkpoint.load().await?,
            None => None,
        };
        self.token = match saved {
            Some(position) => {
                info!(log = log_name, position = position.0, "resuming change feed from checkpoint");
                Some(position)
            }
            None => {
                let latest = self.log.latest_position(log_name).await?;
                info!(log = log_name, position = ?latest.map(|p| p.0), "starting change feed at newest entry");
                latest
            }
        };
        self.log_name = Some(log_name);
        Ok(())
    }

    /// `ts > token` and, when configured, `ns ∈ namespaces`
    fn cursor_filter(&self) -> Result<WireMap> {
        let after = self.token.map(|p| p.0).unwrap_or(0);
        let mut filter = Predicate::compare("ts", Operator::Gt, after)?;
        if !self.namespaces.is_empty() {
            filter = filter.and(Predicate::compare(
                "ns",
                Operator::In,
                self.namespaces.clone(),
            )?);
        }
        Ok(filter.compile())
    }

    /// Run until `stop` fires. Transient failures are retried forever at the
    /// poll interval; anything else ends the run with an error.
    pub async fn run(&mut self, mut stop: StopSignal) -> Result<()> {
        while self.log_name.is_none() {
            match self.bootstrap().await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "change feed bootstrap failed, retrying");
                    self.state = TailerState::RecoverableError;
                    if stop.sleep(self.poll_interval).await {
                        self.state = TailerState::Stopped;
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        let log_name = self.log_name.unwrap_or(REPLICA_SET_LOG);

        'outer: while !stop.is_stopped() {
            let filter = self.cursor_filter()?;
            let mut cursor = match self.log.open_cursor(log_name, &filter).await {
                Ok(cursor) => cursor,
                Err(e) if e.is_transient() => {
                    self.recover(&e);
                    if stop.sleep(self.poll_interval).await {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.state = TailerState::Tailing;

            loop {
                if stop.is_stopped() {
                    break 'outer;
                }
                match cursor.next().await {
                    Ok(Some(raw)) => self.process(raw).await,
                    Ok(None) => {
                        if stop.sleep(self.poll_interval).await {
                            break 'outer;
                        }
                        if !cursor.is_alive() {
                            debug!("change feed cursor died, reopening");
                            break;
                        }
                    }
                    Err(e) if e.is_transient() => {
                        self.recover(&e);
                        if stop.sleep(self.poll_interval).await {
                            break 'outer;
                        }
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.state = TailerState::Stopped;
        info!(position = ?self.token.map(|p| p.0), "change feed stopped");
        Ok(())
    }

    fn recover(&mut self, e: &Error) {
        self.state = TailerState::RecoverableError;
        warn!(error = %e, position = ?self.token.map(|p| p.0), "change feed read failed, will retry");
    }

    /// Decode, advance, dispatch, then checkpoint one entry
    async fn process(&mut self, raw: WireMap) {
        let event = match ChangeEvent::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "skipping undecodable log entry");
                return;
            }
        };
        if self.token.map(|t| event.position <= t).unwrap_or(false) {
            debug!(position = event.position.0, "ignoring already seen log entry");
            return;
        }
        let position = event.position;
        self.token = Some(position);

        if let Err(e) = self.dispatch(event).await {
            error!(error = %e, position = position.0, "change feed handler failed");
        }

        if let Some(checkpoint) = &self.checkpoint {
            if let Err(e) = checkpoint.save(position).await {
                warn!(error = %e, position = position.0, "failed to save change feed checkpoint");
            }
        }
    }

    /// Hand one event to its handler, if any is registered
    pub async fn dispatch(&self, event: ChangeEvent) -> Result<()> {
        let key = (event.namespace.clone(), event.kind);
        match self.handlers.get(&key) {
            Some(handler) => {
                debug!(ns = %event.namespace, op = event.kind.code(), position = event.position.0, "dispatching");
                handler.handle(event.into_action()).await
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{stop_signal, FeedAction, MemoryCheckpoint, MemoryOplog};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<FeedAction>>,
    }

    #[async_trait]
    impl FeedHandler for Recorder {
        async fn handle(&self, action: FeedAction) -> Result<()> {
            self.seen.lock().await.push(action);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl FeedHandler for Failing {
        async fn handle(&self, _action: FeedAction) -> Result<()> {
            Err(Error::Index {
                message: "boom".into(),
            })
        }
    }

    fn settings() -> FeedSettings {
        FeedSettings {
            poll_interval_ms: 10,
            namespaces: Vec::new(),
        }
    }

    async fn run_until(tailer: &mut Tailer, done: impl Fn() -> bool + Send + 'static) {
        let (handle, signal) = stop_signal();
        let watcher = tokio::spawn(async move {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            handle.stop();
        });
        tailer.run(signal).await.unwrap();
        watcher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_after_existing_history() {
        let log = MemoryOplog::new();
        log.append("blog.posts", OperationKind::Insert, json!({"_id": "old"}), None).await;

        let recorder = Arc::new(Recorder::default());
        let mut tailer = Tailer::new(Arc::new(log.clone()), &settings());
        tailer.add_handler("blog.posts", OperationKind::Insert, recorder.clone());
        tailer.bootstrap().await.unwrap();

        log.append("blog.posts", OperationKind::Insert, json!({"_id": "new"}), None).await;
        let seen = recorder.clone();
        run_until(&mut tailer, move || seen.seen.try_lock().map(|s| !s.is_empty()).unwrap_or(false)).await;

        let seen = recorder.seen.lock().await;
        assert_eq!(*seen, vec![FeedAction::Insert(json!({"_id": "new"}))]);
        assert_eq!(tailer.resume_token(), Some(Position(2)));
        assert_eq!(tailer.state(), TailerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_log_fallback() {
        let log = MemoryOplog::master();
        let mut tailer = Tailer::new(Arc::new(log.clone()), &settings());
        tailer.bootstrap().await.unwrap();
        assert_eq!(tailer.log_name, Some(MASTER_LOG));
        assert_eq!(tailer.resume_token(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_keep_position() {
        let log = MemoryOplog::new();
        log.append_noop().await;

        let recorder = Arc::new(Recorder::default());
        let mut tailer = Tailer::new(Arc::new(log.clone()), &settings());
        tailer.add_handler("blog.posts", OperationKind::Delete, recorder.clone());
        tailer.add_handler("blog.posts", OperationKind::Insert, Arc::new(Failing));
        tailer.bootstrap().await.unwrap();

        log.append("blog.posts", OperationKind::Insert, json!({"_id": "x"}), None).await;
        log.append("blog.posts", OperationKind::Delete, json!({"_id": "a"}), None).await;
        log.fail_next_reads(3).await;
        log.append("blog.posts", OperationKind::Delete, json!({"_id": "b"}), None).await;

        let seen = recorder.clone();
        run_until(&mut tailer, move || seen.seen.try_lock().map(|s| s.len() >= 2).unwrap_or(false)).await;

        let seen = recorder.seen.lock().await;
        assert_eq!(
            *seen,
            vec![
                FeedAction::Delete { id: json!("a") },
                FeedAction::Delete { id: json!("b") }
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_override_and_removal() {
        let log = MemoryOplog::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let mut tailer = Tailer::new(Arc::new(log), &settings());
        tailer.add_handler("blog.posts", OperationKind::Delete, first.clone());
        tailer.add_handler("blog.posts", OperationKind::Delete, second.clone());

        let event = ChangeEvent::decode(
            json!({"ts": 1, "ns": "blog.posts", "op": "d", "o": {"_id": "a"}})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .unwrap();
        tailer.dispatch(event.clone()).await.unwrap();
        assert!(first.seen.lock().await.is_empty());
        assert_eq!(second.seen.lock().await.len(), 1);

        assert!(tailer.remove_handler("blog.posts", OperationKind::Delete).is_some());
        tailer.dispatch(event).await.unwrap();
        assert_eq!(second.seen.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_resume() {
        let log = MemoryOplog::new();
        log.append("blog.posts", OperationKind::Delete, json!({"_id": "a"}), None).await;
        let checkpoint = Arc::new(MemoryCheckpoint::new());
        checkpoint.save(Position(0)).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let mut tailer =
            Tailer::new(Arc::new(log.clone()), &settings()).with_checkpoint(checkpoint.clone());
        tailer.add_handler("blog.posts", OperationKind::Delete, recorder.clone());

        let seen = recorder.clone();
        run_until(&mut tailer, move || seen.seen.try_lock().map(|s| !s.is_empty()).unwrap_or(false)).await;
        assert_eq!(checkpoint.load().await.unwrap(), Some(Position(1)));
    }

    #[test]
    fn test_cursor_filter() {
        let mut tailer = Tailer::new(Arc::new(MemoryOplog::new()), &settings());
        tailer.token = Some(Position(9));
        tailer.follow("blog.posts");
        assert_eq!(
            serde_json::Value::Object(tailer.cursor_filter().unwrap()),
            json!({"ts": {"$gt": 9}, "ns": {"$in": ["blog.posts"]}})
        );
    }
}
