//! Index synchronizer: applies change-feed events to a search index

use super::{encode_id, IndexDefinition, SearchBackend};
use crate::config::RetrySettings;
use crate::error::{Error, Result};
use crate::feed::{FeedAction, FeedHandler, StopSignal};
use crate::schema::{Field, ID_FIELD};
use crate::storage::document::Document;
use crate::storage::update::is_replacement;
use crate::Mapper;
use async_trait::async_trait;
use docspec::WireMap;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PROGRESS_EVERY: usize = 10_000;
const REINDEX_BATCH: usize = 1_000;

/// Keeps one index in step with its source collection
pub struct IndexSynchronizer {
    index: Arc<IndexDefinition>,
    mapper: Mapper,
    backend: Arc<dyn SearchBackend>,
    retry: RetrySettings,
    stop: StopSignal,
    batch_size: usize,
}

impl IndexSynchronizer {
    pub fn new(
        index: Arc<IndexDefinition>,
        mapper: Mapper,
        backend: Arc<dyn SearchBackend>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            index,
            mapper,
            backend,
            retry,
            stop: StopSignal::never(),
            batch_size: REINDEX_BATCH,
        }
    }

    /// Documents fetched per page while reindexing
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Abandon retry sleeps once `stop` fires
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn index(&self) -> &IndexDefinition {
        &self.index
    }

    /// Index a freshly inserted record
    pub async fn insert(&self, raw: &JsonValue) -> Result<()> {
        let record = raw
            .as_object()
            .ok_or_else(|| Error::validation("inserted record is not a document"))?;
        let document =
            Document::from_stored(self.mapper.registry(), self.index.doc_type(), record)?;
        info!(doc_type = self.index.doc_type().name(), id = ?document.id(), "indexing");
        self.index_document(&document, false).await
    }

    /// Re-index after an update when it may have changed an indexed term
    pub async fn update(&self, id: &str, raw: &WireMap) -> Result<()> {
        let update = raw
            .get("o")
            .and_then(JsonValue::as_object)
            .cloned()
            .unwrap_or_default();
        if !self.touches_terms(&update)? {
            debug!(doc_type = self.index.doc_type().name(), id, "update leaves indexed terms alone");
            return Ok(());
        }

        let names: Vec<&str> = self.index.terms().iter().map(|t| t.name()).collect();
        let current = self
            .mapper
            .query(self.index.doc_type().name())?
            .filter(self.index.filter().clone())
            .only(&names)?
            .with_id(id)
            .await?;
        match current {
            Some(document) => {
                info!(doc_type = self.index.doc_type().name(), id, "updating");
                self.index_document(&document, false).await
            }
            None => self.delete(id).await,
        }
    }

    /// Remove the entry for `id`; an entry already gone is fine
    pub async fn delete(&self, id: &str) -> Result<()> {
        info!(doc_type = self.index.doc_type().name(), id, "deleting");
        let namespace = self.index.index_namespace();
        let encoded = encode_id(id);
        let doc_type = self.index.doc_type().name();
        self.execute("delete", || self.backend.delete(&namespace, doc_type, &encoded))
            .await
    }

    /// Whether `$set`/`$unset` keys, or a whole-document replacement, reach
    /// any term's storage path
    fn touches_terms(&self, update: &WireMap) -> Result<bool> {
        if is_replacement(update) {
            return Ok(!update.is_empty());
        }
        let keys: Vec<&String> = ["$set", "$unset"]
            .iter()
            .filter_map(|op| update.get(*op).and_then(JsonValue::as_object))
            .flat_map(|fields| fields.keys())
            .collect();
        if keys.is_empty() {
            return Ok(false);
        }
        for term in self.index.terms().iter().filter(|t| t.is_indexed()) {
            let field = Field::resolve(self.mapper.registry(), self.index.doc_type(), term.name())?;
            let path = field.query_path();
            let hit = keys.iter().any(|key| {
                key.as_str() == path
                    || key.starts_with(&format!("{path}."))
                    || path.starts_with(&format!("{key}."))
            });
            if hit {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Extract the indexed terms of `document` and write them
    pub async fn index_document(&self, document: &Document, bulk: bool) -> Result<()> {
        let id = document
            .id()
            .ok_or_else(|| Error::validation("cannot index a document without a primary key"))?;

        let mut fields = WireMap::new();
        for term in self.index.terms().iter().filter(|t| t.is_indexed()) {
            let value = if term.name() == ID_FIELD {
                JsonValue::String(id.to_string())
            } else {
                match document.get(term.name()) {
                    Some(value) => value.to_stored(self.mapper.registry())?,
                    None => continue,
                }
            };
            if value.is_null() {
                continue;
            }
            fields.insert(term.indexed_as().to_string(), term.apply(value));
        }

        let namespace = self.index.index_namespace();
        let encoded = encode_id(id);
        let doc_type = self.index.doc_type().name();
        self.execute("index", || {
            self.backend
                .index(&namespace, doc_type, &encoded, fields.clone(), bulk)
        })
        .await
    }

    /// Run one index write with bounded retry
    async fn execute<F, Fut>(&self, what: &str, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        let attempts = self.retry.attempts.max(1);
        let mut stop = self.stop.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => {
                    debug!(op = what, "index entry not found, nothing to do");
                    return Ok(());
                }
                Err(e) => e,
            };
            warn!(op = what, attempt, error = %err, "index write failed");
            if attempt >= attempts {
                return Err(err);
            }
            if stop.sleep(self.retry.delay()).await {
                return Err(err);
            }
        }
    }

    /// Drop, recreate and fully repopulate the index. Returns the number of
    /// documents indexed.
    pub async fn reindex_all(&self) -> Result<usize> {
        let namespace = self.index.index_namespace();
        match self.backend.delete_index(&namespace).await {
            Ok(()) | Err(Error::IndexMissing { .. }) => {}
            Err(e) => return Err(e),
        }
        self.backend.create_index(&namespace).await?;

        let names: Vec<&str> = self.index.terms().iter().map(|t| t.name()).collect();
        let query = self
            .mapper
            .query(self.index.doc_type().name())?
            .filter(self.index.filter().clone())
            .only(&names)?
            .sort(ID_FIELD)?;
        let total = query.count().await?;
        info!(index = %namespace, total, "reindexing");

        let mut done = 0;
        loop {
            let page = query
                .clone()
                .skip(done)
                .limit(self.batch_size)
                .all()
                .await?;
            let fetched = page.len();
            for document in &page {
                self.index_document(document, true).await?;
                done += 1;
                if done % PROGRESS_EVERY == 0 {
                    info!(index = %namespace, done, total, "reindex progress");
                }
            }
            if fetched < self.batch_size {
                break;
            }
        }
        self.backend.flush_bulk().await?;
        Ok(done)
    }
}

fn id_string(id: &JsonValue) -> String {
    match id {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl FeedHandler for IndexSynchronizer {
    async fn handle(&self, action: FeedAction) -> Result<()> {
        match action {
            FeedAction::Insert(record) => self.insert(&record).await,
            FeedAction::Update { id, raw } => self.update(&id_string(&id), &raw).await,
            FeedAction::Delete { id } => self.delete(&id_string(&id)).await,
            _ => Ok(()),
        }
    }
}

/// Rebuild every index, or only those whose index namespace is in `only`
pub async fn reindex(synchronizers: &[Arc<IndexSynchronizer>], only: Option<&[&str]>) -> Result<()> {
    info!("reindexing");
    for synchronizer in synchronizers {
        let namespace = synchronizer.index().index_namespace();
        if let Some(only) = only {
            if !only.contains(&namespace.as_str()) {
                continue;
            }
        }
        let count = synchronizer.reindex_all().await?;
        info!(index = %namespace, count, "reindexed");
    }
    info!("reindex done");
    Ok(())
}
