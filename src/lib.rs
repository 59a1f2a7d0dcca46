//! docmap - typed document mapping over a schemaless document store
//!
//! Maps typed documents to stored records, builds filters and updates with
//! the `docspec` expression algebra, batches reference loading, and keeps a
//! full-text index in step with the store by tailing its replication log.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Mapper                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │   Field     │  │   Query     │  │   Schema Registry       │  │
//! │  │   Handles   │  │   Builder   │  │   (Document Types)      │  │
//! │  └──────┬──────┘  └──────┬──────┘  └───────────┬─────────────┘  │
//! │         │                │                     │                │
//! │         ▼                ▼                     ▼                │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │        docspec: Predicate / Mutation -> wire maps           ││
//! │  └──────────────────────────┬──────────────────────────────────┘│
//! │                             │                                   │
//! │                             ▼                                   │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │   Store (find / update / remove)  ◀──  Eagerload (1 fetch)  ││
//! │  └──────────────────────────┬──────────────────────────────────┘│
//! │                             │ replication log                   │
//! │                             ▼                                   │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │   Tailer ──▶ IndexSynchronizer ──retry──▶ SearchBackend     ││
//! │  └─────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod eagerload;
pub mod error;
pub mod feed;
pub mod query;
pub mod schema;
pub mod search;
pub mod storage;
pub mod validation;

pub use config::Settings;
pub use eagerload::Eagerload;
pub use error::{Error, Result};
pub use query::Query;
pub use schema::{DocumentType, Field, FieldDescriptor, FieldType, SchemaRegistry};
pub use storage::document::{Document, Value};
pub use storage::{MemoryStore, Store};

pub use docspec::{Expression, Mutation, Predicate, WireMap};

use schema::ID_KEY;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use storage::UpdateOptions;
use tracing::debug;

/// Entry point: a schema registry bound to a store
#[derive(Clone)]
pub struct Mapper {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Mapper {
    pub fn new(registry: SchemaRegistry, store: Arc<dyn Store>) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Start a query over every document of `type_name`
    pub fn query(&self, type_name: &str) -> Result<Query> {
        let doc_type = self.registry.get(type_name)?;
        Ok(Query::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            doc_type,
        ))
    }

    /// Field handle for a dotted logical path
    pub fn field(&self, type_name: &str, path: &str) -> Result<Field> {
        self.registry.field(type_name, path)
    }

    /// Validate and write `document`. The first save inserts and records the
    /// store-assigned primary key; later saves replace the stored record.
    pub async fn save(&self, document: &mut Document) -> Result<String> {
        let doc_type = self.registry.get(document.doc_type())?;
        if doc_type.is_embedded() {
            return Err(Error::validation(format!(
                "'{}' is embedded and cannot be saved on its own",
                doc_type.name()
            )));
        }
        document.validate(&self.registry)?;
        let record = document.to_stored(&self.registry)?;
        let namespace = doc_type.namespace();

        match document.id.clone() {
            None => {
                let id = self
                    .store
                    .insert(&namespace, record)
                    .await
                    .map_err(query::rejected)?;
                debug!(ns = %namespace, id = %id, "inserted");
                document.id = Some(id.clone());
                Ok(id)
            }
            Some(id) => {
                let options = UpdateOptions {
                    upsert: true,
                    multi: false,
                };
                self.store
                    .update(&namespace, &id_filter(&id), &record, options)
                    .await
                    .map_err(query::rejected)?;
                debug!(ns = %namespace, id = %id, "replaced");
                Ok(id)
            }
        }
    }

    /// Remove a saved document
    pub async fn delete(&self, document: &Document) -> Result<()> {
        let doc_type = self.registry.get(document.doc_type())?;
        let id = document
            .id()
            .ok_or_else(|| Error::validation("cannot delete a document that was never saved"))?;
        self.store
            .remove(&doc_type.namespace(), &id_filter(id))
            .await
            .map_err(query::rejected)?;
        Ok(())
    }

    /// Fetch the stored state of a saved document
    pub async fn reload(&self, document: &Document) -> Result<Document> {
        let id = document
            .id()
            .ok_or_else(|| Error::validation("cannot reload a document that was never saved"))?;
        self.query(document.doc_type())?
            .with_id(id)
            .await?
            .ok_or_else(|| Error::DoesNotExist {
                doc_type: document.doc_type().to_string(),
            })
    }
}

fn id_filter(id: &str) -> WireMap {
    let mut filter = WireMap::new();
    filter.insert(ID_KEY.to_string(), JsonValue::String(id.to_string()));
    filter
}
