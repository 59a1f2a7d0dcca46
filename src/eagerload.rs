//! Batched reference resolution
//!
//! Collects the raw ids held by reference fields across a batch of
//! documents, fetches every target with a single query and patches each
//! slot that still holds the raw id.
//!
//! ```text
//! posts[0].author   = "A"   ─┐
//! posts[1].editors  = ["A", "B"]  ├──▶ find {_id: {$in: [A, B]}} ──▶ patch slots
//! posts[2].comments[0].author = "B" ─┘
//! ```

use crate::error::{Error, Result};
use crate::schema::{DocumentType, Field, FieldType, SchemaRegistry, ID_FIELD};
use crate::storage::document::{Document, Fields, Value};
use crate::storage::{FindOptions, Store};
use docspec::WireMap;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// One step from a document root to a slot
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
}

/// A slot waiting for a target: owning document index plus path to the value
type Slot = (usize, Vec<Step>);

/// Resolver for one batch. Build, feed documents, then [`Eagerload::flush`]
/// once.
#[derive(Debug)]
pub struct Eagerload {
    registry: Arc<SchemaRegistry>,
    only: Option<Vec<String>>,
    target: Option<Arc<DocumentType>>,
    fields: Vec<Vec<String>>,
    documents: Vec<Document>,
    slots: BTreeMap<String, Vec<Slot>>,
}

impl Eagerload {
    pub fn new(registry: Arc<SchemaRegistry>, only: Option<Vec<String>>) -> Self {
        Self {
            registry,
            only,
            target: None,
            fields: Vec::new(),
            documents: Vec::new(),
            slots: BTreeMap::new(),
        }
    }

    /// Type every registered field points at
    pub fn target(&self) -> Option<&DocumentType> {
        self.target.as_deref()
    }

    /// Register a reference field, or list/map of references, reached by a
    /// dotted path of logical names from `doc_type`
    pub fn add_field(&mut self, doc_type: &DocumentType, path: &str) -> Result<&mut Self> {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        let mut owner = Arc::new(doc_type.clone());

        for (i, segment) in segments.iter().enumerate() {
            let descriptor = owner.lookup(segment).cloned().ok_or_else(|| {
                if i == 0 {
                    Error::UndeclaredField {
                        doc_type: owner.name().to_string(),
                        name: segment.clone(),
                    }
                } else {
                    Error::UnresolvableField {
                        path: path.to_string(),
                        segment: segment.clone(),
                    }
                }
            })?;

            if i + 1 < segments.len() {
                owner = match descriptor.field_type.element() {
                    FieldType::Embedded(name) => self.registry.get(name)?,
                    _ => {
                        return Err(Error::UnresolvableField {
                            path: path.to_string(),
                            segment: segment.clone(),
                        })
                    }
                };
                continue;
            }

            let element = match &descriptor.field_type {
                FieldType::Map(inner) => &**inner,
                other => other.element(),
            };
            let target = match element.reference_target() {
                Some(target) => self.registry.reference_target(&owner, target)?,
                None => {
                    return Err(Error::validation(format!(
                        "'{path}' is not a reference field and cannot be eager-loaded"
                    )))
                }
            };
            if let Some(expected) = &self.target {
                if expected.name() != target.name() {
                    return Err(Error::EagerloadConsistency {
                        expected: expected.name().to_string(),
                        actual: target.name().to_string(),
                    });
                }
            } else {
                self.target = Some(target);
            }
        }

        self.fields.push(segments);
        Ok(self)
    }

    /// Take a document into the batch and record its unresolved slots
    pub fn add_document(&mut self, document: Document) -> &mut Self {
        let index = self.documents.len();
        for path in &self.fields {
            scan(&document.fields, path, Vec::new(), &mut |id, steps| {
                self.slots.entry(id).or_default().push((index, steps));
            });
        }
        self.documents.push(document);
        self
    }

    pub fn add_documents(&mut self, documents: impl IntoIterator<Item = Document>) -> &mut Self {
        for document in documents {
            self.add_document(document);
        }
        self
    }

    /// Distinct ids waiting to be resolved
    pub fn pending_ids(&self) -> BTreeSet<&str> {
        self.slots.keys().map(String::as_str).collect()
    }

    /// Fetch every target in one query, patch the batch and hand it back
    pub async fn flush(mut self, store: &dyn Store) -> Result<Vec<Document>> {
        let target = match (&self.target, self.slots.is_empty()) {
            (Some(target), false) => Arc::clone(target),
            _ => return Ok(self.documents),
        };

        let id_field = Field::resolve(&self.registry, &target, ID_FIELD)?;
        let ids = self.slots.keys().cloned().map(JsonValue::String);
        let Some(filter) = id_field.lookup(ids)? else {
            debug!(target = target.name(), "no well-formed ids to eager-load");
            return Ok(self.documents);
        };

        let mut options = FindOptions::default();
        if let Some(only) = &self.only {
            options.projection = Some(projection(&self.registry, &target, only)?);
        }

        let records = store
            .find(&target.namespace(), &filter.compile(), &options)
            .await?;
        debug!(
            target = target.name(),
            requested = self.slots.len(),
            fetched = records.len(),
            "eager-loaded references"
        );

        for record in &records {
            let resolved = Document::from_stored(&self.registry, &target, record)?;
            let Some(id) = resolved.id.clone() else {
                continue;
            };
            let Some(slots) = self.slots.remove(&id) else {
                continue;
            };
            for (index, steps) in slots {
                if let Some(document) = self.documents.get_mut(index) {
                    patch(&mut document.fields, &steps, &id, &resolved);
                }
            }
        }
        Ok(self.documents)
    }
}

/// `{path: 1}` projection for logical names, raw keys passed through
pub(crate) fn projection(
    registry: &SchemaRegistry,
    doc_type: &DocumentType,
    names: &[String],
) -> Result<WireMap> {
    let mut map = WireMap::new();
    for name in names {
        let path = match Field::resolve(registry, doc_type, name) {
            Ok(field) => field.query_path().to_string(),
            Err(Error::UndeclaredField { .. }) => name.clone(),
            Err(e) => return Err(e),
        };
        map.insert(path, JsonValue::from(1));
    }
    Ok(map)
}

fn scan(fields: &Fields, path: &[String], prefix: Vec<Step>, record: &mut impl FnMut(String, Vec<Step>)) {
    let Some((segment, rest)) = path.split_first() else {
        return;
    };
    let Some(value) = fields.get(segment) else {
        return;
    };
    let mut here = prefix;
    here.push(Step::Key(segment.clone()));

    if !rest.is_empty() {
        match value {
            Value::Document(inner) => scan(&inner.fields, rest, here, record),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if let Value::Document(inner) = item {
                        let mut steps = here.clone();
                        steps.push(Step::Index(i));
                        scan(&inner.fields, rest, steps, record);
                    }
                }
            }
            _ => {}
        }
        return;
    }

    match value {
        Value::String(id) if !id.is_empty() => record(id.clone(), here),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if let Value::String(id) = item {
                    let mut steps = here.clone();
                    steps.push(Step::Index(i));
                    record(id.clone(), steps);
                }
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                if let Value::String(id) = item {
                    let mut steps = here.clone();
                    steps.push(Step::Key(key.clone()));
                    record(id.clone(), steps);
                }
            }
        }
        _ => {}
    }
}

/// Overwrite the slot if it still holds `id`; a slot whose shape changed is
/// left alone
fn patch(fields: &mut Fields, steps: &[Step], id: &str, resolved: &Document) {
    let Some((Step::Key(first), rest)) = steps.split_first() else {
        return;
    };
    let Some(mut slot) = fields.get_mut(first) else {
        return;
    };
    for step in rest {
        slot = match (step, slot) {
            (Step::Index(i), Value::Array(items)) => match items.get_mut(*i) {
                Some(item) => item,
                None => return,
            },
            (Step::Key(key), Value::Object(map)) => match map.get_mut(key) {
                Some(item) => item,
                None => return,
            },
            (Step::Key(key), Value::Document(doc)) => match doc.fields.get_mut(key) {
                Some(item) => item,
                None => return,
            },
            _ => return,
        };
    }
    if slot.as_str() == Some(id) {
        *slot = Value::Document(Box::new(resolved.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDescriptor;
    use crate::storage::MemoryStore;
    use serde_json::json;

    const A: &str = "aaaaaaaaaaaaaaaaaaaaaaaa";
    const B: &str = "bbbbbbbbbbbbbbbbbbbbbbbb";

    fn registry() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry
            .register(DocumentType::new("User").field(FieldDescriptor::string("name")))
            .unwrap();
        registry
            .register(DocumentType::new("Tag").field(FieldDescriptor::string("label")))
            .unwrap();
        registry
            .register(
                DocumentType::embedded("Comment")
                    .field(FieldDescriptor::string("body"))
                    .field(FieldDescriptor::reference("author", "User")),
            )
            .unwrap();
        registry
            .register(
                DocumentType::new("Post")
                    .field(FieldDescriptor::reference("author", "User"))
                    .field(FieldDescriptor::list("editors", FieldType::reference("User")))
                    .field(FieldDescriptor::list("tags", FieldType::reference("Tag")))
                    .field(FieldDescriptor::list("comments", FieldType::Embedded("Comment".into()))),
            )
            .unwrap();
        Arc::new(registry)
    }

    async fn store_with_users() -> MemoryStore {
        let store = MemoryStore::new();
        for (id, name) in [(A, "ann"), (B, "bob")] {
            store
                .insert("docmap.user", json!({"_id": id, "name": name}).as_object().cloned().unwrap())
                .await
                .unwrap();
        }
        store
    }

    fn post(registry: &SchemaRegistry, raw: JsonValue) -> Document {
        let post = registry.get("Post").unwrap();
        Document::from_stored(registry, &post, raw.as_object().unwrap()).unwrap()
    }

    #[test]
    fn test_fields_must_share_a_target() {
        let registry = registry();
        let post = registry.get("Post").unwrap();
        let mut eagerload = Eagerload::new(registry.clone(), None);
        eagerload.add_field(&post, "author").unwrap();
        eagerload.add_field(&post, "editors").unwrap();
        let err = eagerload.add_field(&post, "tags").unwrap_err();
        assert!(matches!(err, Error::EagerloadConsistency { .. }));
        assert_eq!(eagerload.target().map(|t| t.name()), Some("User"));
    }

    #[test]
    fn test_rejects_non_reference_fields() {
        let registry = registry();
        let post = registry.get("Post").unwrap();
        let mut eagerload = Eagerload::new(registry.clone(), None);
        assert!(matches!(
            eagerload.add_field(&post, "comments.body"),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            eagerload.add_field(&post, "comments.nope"),
            Err(Error::UnresolvableField { .. })
        ));
    }

    #[tokio::test]
    async fn test_scalar_and_list_slots_share_one_fetch() {
        let registry = registry();
        let store = store_with_users().await;
        let post_type = registry.get("Post").unwrap();

        let mut eagerload = Eagerload::new(registry.clone(), None);
        eagerload.add_field(&post_type, "author").unwrap();
        eagerload.add_field(&post_type, "editors").unwrap();
        eagerload.add_documents(vec![
            post(&registry, json!({"author": A, "editors": [B, A]})),
            post(&registry, json!({"author": null, "editors": []})),
            post(&registry, json!({"author": "cccccccccccccccccccccccc"})),
        ]);
        assert_eq!(eagerload.pending_ids().len(), 3);

        let posts = eagerload.flush(&store).await.unwrap();
        assert_eq!(store.finds().await.len(), 1);

        let author = posts[0].get("author").and_then(Value::as_document).unwrap();
        assert_eq!(author.get("name"), Some(&Value::from("ann")));
        let editors = posts[0].get("editors").and_then(Value::as_array).unwrap();
        assert_eq!(editors[0].as_document().and_then(|d| d.id()), Some(B));
        assert_eq!(editors[1].as_document().and_then(|d| d.id()), Some(A));

        // Unknown target stays raw
        assert_eq!(posts[2].get("author"), Some(&Value::from("cccccccccccccccccccccccc")));
    }

    #[tokio::test]
    async fn test_nested_list_of_embedded_documents() {
        let registry = registry();
        let store = store_with_users().await;
        let post_type = registry.get("Post").unwrap();

        let mut eagerload = Eagerload::new(registry.clone(), Some(vec!["name".to_string()]));
        eagerload.add_field(&post_type, "comments.author").unwrap();
        eagerload.add_document(post(
            &registry,
            json!({"comments": [{"body": "hi", "author": B}, {"body": "anon"}]}),
        ));

        let posts = eagerload.flush(&store).await.unwrap();
        let comments = posts[0].get("comments").and_then(Value::as_array).unwrap();
        let first = comments[0].as_document().unwrap();
        let author = first.get("author").and_then(Value::as_document).unwrap();
        assert_eq!(author.id(), Some(B));
        assert!(comments[1].as_document().unwrap().get("author").is_none());

        let (_, filter) = &store.finds().await[0];
        assert_eq!(JsonValue::Object(filter.clone()), json!({"_id": B}));
    }

    #[tokio::test]
    async fn test_malformed_ids_stay_raw() {
        let registry = registry();
        let store = store_with_users().await;
        let post_type = registry.get("Post").unwrap();

        let mut eagerload = Eagerload::new(registry.clone(), None);
        eagerload.add_field(&post_type, "author").unwrap();
        eagerload.add_documents(vec![
            post(&registry, json!({"author": A})),
            post(&registry, json!({"author": "legacy-id"})),
        ]);

        let posts = eagerload.flush(&store).await.unwrap();
        let author = posts[0].get("author").and_then(Value::as_document).unwrap();
        assert_eq!(author.id(), Some(A));
        assert_eq!(posts[1].get("author"), Some(&Value::from("legacy-id")));

        let (_, filter) = &store.finds().await[0];
        assert_eq!(JsonValue::Object(filter.clone()), json!({"_id": A}));
    }

    #[tokio::test]
    async fn test_only_malformed_ids_skip_the_fetch() {
        let registry = registry();
        let store = store_with_users().await;
        let post_type = registry.get("Post").unwrap();

        let mut eagerload = Eagerload::new(registry.clone(), None);
        eagerload.add_field(&post_type, "editors").unwrap();
        eagerload.add_document(post(&registry, json!({"editors": ["old-1", "old-2"]})));

        let posts = eagerload.flush(&store).await.unwrap();
        let editors = posts[0].get("editors").and_then(Value::as_array).unwrap();
        assert_eq!(editors[0], Value::from("old-1"));
        assert!(store.finds().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let registry = registry();
        let store = MemoryStore::new();
        let post_type = registry.get("Post").unwrap();

        let mut eagerload = Eagerload::new(registry.clone(), None);
        eagerload.add_field(&post_type, "author").unwrap();
        eagerload.add_document(post(&registry, json!({"title": "x"})));
        let posts = eagerload.flush(&store).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert!(store.finds().await.is_empty());
    }
}
