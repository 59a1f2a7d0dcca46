//! Query builder for docmap
//!
//! A [`Query`] accumulates a predicate, projection, sort keys and paging
//! for one document type, then runs against a [`Store`]. Field names are
//! logical and resolved through the schema; names that are not declared
//! fields pass through as raw wire keys in `only` and `sort`.

use crate::eagerload::{self, Eagerload};
use crate::error::{Error, Result};
use crate::schema::{DocumentType, Field, SchemaRegistry, ID_FIELD};
use crate::storage::document::Document;
use crate::storage::{FindOptions, SortOrder, Store, UpdateOptions};
use docspec::{Mutation, Predicate, WireMap};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct EagerloadRequest {
    fields: Vec<String>,
    only: Option<Vec<String>>,
}

/// A lazily executed query over one document type
#[derive(Clone)]
pub struct Query {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn Store>,
    doc_type: Arc<DocumentType>,
    filter: Predicate,
    projection: Option<WireMap>,
    sort: Vec<(String, SortOrder)>,
    skip: usize,
    limit: Option<usize>,
    eagerloads: Vec<EagerloadRequest>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("doc_type", &self.doc_type.name())
            .field("filter", &self.filter)
            .field("projection", &self.projection)
            .field("sort", &self.sort)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .finish()
    }
}

impl Query {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn Store>,
        doc_type: Arc<DocumentType>,
    ) -> Self {
        Self {
            registry,
            store,
            doc_type,
            filter: Predicate::empty(),
            projection: None,
            sort: Vec::new(),
            skip: 0,
            limit: None,
            eagerloads: Vec::new(),
        }
    }

    pub fn doc_type(&self) -> &DocumentType {
        &self.doc_type
    }

    /// Resolve a dotted logical path on this query's type
    pub fn field(&self, path: &str) -> Result<Field> {
        Field::resolve(&self.registry, &self.doc_type, path)
    }

    /// Compiled filter document
    pub fn spec(&self) -> WireMap {
        self.filter.compile()
    }

    // =========================================================================
    // Building
    // =========================================================================

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = std::mem::replace(&mut self.filter, Predicate::empty()).and(predicate);
        self
    }

    /// Equality on a logical field
    pub fn filter_by(self, path: &str, value: impl Into<JsonValue>) -> Result<Self> {
        let predicate = self.field(path)?.eq(value)?;
        Ok(self.filter(predicate))
    }

    pub fn exclude(self, predicate: Predicate) -> Self {
        self.filter(predicate.not())
    }

    pub fn exclude_by(self, path: &str, value: impl Into<JsonValue>) -> Result<Self> {
        let predicate = self.field(path)?.eq(value)?;
        Ok(self.exclude(predicate))
    }

    /// Fetch only these fields; the primary key is always included
    pub fn only(mut self, paths: &[&str]) -> Result<Self> {
        let names: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        let map = eagerload::projection(&self.registry, &self.doc_type, &names)?;
        self.projection.get_or_insert_with(WireMap::new).extend(map);
        Ok(self)
    }

    /// Return `n` elements of a list field (last `n` when negative)
    pub fn slice(mut self, path: &str, n: i64) -> Result<Self> {
        let compiled = self.field(path)?.slice(n)?.compile();
        self.projection.get_or_insert_with(WireMap::new).extend(compiled);
        Ok(self)
    }

    pub fn slice_range(mut self, path: &str, skip: i64, limit: i64) -> Result<Self> {
        let compiled = self.field(path)?.slice_range(skip, limit)?.compile();
        self.projection.get_or_insert_with(WireMap::new).extend(compiled);
        Ok(self)
    }

    /// Add sort keys from a whitespace separated list such as `"-age +name"`
    pub fn sort(mut self, keys: &str) -> Result<Self> {
        for key in keys.split_whitespace() {
            let (order, name) = match key.strip_prefix('-') {
                Some(rest) => (SortOrder::Descending, rest),
                None => (SortOrder::Ascending, key.strip_prefix('+').unwrap_or(key)),
            };
            if name.is_empty() {
                return Err(Error::validation(format!("empty sort key in '{keys}'")));
            }
            let path = match self.field(name) {
                Ok(field) => field.query_path().to_string(),
                Err(Error::UndeclaredField { .. }) => name.to_string(),
                Err(e) => return Err(e),
            };
            self.sort.push((path, order));
        }
        Ok(self)
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Resolve these reference fields on every result with one fetch.
    /// All fields of one call must target the same type.
    pub fn eagerload(mut self, fields: &[&str], only: Option<&[&str]>) -> Result<Self> {
        let request = EagerloadRequest {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            only: only.map(|o| o.iter().map(|s| s.to_string()).collect()),
        };
        // Fail at build time rather than on the first fetch
        self.resolver(&request)?;
        self.eagerloads.push(request);
        Ok(self)
    }

    fn resolver(&self, request: &EagerloadRequest) -> Result<Eagerload> {
        let mut resolver = Eagerload::new(Arc::clone(&self.registry), request.only.clone());
        for field in &request.fields {
            resolver.add_field(&self.doc_type, field)?;
        }
        Ok(resolver)
    }

    fn find_options(&self) -> FindOptions {
        FindOptions {
            projection: self.projection.clone(),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.limit,
        }
    }

    // =========================================================================
    // Reading
    // =========================================================================

    pub async fn all(&self) -> Result<Vec<Document>> {
        self.fetch(self.find_options()).await
    }

    async fn fetch(&self, options: FindOptions) -> Result<Vec<Document>> {
        let namespace = self.doc_type.namespace();
        let spec = self.spec();
        debug!(ns = %namespace, filter = %JsonValue::Object(spec.clone()), "find");
        let records = self.store.find(&namespace, &spec, &options).await?;

        let mut documents = records
            .iter()
            .map(|raw| Document::from_stored(&self.registry, &self.doc_type, raw))
            .collect::<Result<Vec<_>>>()?;

        for request in &self.eagerloads {
            if documents.is_empty() {
                break;
            }
            let mut resolver = self.resolver(request)?;
            resolver.add_documents(documents);
            documents = resolver.flush(self.store.as_ref()).await?;
        }
        Ok(documents)
    }

    /// The first result, if any
    pub async fn one(&self) -> Result<Option<Document>> {
        let mut options = self.find_options();
        options.limit = Some(1);
        Ok(self.fetch(options).await?.into_iter().next())
    }

    /// The first result, or [`Error::DoesNotExist`]
    pub async fn first(&self) -> Result<Document> {
        self.one().await?.ok_or_else(|| Error::DoesNotExist {
            doc_type: self.doc_type.name().to_string(),
        })
    }

    /// The document with this primary key, within the current filter
    /// The document with primary key `id`. An id the key type cannot hold
    /// matches nothing.
    pub async fn with_id(&self, id: &str) -> Result<Option<Document>> {
        match self.field(ID_FIELD)?.lookup([id])? {
            Some(predicate) => self.clone().filter(predicate).one().await,
            None => Ok(None),
        }
    }

    /// Documents with these primary keys, keyed by id
    pub async fn in_bulk(&self, ids: &[&str]) -> Result<HashMap<String, Document>> {
        let Some(predicate) = self.field(ID_FIELD)?.lookup(ids.iter().copied())? else {
            return Ok(HashMap::new());
        };
        let documents = self.clone().filter(predicate).all().await?;
        Ok(documents
            .into_iter()
            .filter_map(|doc| doc.id.clone().map(|id| (id, doc)))
            .collect())
    }

    pub async fn count(&self) -> Result<usize> {
        self.store
            .count(&self.doc_type.namespace(), &self.spec())
            .await
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Apply `mutation` to every match
    pub async fn update(&self, mutation: &Mutation) -> Result<usize> {
        self.write(mutation, UpdateOptions { upsert: false, multi: true }).await
    }

    /// Apply `mutation` to the first match
    pub async fn update_one(&self, mutation: &Mutation) -> Result<usize> {
        self.write(mutation, UpdateOptions { upsert: false, multi: false }).await
    }

    /// Apply `mutation` to the first match, inserting from the filter when
    /// nothing matches
    pub async fn upsert(&self, mutation: &Mutation) -> Result<usize> {
        self.write(mutation, UpdateOptions { upsert: true, multi: false }).await
    }

    async fn write(&self, mutation: &Mutation, options: UpdateOptions) -> Result<usize> {
        if mutation.is_empty() {
            return Err(Error::validation("update has no mutations"));
        }
        let namespace = self.doc_type.namespace();
        self.store
            .update(&namespace, &self.spec(), &mutation.compile(), options)
            .await
            .map_err(rejected)
    }

    /// Remove every match
    pub async fn delete(&self) -> Result<usize> {
        self.store
            .remove(&self.doc_type.namespace(), &self.spec())
            .await
            .map_err(rejected)
    }
}

/// A write the store answered with a failure was rejected, not lost
pub(crate) fn rejected(err: Error) -> Error {
    match err {
        Error::OperationFailure { message } => Error::Operation { message },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDescriptor, FieldType};
    use crate::storage::document::Value;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn registry() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                DocumentType::new("User")
                    .field(FieldDescriptor::string("name").db_field("n"))
                    .field(FieldDescriptor::int("age"))
                    .field(FieldDescriptor::list("followers", FieldType::Int)),
            )
            .unwrap();
        Arc::new(registry)
    }

    async fn setup() -> (Arc<MemoryStore>, Query) {
        let registry = registry();
        let store = Arc::new(MemoryStore::new());
        for (name, age) in [("ann", 31), ("bob", 25), ("cid", 40), ("dee", 25)] {
            store
                .insert(
                    "docmap.user",
                    json!({"n": name, "age": age, "followers": [1, 2, 3]})
                        .as_object()
                        .cloned()
                        .unwrap(),
                )
                .await
                .unwrap();
        }
        let doc_type = registry.get("User").unwrap();
        let query = Query::new(registry, store.clone(), doc_type);
        (store, query)
    }

    fn names(docs: &[Document]) -> Vec<&str> {
        docs.iter()
            .filter_map(|d| d.get("name").and_then(Value::as_str))
            .collect()
    }

    #[tokio::test]
    async fn test_filter_sort_and_page() {
        let (_store, query) = setup().await;
        let age = query.field("age").unwrap();

        let docs = query
            .clone()
            .filter(age.gte(25).unwrap())
            .exclude_by("name", "cid")
            .unwrap()
            .sort("-age +name")
            .unwrap()
            .skip(1)
            .limit(2)
            .all()
            .await
            .unwrap();
        assert_eq!(names(&docs), vec!["bob", "dee"]);
    }

    #[tokio::test]
    async fn test_only_passes_raw_keys_through() {
        let (_store, query) = setup().await;
        let docs = query
            .clone()
            .only(&["name", "legacy"])
            .unwrap()
            .slice("followers", -1)
            .unwrap()
            .filter_by("name", "ann")
            .unwrap()
            .all()
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].id.is_some());
        assert!(docs[0].get("age").is_none());
        assert_eq!(docs[0].get("followers"), Some(&Value::Array(vec![Value::Int(3)])));
    }

    #[tokio::test]
    async fn test_first_one_and_count() {
        let (_store, query) = setup().await;
        let none = query.clone().filter_by("age", 99).unwrap();
        assert!(none.one().await.unwrap().is_none());
        assert!(matches!(none.first().await, Err(Error::DoesNotExist { .. })));

        let young = query.clone().filter_by("age", 25).unwrap();
        assert_eq!(young.count().await.unwrap(), 2);

        let ann = query.clone().filter_by("name", "ann").unwrap().first().await.unwrap();
        let id = ann.id.clone().unwrap();
        assert_eq!(query.with_id(&id).await.unwrap(), Some(ann));

        let bulk = query.in_bulk(&[id.as_str()]).await.unwrap();
        assert_eq!(bulk.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_ids_match_nothing() {
        let (store, query) = setup().await;
        let ann = query.clone().filter_by("name", "ann").unwrap().first().await.unwrap();
        let id = ann.id.clone().unwrap();
        let before = store.finds().await.len();

        assert_eq!(query.with_id("legacy-id").await.unwrap(), None);
        assert!(query.in_bulk(&["legacy-id"]).await.unwrap().is_empty());
        assert_eq!(store.finds().await.len(), before);

        let bulk = query.in_bulk(&["legacy-id", id.as_str()]).await.unwrap();
        assert_eq!(bulk.len(), 1);
        assert!(bulk.contains_key(&id));
    }

    #[tokio::test]
    async fn test_update_upsert_delete() {
        let (_store, query) = setup().await;
        let age = query.field("age").unwrap();

        let young = query.clone().filter_by("age", 25).unwrap();
        assert_eq!(young.update(&age.inc(1).unwrap()).await.unwrap(), 2);
        assert_eq!(query.clone().filter_by("age", 26).unwrap().count().await.unwrap(), 2);

        let eve = query.clone().filter_by("name", "eve").unwrap();
        eve.upsert(&age.set(20).unwrap()).await.unwrap();
        let created = eve.first().await.unwrap();
        assert_eq!(created.get("age"), Some(&Value::Int(20)));

        assert_eq!(eve.delete().await.unwrap(), 1);
        assert_eq!(query.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_undeclared_field_is_an_error_in_filters() {
        let (_store, query) = setup().await;
        assert!(matches!(
            query.clone().filter_by("nope", 1),
            Err(Error::UndeclaredField { .. })
        ));
        assert!(matches!(
            query.update(&Mutation::default()).await,
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_rejected_maps_operation_failures() {
        let err = rejected(Error::OperationFailure { message: "E11000".into() });
        assert!(matches!(err, Error::Operation { message } if message == "E11000"));
        assert!(rejected(Error::Reconnect { message: "x".into() }).is_transient());
    }
}
