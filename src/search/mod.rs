//! Full-text search index
//!
//! An [`IndexDefinition`] names the terms extracted from one document type
//! into an external index. The [`IndexSynchronizer`] keeps that index in
//! step with the store by handling change-feed events, and [`search`] runs
//! query strings against one or more indexes and maps hits back to
//! documents.
//!
//! ```text
//!  store ──oplog──▶ Tailer ──FeedAction──▶ IndexSynchronizer ──retry──▶ SearchBackend
//!                                               │
//!                                               └── re-fetch projection (Query)
//! ```

mod indexer;
mod memory;
mod watch;

pub use indexer::{reindex, IndexSynchronizer};
pub use memory::MemorySearch;
pub use watch::watch;

use crate::error::{Error, Result};
use crate::schema::DocumentType;
use crate::storage::document::Document;
use crate::Mapper;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use docspec::{Predicate, WireMap};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Value coercion applied to a term before it is indexed
pub type Coerce = Arc<dyn Fn(JsonValue) -> JsonValue + Send + Sync>;

/// One field extracted into the index
#[derive(Clone)]
pub struct Term {
    name: String,
    index_name: String,
    indexed: bool,
    boost: f64,
    coerce: Option<Coerce>,
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Term")
            .field("name", &self.name)
            .field("index_name", &self.index_name)
            .field("indexed", &self.indexed)
            .field("boost", &self.boost)
            .field("coerce", &self.coerce.is_some())
            .finish()
    }
}

impl Term {
    /// A term read from the logical field `name`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            index_name: name.clone(),
            name,
            indexed: true,
            boost: 1.0,
            coerce: None,
        }
    }

    /// Store under a different key in the index
    pub fn index_name(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = index_name.into();
        self
    }

    /// Keep the term in the projection but out of the index
    pub fn not_indexed(mut self) -> Self {
        self.indexed = false;
        self
    }

    pub fn boost(mut self, boost: f64) -> Self {
        self.boost = boost;
        self
    }

    pub fn coerce(mut self, f: impl Fn(JsonValue) -> JsonValue + Send + Sync + 'static) -> Self {
        self.coerce = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn indexed_as(&self) -> &str {
        &self.index_name
    }

    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    pub fn weight(&self) -> f64 {
        self.boost
    }

    fn apply(&self, value: JsonValue) -> JsonValue {
        match &self.coerce {
            Some(coerce) => coerce(value),
            None => value,
        }
    }
}

/// The terms of one document type kept in one index
#[derive(Debug, Clone)]
pub struct IndexDefinition {
    host: String,
    doc_type: Arc<DocumentType>,
    terms: Vec<Term>,
    base_filter: Predicate,
}

impl IndexDefinition {
    /// `host` identifies the store whose replication log feeds this index
    pub fn new(host: impl Into<String>, doc_type: Arc<DocumentType>) -> Self {
        Self {
            host: host.into(),
            doc_type,
            terms: Vec::new(),
            base_filter: Predicate::empty(),
        }
    }

    pub fn term(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }

    /// Only documents matching `filter` are indexed
    pub fn base_filter(mut self, filter: Predicate) -> Self {
        self.base_filter = filter;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn doc_type(&self) -> &Arc<DocumentType> {
        &self.doc_type
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn filter(&self) -> &Predicate {
        &self.base_filter
    }

    /// Name of the index: `database-collection`
    pub fn index_namespace(&self) -> String {
        format!(
            "{}-{}",
            self.doc_type.database_name(),
            self.doc_type.collection_name()
        )
    }

    /// Namespace of the source collection in the replication log
    pub fn feed_namespace(&self) -> String {
        self.doc_type.namespace()
    }
}

/// Encode a primary key for the index's id alphabet
pub fn encode_id(id: &str) -> String {
    STANDARD.encode(id.as_bytes())
}

pub fn decode_id(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::Index {
            message: format!("undecodable index id '{encoded}': {e}"),
        })?;
    String::from_utf8(bytes).map_err(|e| Error::Index {
        message: format!("index id '{encoded}' is not utf-8: {e}"),
    })
}

// =============================================================================
// Backend seam
// =============================================================================

/// A query against one or more indexes
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub namespaces: Vec<String>,
    /// Exact term filters
    pub filters: WireMap,
    /// Score multiplier per index key; absent keys weigh 1
    pub boosts: BTreeMap<String, f64>,
    pub skip: usize,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub namespace: String,
    /// Encoded document id, see [`encode_id`]
    pub id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResponse {
    pub total: usize,
    pub took: Duration,
    pub max_score: f64,
    pub hits: Vec<SearchHit>,
}

/// An external full-text index service.
///
/// A missing document is reported as [`Error::IndexNotFound`], a missing
/// index as [`Error::IndexMissing`] and a failed search phase as
/// [`Error::Index`].
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Write or replace one entry. `bulk` writes may be buffered until
    /// [`SearchBackend::flush_bulk`].
    async fn index(
        &self,
        namespace: &str,
        doc_type: &str,
        id: &str,
        fields: WireMap,
        bulk: bool,
    ) -> Result<()>;

    async fn delete(&self, namespace: &str, doc_type: &str, id: &str) -> Result<()>;

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse>;

    async fn create_index(&self, namespace: &str) -> Result<()>;

    async fn delete_index(&self, namespace: &str) -> Result<()>;

    async fn flush_bulk(&self) -> Result<()>;
}

// =============================================================================
// Searching
// =============================================================================

/// Where a hit ranked on the page and how well it scored
#[derive(Debug, Clone, PartialEq)]
pub struct HitMeta {
    /// 1-based position across all pages
    pub rank: usize,
    pub score: f64,
    /// Score relative to the best hit, 0 to 100
    pub relevance: u32,
}

/// One page of search results
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub query: String,
    pub total: usize,
    pub elapsed: Duration,
    pub max_score: f64,
    pub hits: Vec<(Document, HitMeta)>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// More hits exist beyond this page
    pub fn has_more(&self) -> bool {
        self.hits.len() < self.total
    }
}

const QUERY_SYNTAX: [&str; 9] = ["?", "*", "~", "OR", "AND", "+", "NOT", "-", ":"];

/// Normalize user input: drop a trailing `:`, and turn plain words into a
/// prefix match
pub fn query_string(input: &str) -> String {
    let query = input.strip_suffix(':').unwrap_or(input);
    if QUERY_SYNTAX.iter().any(|op| query.contains(op)) {
        query.to_string()
    } else {
        format!("{query}*")
    }
}

fn relevance(score: f64, max_score: f64) -> u32 {
    if max_score > 0.0 {
        (score / max_score * 100.0) as u32
    } else {
        0
    }
}

/// Term weights that differ from the default, keyed by index key
pub fn boosts(indexes: &[&IndexDefinition]) -> BTreeMap<String, f64> {
    indexes
        .iter()
        .flat_map(|index| index.terms())
        .filter(|term| term.is_indexed() && term.weight() != 1.0)
        .map(|term| (term.indexed_as().to_string(), term.weight()))
        .collect()
}

/// Run `query` against `indexes` and load the hit documents.
///
/// `page` is 1-based. A failed search phase yields an empty result set.
pub async fn search(
    mapper: &Mapper,
    backend: &dyn SearchBackend,
    indexes: &[&IndexDefinition],
    query: &str,
    page: usize,
    limit: usize,
    filters: Option<WireMap>,
) -> Result<ResultSet> {
    let mut result = ResultSet {
        query: query.to_string(),
        ..ResultSet::default()
    };
    let types: HashMap<String, &Arc<DocumentType>> = indexes
        .iter()
        .map(|index| (index.index_namespace(), index.doc_type()))
        .collect();

    let skip = page.saturating_sub(1) * limit;
    let request = SearchRequest {
        query: query_string(query),
        namespaces: indexes.iter().map(|index| index.index_namespace()).collect(),
        filters: filters.unwrap_or_default(),
        boosts: boosts(indexes),
        skip,
        size: limit,
    };

    let response = match backend.search(&request).await {
        Ok(response) => response,
        Err(Error::Index { message }) => {
            warn!(query = %request.query, error = %message, "search phase failed");
            return Ok(result);
        }
        Err(e) => return Err(e),
    };
    debug!(query = %request.query, total = response.total, "search");

    result.total = response.total;
    result.elapsed = response.took;
    result.max_score = response.max_score;

    for (i, hit) in response.hits.iter().enumerate() {
        let Some(doc_type) = types.get(&hit.namespace) else {
            continue;
        };
        let id = decode_id(&hit.id)?;
        let found = mapper.query(doc_type.name())?.with_id(&id).await?;
        if let Some(document) = found {
            result.hits.push((
                document,
                HitMeta {
                    rank: skip + i + 1,
                    score: hit.score,
                    relevance: relevance(hit.score, response.max_score),
                },
            ));
        }
    }
    Ok(result)
}
