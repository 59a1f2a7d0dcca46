//! Storage layer for docmap
//!
//! The [`Store`] trait is the seam between the mapper and a document
//! database. Everything crossing it is already compiled to wire maps, so a
//! driver only has to ship them. [`MemoryStore`] evaluates the same wire
//! format locally and backs tests and embedded use.

pub mod document;
pub mod matcher;
mod memory;
pub mod update;

pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use docspec::WireMap;

/// Sort direction of one sort key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Options of a find call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// `{path: 1}` inclusion map, optionally with `{path: {"$slice": n}}`
    pub projection: Option<WireMap>,
    pub sort: Vec<(String, SortOrder)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

/// Options of an update call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert a document built from the filter when nothing matches
    pub upsert: bool,
    /// Update every match instead of the first
    pub multi: bool,
}

/// A schemaless document store addressed by `database.collection`
/// namespaces.
///
/// Transient failures are reported as [`crate::Error::OperationFailure`]
/// or [`crate::Error::Reconnect`]; rejected writes as
/// [`crate::Error::Operation`].
#[async_trait]
pub trait Store: Send + Sync {
    async fn find(&self, namespace: &str, filter: &WireMap, options: &FindOptions)
        -> Result<Vec<WireMap>>;

    async fn count(&self, namespace: &str, filter: &WireMap) -> Result<usize>;

    /// Insert a record, returning its primary key
    async fn insert(&self, namespace: &str, record: WireMap) -> Result<String>;

    /// Apply an update or replacement document, returning the number of
    /// records touched
    async fn update(
        &self,
        namespace: &str,
        filter: &WireMap,
        update: &WireMap,
        options: UpdateOptions,
    ) -> Result<usize>;

    /// Remove matching records, returning how many were removed
    async fn remove(&self, namespace: &str, filter: &WireMap) -> Result<usize>;

    async fn drop_collection(&self, namespace: &str) -> Result<()>;
}
