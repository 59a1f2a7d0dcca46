//! Field path resolution
//!
//! Turns a dotted logical path (`comments.author`) into the physical key
//! path stored in documents, following embedded document types, map keys
//! and explicit list indexes.

use super::{DocumentType, FieldDescriptor, FieldType, SchemaRegistry};
use crate::error::{Error, Result};
use crate::validation;
use std::sync::Arc;

/// Marker for "the element matched by the filter" in update paths
pub const POSITIONAL: &str = "$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    /// Plain dotted path for filters and projections
    Query,
    /// Lists of embedded documents are crossed with the positional marker
    Update,
}

/// Result of resolving a dotted path
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    /// Physical dotted path
    pub path: String,
    /// Descriptor of the last segment. For map keys and list indexes the
    /// type is narrowed to the value type.
    pub descriptor: FieldDescriptor,
}

/// Resolve `dotted` against `doc_type`.
///
/// An unknown first segment is [`Error::UndeclaredField`] so callers can
/// fall back to a raw wire key; an unknown later segment is
/// [`Error::UnresolvableField`]. References are never traversed.
pub fn resolve(
    registry: &SchemaRegistry,
    doc_type: &DocumentType,
    dotted: &str,
    mode: PathMode,
) -> Result<ResolvedPath> {
    if dotted.is_empty() {
        return Err(Error::validation("field path cannot be empty"));
    }

    let segments: Vec<&str> = dotted.split('.').collect();
    let mut physical: Vec<String> = Vec::with_capacity(segments.len() + 1);
    let mut owner = Arc::new(doc_type.clone());
    let mut idx = 0;

    loop {
        let segment = segments[idx];
        let field = match owner.lookup(segment) {
            Some(field) => field.clone(),
            None if idx == 0 => {
                return Err(Error::UndeclaredField {
                    doc_type: owner.name().to_string(),
                    name: segment.to_string(),
                })
            }
            None => return Err(unresolvable(dotted, segment)),
        };
        physical.push(field.db_field.clone());
        idx += 1;

        // Walk through containers until the next declared type or the end
        let mut ty = field.field_type.clone();
        loop {
            if idx == segments.len() {
                return Ok(ResolvedPath {
                    path: physical.join("."),
                    descriptor: FieldDescriptor {
                        field_type: ty,
                        ..field
                    },
                });
            }
            let next = segments[idx];
            match ty {
                FieldType::List(inner) => {
                    if next.parse::<usize>().is_ok() {
                        physical.push(next.to_string());
                        idx += 1;
                    } else if mode == PathMode::Update
                        && matches!(*inner, FieldType::Embedded(_))
                    {
                        physical.push(POSITIONAL.to_string());
                    }
                    ty = *inner;
                }
                FieldType::Map(inner) => {
                    validation::validate_map_key(next)?;
                    physical.push(next.to_string());
                    idx += 1;
                    ty = *inner;
                }
                FieldType::Dict | FieldType::Generic => {
                    physical.extend(segments[idx..].iter().map(|s| s.to_string()));
                    idx = segments.len();
                    ty = FieldType::Generic;
                }
                FieldType::Embedded(name) => {
                    owner = registry.get(&name)?;
                    break;
                }
                _ => return Err(unresolvable(dotted, next)),
            }
        }
    }
}

fn unresolvable(path: &str, segment: &str) -> Error {
    Error::UnresolvableField {
        path: path.to_string(),
        segment: segment.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(DocumentType::new("User").field(FieldDescriptor::string("username").db_field("u")))
            .unwrap();
        registry
            .register(
                DocumentType::embedded("Address")
                    .field(FieldDescriptor::string("city"))
                    .field(FieldDescriptor::string("zip").db_field("z")),
            )
            .unwrap();
        registry
            .register(
                DocumentType::embedded("Comment")
                    .field(FieldDescriptor::reference("author", "User").db_field("a"))
                    .field(FieldDescriptor::string("text"))
                    .field(FieldDescriptor::list("likes", FieldType::reference("User"))),
            )
            .unwrap();
        registry
            .register(
                DocumentType::new("Post")
                    .field(FieldDescriptor::reference("author", "User"))
                    .field(FieldDescriptor::embedded("address", "Address").db_field("addr"))
                    .field(FieldDescriptor::list("comments", FieldType::Embedded("Comment".into())))
                    .field(FieldDescriptor::new("titles", FieldType::map_of(FieldType::String)))
                    .field(FieldDescriptor::new("extra", FieldType::Dict))
                    .field(FieldDescriptor::list("tags", FieldType::String)),
            )
            .unwrap();
        registry
    }

    fn path(dotted: &str, mode: PathMode) -> Result<String> {
        let registry = registry();
        let post = registry.get("Post").unwrap();
        resolve(&registry, &post, dotted, mode).map(|r| r.path)
    }

    #[test]
    fn test_embedded_renames() {
        assert_eq!(path("address.zip", PathMode::Query).unwrap(), "addr.z");
        assert_eq!(path("address.zip", PathMode::Update).unwrap(), "addr.z");
        assert_eq!(path("id", PathMode::Query).unwrap(), "_id");
    }

    #[test]
    fn test_positional_marker_in_update_mode() {
        assert_eq!(path("comments.author", PathMode::Query).unwrap(), "comments.a");
        assert_eq!(path("comments.author", PathMode::Update).unwrap(), "comments.$.a");
        assert_eq!(path("comments.2.author", PathMode::Update).unwrap(), "comments.2.a");
        // A list of scalars never gets the marker
        assert_eq!(path("tags", PathMode::Update).unwrap(), "tags");
    }

    #[test]
    fn test_map_and_dict_segments() {
        assert_eq!(path("titles.en", PathMode::Query).unwrap(), "titles.en");
        assert!(path("titles.$x", PathMode::Query).is_err());
        assert_eq!(path("extra.a.b", PathMode::Query).unwrap(), "extra.a.b");

        let registry = registry();
        let post = registry.get("Post").unwrap();
        let resolved = resolve(&registry, &post, "titles.en", PathMode::Query).unwrap();
        assert_eq!(resolved.descriptor.field_type, FieldType::String);
    }

    #[test]
    fn test_undeclared_first_segment() {
        assert!(matches!(
            path("views", PathMode::Query),
            Err(Error::UndeclaredField { name, .. }) if name == "views"
        ));
    }

    #[test]
    fn test_unresolvable_later_segment() {
        assert!(matches!(
            path("address.country", PathMode::Query),
            Err(Error::UnresolvableField { segment, .. }) if segment == "country"
        ));
        // References are not followed
        assert!(matches!(
            path("author.username", PathMode::Query),
            Err(Error::UnresolvableField { segment, .. }) if segment == "username"
        ));
        assert!(matches!(
            path("tags.name", PathMode::Query),
            Err(Error::UnresolvableField { .. })
        ));
    }
}
