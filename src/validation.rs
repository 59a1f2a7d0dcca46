//! Input validation for docmap
//!
//! Provides validation for the names that end up on the wire: database and
//! collection names, feed namespaces, and keys of stored map fields.

use thiserror::Error;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid identifier '{0}': {1}")]
    InvalidIdentifier(String, &'static str),

    #[error("Identifier '{0}' is too long (max {1} characters)")]
    TooLong(String, usize),

    #[error("Identifier cannot be empty")]
    Empty,

    #[error("Reserved name: '{0}'")]
    Reserved(String),
}

/// Maximum length of a full `database.collection` namespace
pub const MAX_NAMESPACE_LENGTH: usize = 120;

/// Maximum length of a database name
pub const MAX_DATABASE_LENGTH: usize = 64;

/// Collection prefixes owned by the store itself
const RESERVED_PREFIXES: &[&str] = &["system.", "oplog."];

/// Validate a collection name
///
/// Rules:
/// - Must not be empty
/// - Must not contain `$` or NUL
/// - Must not start with a reserved `system.` / `oplog.` prefix
pub fn validate_collection_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }

    if name.len() > MAX_NAMESPACE_LENGTH {
        return Err(ValidationError::TooLong(name.to_string(), MAX_NAMESPACE_LENGTH));
    }

    if name.contains('$') || name.contains('\0') {
        return Err(ValidationError::InvalidIdentifier(
            name.to_string(),
            "contains '$' or NUL",
        ));
    }

    if name.starts_with('.') || name.ends_with('.') {
        return Err(ValidationError::InvalidIdentifier(
            name.to_string(),
            "cannot start or end with a dot",
        ));
    }

    if RESERVED_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return Err(ValidationError::Reserved(name.to_string()));
    }

    Ok(())
}

/// Validate a database name
///
/// Database names become part of index namespaces, so path and
/// namespace separators are rejected.
pub fn validate_database_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }

    if name.len() > MAX_DATABASE_LENGTH {
        return Err(ValidationError::TooLong(name.to_string(), MAX_DATABASE_LENGTH));
    }

    for c in name.chars() {
        if matches!(c, '/' | '\\' | '.' | ' ' | '"' | '$' | '\0') {
            return Err(ValidationError::InvalidIdentifier(
                name.to_string(),
                "contains invalid characters (no '/', '\\', '.', ' ', '\"', '$')",
            ));
        }
    }

    Ok(())
}

/// Validate a `database.collection` feed namespace
pub fn validate_namespace(namespace: &str) -> Result<(), ValidationError> {
    let (db, collection) = namespace.split_once('.').ok_or_else(|| {
        ValidationError::InvalidIdentifier(
            namespace.to_string(),
            "expected 'database.collection'",
        )
    })?;
    validate_database_name(db)?;
    // The replication log itself lives under a reserved prefix.
    if collection.starts_with("oplog.") {
        return Ok(());
    }
    validate_collection_name(collection)
}

/// Validate a key of a stored map field
///
/// Keys become path segments, so dots and a leading `$` would change
/// the meaning of any query that reaches them.
pub fn validate_map_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::Empty);
    }

    if key.contains('.') {
        return Err(ValidationError::InvalidIdentifier(
            key.to_string(),
            "map keys cannot contain '.'",
        ));
    }

    if key.starts_with('$') {
        return Err(ValidationError::InvalidIdentifier(
            key.to_string(),
            "map keys cannot start with '$'",
        ));
    }

    Ok(())
}
