//! Error types for docmap
//!
//! Provides structured error types with context for better debugging
//! and a classification used by the change-feed and index retry loops.

use thiserror::Error;

/// The main error type for docmap operations
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Expression / Schema Errors
    // ==========================================================================
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("'{name}' is not a declared field of '{doc_type}'")]
    UndeclaredField { doc_type: String, name: String },

    #[error("Cannot resolve field \"{segment}\" in path '{path}'")]
    UnresolvableField { path: String, segment: String },

    #[error("Document type '{name}' is not registered")]
    UnknownDocumentType { name: String },

    #[error("Eager-loaded fields must target one document type: '{expected}' vs '{actual}'")]
    EagerloadConsistency { expected: String, actual: String },

    // ==========================================================================
    // Store Errors
    // ==========================================================================
    #[error("Operation rejected by the store: {message}")]
    Operation { message: String },

    #[error("No document of type '{doc_type}' matched the query")]
    DoesNotExist { doc_type: String },

    #[error("Store operation failed: {message}")]
    OperationFailure { message: String },

    #[error("Lost connection to the store: {message}")]
    Reconnect { message: String },

    // ==========================================================================
    // Search Index Errors
    // ==========================================================================
    #[error("Document '{id}' not found in index '{namespace}'")]
    IndexNotFound { namespace: String, id: String },

    #[error("Index '{namespace}' does not exist")]
    IndexMissing { namespace: String },

    #[error("Search index error: {message}")]
    Index { message: String },

    // ==========================================================================
    // Serialization / IO Errors
    // ==========================================================================
    #[error("Failed to parse JSON: {message}")]
    Json { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ==========================================================================
    // Catch-all
    // ==========================================================================
    #[error("{0}")]
    Other(String),
}

/// Result type alias for docmap operations
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Conversions from external error types
// =============================================================================

impl From<docspec::ExprError> for Error {
    fn from(err: docspec::ExprError) -> Self {
        Error::Validation {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json {
            message: err.to_string(),
        }
    }
}

impl From<crate::validation::ValidationError> for Error {
    fn from(err: crate::validation::ValidationError) -> Self {
        Error::Validation {
            message: err.to_string(),
        }
    }
}

impl Error {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Returns a user-friendly suggestion for fixing the error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::UndeclaredField { .. } => {
                Some("Declare the field on the document type or use a raw wire key")
            }
            Error::UnknownDocumentType { .. } => {
                Some("Register the document type with the schema registry first")
            }
            Error::EagerloadConsistency { .. } => {
                Some("Use a separate eagerload() call for each target document type")
            }
            Error::DoesNotExist { .. } => Some("Use one() when an empty result is acceptable"),
            _ => None,
        }
    }

    /// Transient store/log failures the change-feed tailer retries forever
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::OperationFailure { .. } | Error::Reconnect { .. }
        )
    }

    /// "Not found" answers from the search index, treated as success on writes
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::IndexNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnresolvableField {
            path: "author.address.zip".to_string(),
            segment: "zip".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot resolve field \"zip\" in path 'author.address.zip'"
        );
    }

    #[test]
    fn test_classification() {
        assert!(Error::Reconnect { message: "reset".into() }.is_transient());
        assert!(!Error::validation("bad").is_transient());
        assert!(Error::IndexNotFound {
            namespace: "blog-posts".into(),
            id: "x".into()
        }
        .is_not_found());
    }

    #[test]
    fn test_expr_error_is_validation() {
        let err: Error = docspec::ExprError::ZeroDivisor.into();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.suggestion().is_none());
    }
}
