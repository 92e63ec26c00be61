//! Error types for the Pilum library.
//!
//! Every fallible operation returns [`Result`], whose error side is the
//! [`PilumError`] enum. Callers that only care about the broad category of a
//! failure (schema, metadata, I/O) can match on [`PilumError::kind`] instead of
//! the individual variants.
//!
//! # Examples
//!
//! ```
//! use pilum::error::{ErrorKind, PilumError, Result};
//!
//! fn resolve() -> Result<usize> {
//!     Err(PilumError::schema("vector field params must contain: dimension"))
//! }
//!
//! let err = resolve().unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::Schema);
//! ```

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Pilum operations.
#[derive(Error, Debug)]
pub enum PilumError {
    /// I/O errors (file operations, sync, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Schema-related errors (missing or invalid dimension, payload width)
    #[error("Schema error: {0}")]
    Schema(String),

    /// Snapshot fetch, reservation or publish failures
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// The collection, partition or segment no longer exists
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation not valid in the current lifecycle state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Persisted data failed validation
    #[error("Corruption: {0}")]
    Corruption(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with PilumError.
pub type Result<T> = std::result::Result<T, PilumError>;

/// Broad failure category, used by ingestion pipelines to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Dimension unresolved or payload shape invalid.
    Schema,
    /// Snapshot store unavailable or rejected a reservation/publish.
    Metadata,
    /// Physical read or write failure.
    Io,
    /// Call not valid for the segment's lifecycle state.
    State,
    /// Anything else.
    Other,
}

impl PilumError {
    /// Create a new schema error.
    pub fn schema<S: Into<String>>(msg: S) -> Self {
        PilumError::Schema(msg.into())
    }

    /// Create a new metadata error.
    pub fn metadata<S: Into<String>>(msg: S) -> Self {
        PilumError::Metadata(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        PilumError::Storage(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        PilumError::InvalidOperation(msg.into())
    }

    /// Create a new corruption error.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        PilumError::Corruption(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        PilumError::Other(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        PilumError::Other(format!("Invalid configuration: {}", msg.into()))
    }

    /// Create a new not found error. Not-found is a metadata condition.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        PilumError::NotFound(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PilumError::Schema(_) => ErrorKind::Schema,
            PilumError::Metadata(_) | PilumError::NotFound(_) => ErrorKind::Metadata,
            PilumError::Io(_) | PilumError::Storage(_) | PilumError::Corruption(_) => {
                ErrorKind::Io
            }
            PilumError::InvalidOperation(_) => ErrorKind::State,
            PilumError::Json(_) | PilumError::Other(_) | PilumError::Anyhow(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Whether the error reports a missing collection, partition or segment.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PilumError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = PilumError::schema("Test schema error");
        assert_eq!(error.to_string(), "Schema error: Test schema error");

        let error = PilumError::metadata("Test metadata error");
        assert_eq!(error.to_string(), "Metadata error: Test metadata error");

        let error = PilumError::invalid_operation("already flushed");
        assert_eq!(error.to_string(), "Invalid operation: already flushed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let pilum_error = PilumError::from(io_error);

        match pilum_error {
            PilumError::Io(_) => {} // Expected
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(PilumError::schema("x").kind(), ErrorKind::Schema);
        assert_eq!(PilumError::metadata("x").kind(), ErrorKind::Metadata);
        assert_eq!(PilumError::storage("x").kind(), ErrorKind::Io);
        assert_eq!(PilumError::invalid_operation("x").kind(), ErrorKind::State);
        assert_eq!(PilumError::other("x").kind(), ErrorKind::Other);
    }

    #[test]
    fn test_not_found_is_metadata() {
        let err = PilumError::not_found("partition 7");
        assert_eq!(err.kind(), ErrorKind::Metadata);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: partition 7");
        assert!(!PilumError::metadata("version conflict").is_not_found());
        assert!(!PilumError::metadata("Not found: partition 7").is_not_found());
    }
}
