//! Error types for the Palisade library.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`PalisadeError`] enum. Errors fall into three groups:
//!
//! - **Invariant violations** ([`PalisadeError::IllegalState`]): programming errors such as
//!   applying a packet that was never pushed or releasing a reference that was never taken.
//!   Callers should not retry these.
//! - **Recoverable I/O failures** ([`PalisadeError::Io`], [`PalisadeError::Storage`]): the
//!   affected segment is left at its pre-attempt generation, so the operation can be retried.
//! - **Argument and configuration errors**.
//!
//! # Examples
//!
//! ```
//! use palisade::error::{PalisadeError, Result};
//!
//! fn check_doc(doc_id: u32, max_doc: u32) -> Result<()> {
//!     if doc_id >= max_doc {
//!         return Err(PalisadeError::invalid_argument("doc id out of range"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_doc(3, 10).is_ok());
//! assert!(check_doc(10, 10).is_err());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Palisade operations.
#[derive(Error, Debug)]
pub enum PalisadeError {
    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Index-related errors
    #[error("Index error: {0}")]
    Index(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Query-related errors (failed to enumerate matches, etc.)
    #[error("Query error: {0}")]
    Query(String),

    /// A broken internal invariant. Never retried.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource has already been closed
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Failure reported by a caller-supplied collaborator, such as a delete query
    #[error("Anyhow error: {0:#}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with PalisadeError.
pub type Result<T> = std::result::Result<T, PalisadeError>;

impl PalisadeError {
    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        PalisadeError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        PalisadeError::Storage(msg.into())
    }

    /// Create a new query error.
    pub fn query<S: Into<String>>(msg: S) -> Self {
        PalisadeError::Query(msg.into())
    }

    /// Create a new illegal state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        PalisadeError::IllegalState(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        PalisadeError::InvalidArgument(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        PalisadeError::InvalidConfig(msg.into())
    }

    /// Create a new already-closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        PalisadeError::AlreadyClosed(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        PalisadeError::SerializationError(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        PalisadeError::Other(msg.into())
    }

    /// Whether this error reports a broken invariant rather than a transient failure.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, PalisadeError::IllegalState(_))
    }

    /// Whether the failed operation left state untouched and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PalisadeError::Io(_) | PalisadeError::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = PalisadeError::index("Test index error");
        assert_eq!(error.to_string(), "Index error: Test index error");

        let error = PalisadeError::illegal_state("packet not pushed");
        assert_eq!(error.to_string(), "Illegal state: packet not pushed");

        let error = PalisadeError::invalid_config("ram buffer must be positive");
        assert_eq!(
            error.to_string(),
            "Invalid configuration: ram buffer must be positive"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = PalisadeError::from(io_error);

        match error {
            PalisadeError::Io(_) => {}
            _ => panic!("Expected IO error"),
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(PalisadeError::illegal_state("x").is_invariant_violation());
        assert!(!PalisadeError::illegal_state("x").is_retryable());

        assert!(PalisadeError::storage("disk full").is_retryable());
        let io_error = io::Error::other("boom");
        assert!(PalisadeError::from(io_error).is_retryable());

        assert!(!PalisadeError::invalid_argument("x").is_retryable());
    }
}
