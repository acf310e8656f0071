//! Store error types.

use thiserror::Error;

/// Errors returned by store operations.
///
/// `Conflict` is the only variant callers are expected to recover from
/// locally, by re-reading and retrying their transaction.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A commit precondition no longer held; nothing was written.
    #[error("Transaction conflict on {0}")]
    Conflict(String),

    /// An update targeted a document that does not exist.
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend I/O failure (connection, script, protocol).
    #[error("Store backend error: {0}")]
    Backend(String),

    /// The store has shut down.
    #[error("Store closed")]
    Closed,
}

impl StoreError {
    /// Whether a transaction that failed with this error may be retried.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
