// src/error.rs
// Crate-wide error taxonomy for the execution core

use thiserror::Error;

/// All errors surfaced by the execution core.
///
/// The variants are grouped by how callers are expected to react:
/// validation errors have no partial effect, `WriteConflict` is transient
/// and retryable, `DuplicateKey` and index maintenance failures trigger
/// compensating rollback at the write path, and `Internal` is fatal to the
/// current operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QuartzError {
    // ---- validation: surfaced immediately, no partial effect ----
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("invalid index specification: {0}")]
    InvalidIndexSpec(String),

    #[error("cannot index parallel arrays: {0}")]
    CannotIndexParallelArrays(String),

    #[error("document is missing a valid _id field: {0}")]
    InvalidIdField(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    // ---- transient conflicts: retried per the caller's yield policy ----
    #[error("write conflict: {0}")]
    WriteConflict(String),

    // ---- consistency: compensating rollback has been applied ----
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    // ---- replication state: surfaced distinctly so callers can redirect ----
    #[error("not primary: {0}")]
    NotPrimary(String),

    // ---- execution lifecycle ----
    #[error("operation was killed: {0}")]
    QueryKilled(String),

    #[error("operation exceeded time limit: {0}")]
    ExceededTimeLimit(String),

    // ---- fatal for the current operation, never retried ----
    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl QuartzError {
    /// Transient errors may be retried by the executor's conflict-retry loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, QuartzError::WriteConflict(_))
    }

    /// Errors that invalidate the whole plan, not just the current work cycle.
    pub fn is_kill_status(&self) -> bool {
        matches!(
            self,
            QuartzError::QueryKilled(_) | QuartzError::CollectionNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QuartzError>;
