//! Error types for the Nimbus store.
//!
//! The taxonomy the rest of the control plane relies on:
//! `NotFound` propagates, `Conflict` means "already converged" to the
//! engines, and the storage-layer variants are transient — callers
//! retry on their next tick. The gateway itself never retries.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Uniqueness or state-transition violation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    /// Entity missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Storage-layer failure worth retrying on the next tick.
    pub fn is_transient(&self) -> bool {
        !self.is_conflict() && !self.is_not_found()
    }
}
