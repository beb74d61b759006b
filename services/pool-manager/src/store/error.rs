//! Store error types.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures reading or mutating the pool.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Query or transaction failure.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// A row could not be decoded into a record.
    #[error("failed to decode column '{column}': {message}")]
    Decode { column: &'static str, message: String },

    /// JSON encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An import collided with a different row's host id or address.
    #[error("conflicting record: {0}")]
    Conflict(String),

    /// The backing store refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
