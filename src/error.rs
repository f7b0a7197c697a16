// =============================================================================
// Errors — storage gateway failures and aggregator-wide error type
// =============================================================================

use thiserror::Error;

/// Failures reported by a [`StorageGateway`](crate::storage::StorageGateway).
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store could not be reached or timed out.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The store refused a write for a table.
    #[error("write to {table} rejected: {reason}")]
    Rejected { table: String, reason: String },

    /// Stored data could not be decoded into rows.
    #[error("malformed stored row: {0}")]
    Malformed(String),
}

impl StorageError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        StorageError::Unavailable(msg.into())
    }

    pub fn rejected(table: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::Rejected {
            table: table.into(),
            reason: reason.into(),
        }
    }
}

/// Aggregator-wide error type.
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// A period or resolution name that is not part of the cascade.
    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type alias for aggregator operations
pub type AggregatorResult<T> = Result<T, AggregatorError>;
