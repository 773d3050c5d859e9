//! Error types for the consumption store.

use thiserror::Error;

/// An error produced by a [`ConsumptionStore`] operation.
///
/// [`ConsumptionStore`]: crate::ConsumptionStore
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying database rejected the operation.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// A numeric value does not fit the column it is stored in.
    #[error("value out of range for column {column}: {value}")]
    OutOfRange {
        /// The column the value was destined for.
        column: &'static str,
        /// The offending value.
        value: u64,
    },
    /// A stored block hash is not 32 bytes long.
    #[error("malformed block hash in storage: expected 32 bytes, got {0}")]
    MalformedBlockHash(usize),
    /// The storage backend could not be reached.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}
