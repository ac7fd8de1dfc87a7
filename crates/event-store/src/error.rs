use thiserror::Error;

use crate::{InstanceId, SequenceNumber};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The expected next sequence number did not match the stored one.
    /// Signals a second writer for the same instance.
    #[error(
        "Concurrency conflict for instance {instance_id}: expected sequence {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        instance_id: InstanceId,
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    /// The batch handed to `append` was malformed.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// The backing store refused the write.
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
