//! Error types for the pubsub engine.

use thiserror::Error;

use crate::model::DataKey;

/// Boxed error used to carry driver-specific failures through the store boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by publishing, registry lookups, batch runs and the listener.
///
/// Delivery callback failures are not part of this enum: they are recorded
/// into the replica row and drive the retry rule instead.
#[derive(Error, Debug)]
pub enum PubSubError {
    /// A required field is missing or malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A publisher, subscriber or replica could not be found.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    /// The key was already added to a batch that has not been flushed yet.
    #[error("Duplicate pending record: {0}")]
    DuplicatePendingRecord(DataKey),

    /// Any failure inside a transaction, lock, query or commit.
    #[error("Database error: {0}")]
    Database(#[source] BoxError),

    /// The change-notification connection failed or was closed by the server.
    #[error("Connection error: {0}")]
    Connection(String),
}

impl PubSubError {
    pub fn database<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Database(Box::new(err))
    }

    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// True for errors that abort the current batch or event transaction.
    pub fn is_database(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

pub type Result<T, E = PubSubError> = std::result::Result<T, E>;
