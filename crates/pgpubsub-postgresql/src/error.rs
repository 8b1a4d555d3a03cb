//! Mapping of driver errors onto `PubSubError`.

use pgpubsub_core::error::{PubSubError, Result};
use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Configuration problems detected before any statement is sent.
#[derive(Error, Debug)]
pub enum PgConfigError {
    #[error("Invalid channel name '{0}': expected lowercase letters, digits and underscores")]
    InvalidChannel(String),

    #[error("Connection pool size must be at least 1")]
    EmptyPool,
}

impl From<PgConfigError> for PubSubError {
    fn from(err: PgConfigError) -> Self {
        PubSubError::Validation(err.to_string())
    }
}

pub(crate) trait PgResultExt<T> {
    /// Wrap a driver failure as `PubSubError::Database`.
    fn db(self) -> Result<T>;
}

impl<T> PgResultExt<T> for std::result::Result<T, tokio_postgres::Error> {
    fn db(self) -> Result<T> {
        self.map_err(PubSubError::database)
    }
}

pub(crate) fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

pub(crate) fn is_foreign_key_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION)
}
