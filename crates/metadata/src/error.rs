//! Metadata store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    /// An insert collided with an existing primary key.
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// A row holds a value the domain types cannot represent.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl MetadataError {
    pub(crate) fn from_insert(err: sqlx::Error, what: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                MetadataError::AlreadyExists(what.into())
            }
            _ => MetadataError::Database(err),
        }
    }
}

pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
