//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Backend-agnostic error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageErrorKind {
    NotFound,
    IoFailure,
    PermissionDenied,
    /// The request itself was malformed (bad key, bad range, bad config).
    Invalid,
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::NotFound(_) => StorageErrorKind::NotFound,
            StorageError::PermissionDenied(_) => StorageErrorKind::PermissionDenied,
            StorageError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
                _ => StorageErrorKind::IoFailure,
            },
            StorageError::Backend(_) => StorageErrorKind::IoFailure,
            StorageError::InvalidKey(_)
            | StorageError::InvalidRange(_)
            | StorageError::Config(_) => StorageErrorKind::Invalid,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == StorageErrorKind::NotFound
    }

    /// Classify an I/O error raised while operating on `key`.
    pub fn from_io(key: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(key.to_string()),
            _ => StorageError::Io(err),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_classified() {
        let err = StorageError::from_io(
            "a/b",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, StorageError::NotFound(ref k) if k == "a/b"));

        let err = StorageError::from_io(
            "a/b",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert_eq!(err.kind(), StorageErrorKind::PermissionDenied);

        let err = StorageError::from_io("a/b", std::io::Error::other("disk on fire"));
        assert_eq!(err.kind(), StorageErrorKind::IoFailure);
        assert_eq!(
            StorageError::InvalidRange("x".into()).kind(),
            StorageErrorKind::Invalid
        );
    }
}
