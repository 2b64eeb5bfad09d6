//! Engine error types.

use stowage_metadata::MetadataError;
use stowage_storage::{StorageError, StorageErrorKind};

/// Errors returned by the cache, upload and job engines.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("lock contention: {0}")]
    LockContention(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("offset mismatch: session is at {expected}, append started at {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("core error: {0}")]
    Core(#[from] stowage_core::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable classification of an [`EngineError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    IoFailure,
    DigestMismatch,
    LockContention,
    UpstreamUnavailable,
    PermissionDenied,
    InvalidRequest,
    OffsetMismatch,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::IoFailure => "io_failure",
            Self::DigestMismatch => "digest_mismatch",
            Self::LockContention => "lock_contention",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidRequest => "invalid_request",
            Self::OffsetMismatch => "offset_mismatch",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                _ => ErrorKind::IoFailure,
            },
            Self::Storage(e) => match e.kind() {
                StorageErrorKind::NotFound => ErrorKind::NotFound,
                StorageErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                StorageErrorKind::IoFailure => ErrorKind::IoFailure,
                StorageErrorKind::Invalid => ErrorKind::InvalidRequest,
            },
            Self::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            Self::LockContention(_) => ErrorKind::LockContention,
            Self::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::InvalidRequest(_) | Self::Serialization(_) => ErrorKind::InvalidRequest,
            Self::OffsetMismatch { .. } => ErrorKind::OffsetMismatch,
            Self::Metadata(_) => ErrorKind::IoFailure,
            Self::Core(stowage_core::Error::DigestMismatch { .. }) => ErrorKind::DigestMismatch,
            Self::Core(_) => ErrorKind::InvalidRequest,
            Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Rebuild an error reported by another task from its kind and message.
    pub(crate) fn relayed(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::UpstreamUnavailable => Self::UpstreamUnavailable(message),
            ErrorKind::PermissionDenied => Self::PermissionDenied(message),
            ErrorKind::LockContention => Self::LockContention(message),
            ErrorKind::InvalidRequest => Self::InvalidRequest(message),
            _ => Self::Internal(message),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_keep_their_taxonomy() {
        let err = EngineError::from(StorageError::NotFound("blobs/x".to_string()));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = EngineError::from(StorageError::PermissionDenied("blobs/x".to_string()));
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let io = std::io::Error::other("disk on fire");
        assert_eq!(EngineError::from(StorageError::Io(io)).kind(), ErrorKind::IoFailure);
    }

    #[test]
    fn test_relayed_errors_keep_kind() {
        let err = EngineError::relayed(ErrorKind::UpstreamUnavailable, "timeout".to_string());
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        assert_eq!(err.to_string(), "upstream unavailable: timeout");
        assert_eq!(ErrorKind::DigestMismatch.as_str(), "digest_mismatch");
    }
}
