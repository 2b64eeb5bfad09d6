//! Upload session types and lifecycle.

use crate::hash::BlobDigest;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::UploadSession(format!("invalid upload ID: {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upload session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Session is open and accepting bytes.
    Open,
    /// Content was verified and stored under its digest key.
    Committed,
    /// Session was explicitly aborted or failed verification.
    Aborted,
    /// Session was abandoned past its expiry and collected.
    Expired,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "committed" => Ok(Self::Committed),
            "aborted" => Ok(Self::Aborted),
            "expired" => Ok(Self::Expired),
            other => Err(crate::Error::UploadSession(format!(
                "unknown upload state: {other}"
            ))),
        }
    }

    /// Check if the session is still active (can receive bytes).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted | Self::Expired)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resumable upload session.
///
/// The staging file is private to the session; nothing is visible under the
/// final content-addressed key until the session commits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: UploadId,
    /// Repository the artifact is uploaded into.
    pub repository: String,
    /// Protocol-level artifact name (image name, package id, ...).
    pub artifact_name: String,
    /// Staging file name, relative to the configured staging directory.
    pub staging_path: String,
    /// Bytes appended so far; the next append must start here.
    pub offset: u64,
    pub state: UploadState,
    /// Digest of the committed blob, set on commit.
    pub digest: Option<BlobDigest>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl UploadSession {
    /// Create a new open session expiring `expires_in` from now.
    pub fn new(repository: &str, artifact_name: &str, expires_in: time::Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        let id = UploadId::new();
        Self {
            id,
            repository: repository.to_string(),
            artifact_name: artifact_name.to_string(),
            staging_path: format!("{id}.part"),
            offset: 0,
            state: UploadState::Open,
            digest: None,
            created_at: now,
            updated_at: now,
            expires_at: now + expires_in,
        }
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

/// Result of a successful finalize.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedBlob {
    pub upload_id: UploadId,
    pub repository: String,
    pub artifact_name: String,
    pub digest: BlobDigest,
    pub size: u64,
    /// Storage key the blob was committed under.
    pub storage_key: String,
    /// Key of the storage backend holding the blob.
    pub backend: String,
    /// False when an identical blob already existed and the write was skipped.
    pub stored: bool,
}

/// Progress report for an open or finished session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub upload_id: UploadId,
    pub offset: u64,
    pub state: UploadState,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl From<&UploadSession> for UploadStatus {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_id: session.id,
            offset: session.offset,
            state: session.state,
            expires_at: session.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_id_roundtrip() {
        let id = UploadId::new();
        let parsed = UploadId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.as_uuid(), parsed.as_uuid());
        assert!(UploadId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_upload_state_flags_and_strings() {
        assert!(UploadState::Open.is_active());
        assert!(!UploadState::Open.is_terminal());
        for state in [
            UploadState::Committed,
            UploadState::Aborted,
            UploadState::Expired,
        ] {
            assert!(!state.is_active());
            assert!(state.is_terminal());
            assert_eq!(UploadState::parse(state.as_str()).unwrap(), state);
        }
        assert!(UploadState::parse("paused").is_err());
    }

    #[test]
    fn test_new_session_uses_private_staging_name() {
        let a = UploadSession::new("docker-local", "library/alpine", time::Duration::minutes(5));
        let b = UploadSession::new("docker-local", "library/alpine", time::Duration::minutes(5));
        assert_ne!(a.staging_path, b.staging_path);
        assert!(a.staging_path.starts_with(&a.id.to_string()));
        assert_eq!(a.offset, 0);
        assert_eq!(a.state, UploadState::Open);
        assert!(a.digest.is_none());
    }

    #[test]
    fn test_upload_session_expired() {
        let session = UploadSession::new("repo", "name", time::Duration::seconds(-1));
        assert!(session.is_expired());
        let session = UploadSession::new("repo", "name", time::Duration::minutes(1));
        assert!(!session.is_expired());
    }
}
