//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use sqlx::FromRow;
use stowage_core::{
    BlobDigest, JobId, JobStatus, JobType, UploadId, UploadSession, UploadState, Validator,
};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Jobs
// =============================================================================

/// Durable job record.
///
/// A job is claimable while `pending` and `run_after` has passed, or while
/// `running` with an expired lease and attempts left.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub job_type: String,
    pub status: String,
    /// JSON-encoded payload.
    pub payload: String,
    /// JSON-encoded result, set on completion.
    pub result: Option<String>,
    pub error: Option<String>,
    pub lock_id: Option<Uuid>,
    pub locked_at: Option<OffsetDateTime>,
    pub lock_expires_at: Option<OffsetDateTime>,
    /// Earliest time the job may be claimed; pushed out by retry backoff.
    pub run_after: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl JobRow {
    /// A new pending job, claimable immediately.
    pub fn pending(job_type: JobType, payload: String, max_attempts: u32) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.as_str().to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            payload,
            result: None,
            error: None,
            lock_id: None,
            locked_at: None,
            lock_expires_at: None,
            run_after: now,
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts: i32::try_from(max_attempts).unwrap_or(i32::MAX),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn job_id(&self) -> JobId {
        JobId::from_uuid(self.id)
    }

    pub fn parsed_type(&self) -> MetadataResult<JobType> {
        JobType::parse(&self.job_type).map_err(|e| MetadataError::Corrupt(e.to_string()))
    }

    pub fn parsed_status(&self) -> MetadataResult<JobStatus> {
        JobStatus::parse(&self.status).map_err(|e| MetadataError::Corrupt(e.to_string()))
    }

    /// Whether a failure now leaves the job retryable.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

// =============================================================================
// Cache entries
// =============================================================================

/// Cached upstream artifact (or confirmed absence) for one storage key.
#[derive(Debug, Clone, FromRow)]
pub struct CacheEntryRow {
    /// Canonical storage key of the logical resource.
    pub cache_key: String,
    pub repository: String,
    pub path: String,
    /// Storage backend record key holding the object.
    pub backend: String,
    /// Object key in the backend; `None` for negative entries.
    pub object_key: Option<String>,
    pub upstream_url: String,
    pub fetched_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    /// Hex SHA-256 of the cached bytes.
    pub content_hash: Option<String>,
    pub negative: bool,
}

impl CacheEntryRow {
    pub fn is_fresh_at(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }

    pub fn validator(&self) -> Validator {
        Validator {
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
        }
    }

    pub fn size(&self) -> u64 {
        u64::try_from(self.size_bytes).unwrap_or(0)
    }
}

/// Keyset cursor for paging cache entries oldest-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryCursor {
    pub fetched_at: OffsetDateTime,
    pub cache_key: String,
}

impl From<&CacheEntryRow> for CacheEntryCursor {
    fn from(row: &CacheEntryRow) -> Self {
        Self {
            fetched_at: row.fetched_at,
            cache_key: row.cache_key.clone(),
        }
    }
}

/// Aggregate size of a set of cache entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheEntryStats {
    pub count: u64,
    pub total_bytes: u64,
}

// =============================================================================
// Upload sessions
// =============================================================================

/// Upload session record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub upload_id: Uuid,
    pub repository: String,
    pub artifact_name: String,
    pub staging_path: String,
    pub byte_offset: i64,
    pub state: String,
    pub digest: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl From<&UploadSession> for UploadSessionRow {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_id: *session.id.as_uuid(),
            repository: session.repository.clone(),
            artifact_name: session.artifact_name.clone(),
            staging_path: session.staging_path.clone(),
            byte_offset: i64::try_from(session.offset).unwrap_or(i64::MAX),
            state: session.state.as_str().to_string(),
            digest: session.digest.as_ref().map(|d| d.to_string()),
            created_at: session.created_at,
            updated_at: session.updated_at,
            expires_at: session.expires_at,
        }
    }
}

impl TryFrom<UploadSessionRow> for UploadSession {
    type Error = MetadataError;

    fn try_from(row: UploadSessionRow) -> MetadataResult<Self> {
        let state =
            UploadState::parse(&row.state).map_err(|e| MetadataError::Corrupt(e.to_string()))?;
        let digest = row
            .digest
            .as_deref()
            .map(str::parse::<BlobDigest>)
            .transpose()
            .map_err(|e| MetadataError::Corrupt(e.to_string()))?;
        Ok(UploadSession {
            id: UploadId::from_uuid(row.upload_id),
            repository: row.repository,
            artifact_name: row.artifact_name,
            staging_path: row.staging_path,
            offset: u64::try_from(row.byte_offset).map_err(|_| {
                MetadataError::Corrupt(format!("negative offset {}", row.byte_offset))
            })?,
            state,
            digest,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}

// =============================================================================
// Distributed locks
// =============================================================================

/// Lease held on a named lock.
#[derive(Debug, Clone, FromRow)]
pub struct LockRow {
    pub name: String,
    pub owner: String,
    pub acquired_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}
