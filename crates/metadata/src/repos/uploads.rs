//! Upload session repository.

use crate::error::MetadataResult;
use crate::models::UploadSessionRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for upload session operations.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Create a new upload session.
    async fn create_upload(&self, session: &UploadSessionRow) -> MetadataResult<()>;

    /// Get an upload session by ID.
    async fn get_upload(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// Move an open session's offset from `expected` to `new_offset`,
    /// extending its expiry. Returns false when the session is not open or
    /// another append moved the offset first.
    async fn advance_upload_offset(
        &self,
        upload_id: Uuid,
        expected: i64,
        new_offset: i64,
        updated_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Transition a session from `from` to `to`, recording `digest` if given.
    /// Returns false when the session was not in `from`.
    async fn transition_upload(
        &self,
        upload_id: Uuid,
        from: &str,
        to: &str,
        digest: Option<&str>,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Open sessions whose expiry passed before `now`.
    async fn list_expired_uploads(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Delete terminal sessions last updated before `before`.
    async fn purge_terminal_uploads(&self, before: OffsetDateTime) -> MetadataResult<u64>;
}
