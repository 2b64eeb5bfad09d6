//! Job queue repository.

use crate::error::MetadataResult;
use crate::models::JobRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Parameters of a claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    /// Lock id written into every claimed row.
    pub lock_id: Uuid,
    pub limit: u32,
    pub now: OffsetDateTime,
    pub lease_expires_at: OffsetDateTime,
    /// Restrict to these job types; empty claims any type.
    pub job_types: &'a [&'a str],
}

/// Repository for the durable job queue.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Insert a new job.
    async fn enqueue_job(&self, job: &JobRow) -> MetadataResult<()>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> MetadataResult<Option<JobRow>>;

    /// Claim up to `limit` claimable jobs for `lock_id`.
    ///
    /// Each row is taken with a conditional update that re-checks
    /// claimability, so two callers can never both win the same row even
    /// without serializable isolation. Claiming increments `attempts`.
    async fn claim_jobs(&self, request: &ClaimRequest<'_>) -> MetadataResult<Vec<JobRow>>;

    /// Extend the lease of a running job. Returns false if the lease was lost.
    async fn heartbeat_job(
        &self,
        id: Uuid,
        lock_id: Uuid,
        lease_expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Mark a running job completed. Returns false if the lease was lost.
    async fn complete_job(
        &self,
        id: Uuid,
        lock_id: Uuid,
        result: Option<&str>,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Record a failure: back to `pending` at `retry_at` while attempts
    /// remain, otherwise `failed`. Returns false if the lease was lost.
    async fn fail_job(
        &self,
        id: Uuid,
        lock_id: Uuid,
        error: &str,
        retry_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Fail running jobs whose lease expired with no attempts left.
    async fn reap_exhausted_jobs(&self, now: OffsetDateTime) -> MetadataResult<u64>;

    /// Count pending or running jobs of a type.
    async fn count_active_jobs(&self, job_type: &str) -> MetadataResult<u64>;

    /// List jobs, newest first, optionally filtered by status.
    async fn list_jobs(&self, status: Option<&str>, limit: u32) -> MetadataResult<Vec<JobRow>>;

    /// Delete completed and failed jobs finished before `before`.
    async fn purge_finished_jobs(&self, before: OffsetDateTime) -> MetadataResult<u64>;
}
