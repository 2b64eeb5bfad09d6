//! Durable job queue over the metadata store.

use crate::error::EngineResult;
use crate::lock::lease_end;
use crate::metrics;
use serde::Serialize;
use std::sync::Arc;
use stowage_core::config::JobConfig;
use stowage_core::job::retry_backoff;
use stowage_core::{JobId, JobType};
use stowage_metadata::{ClaimRequest, JobRow, MetadataStore};
use time::OffsetDateTime;
use uuid::Uuid;

/// Enqueue, claim and settle jobs.
///
/// Exclusivity comes from the store's conditional claim update, so any
/// number of queues in any number of processes may share one job table.
#[derive(Clone)]
pub struct JobQueue {
    metadata: Arc<dyn MetadataStore>,
    config: JobConfig,
}

impl JobQueue {
    pub fn new(metadata: Arc<dyn MetadataStore>, config: JobConfig) -> Self {
        Self { metadata, config }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Enqueue a job with the configured attempt budget.
    pub async fn enqueue<P: Serialize + Sync>(
        &self,
        job_type: JobType,
        payload: &P,
    ) -> EngineResult<JobId> {
        let job = JobRow::pending(
            job_type,
            serde_json::to_string(payload)?,
            self.config.max_attempts,
        );
        self.metadata.enqueue_job(&job).await?;
        metrics::JOBS_ENQUEUED
            .with_label_values(&[job_type.as_str()])
            .inc();
        tracing::debug!(job_id = %job.id, job_type = %job_type, "Job enqueued");
        Ok(job.job_id())
    }

    /// Enqueue unless a job of the same type is already pending or running.
    pub async fn enqueue_if_idle<P: Serialize + Sync>(
        &self,
        job_type: JobType,
        payload: &P,
    ) -> EngineResult<Option<JobId>> {
        if self.metadata.count_active_jobs(job_type.as_str()).await? > 0 {
            tracing::debug!(job_type = %job_type, "Job of this type already active, skipping");
            return Ok(None);
        }
        self.enqueue(job_type, payload).await.map(Some)
    }

    /// Claim up to `limit` jobs for `lock_id`, any type when `job_types` is empty.
    pub async fn claim(
        &self,
        lock_id: Uuid,
        limit: u32,
        job_types: &[&str],
    ) -> EngineResult<Vec<JobRow>> {
        let now = OffsetDateTime::now_utc();
        let jobs = self
            .metadata
            .claim_jobs(&ClaimRequest {
                lock_id,
                limit,
                now,
                lease_expires_at: lease_end(now, self.config.lease_ttl()),
                job_types,
            })
            .await?;

        for job in &jobs {
            metrics::JOBS_CLAIMED
                .with_label_values(&[job.job_type.as_str()])
                .inc();
            // Failures record an error; a retry without one means the
            // previous holder's lease ran out.
            if job.attempts > 1 && job.error.is_none() {
                metrics::JOBS_RECLAIMED
                    .with_label_values(&[job.job_type.as_str()])
                    .inc();
                tracing::warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    "Reclaimed job after lease expiry"
                );
            }
        }
        Ok(jobs)
    }

    /// Extend the lease on a running job. False means it was lost.
    pub async fn heartbeat(&self, job: &JobRow, lock_id: Uuid) -> EngineResult<bool> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .metadata
            .heartbeat_job(job.id, lock_id, lease_end(now, self.config.lease_ttl()), now)
            .await?)
    }

    pub async fn complete(
        &self,
        job: &JobRow,
        lock_id: Uuid,
        result: &serde_json::Value,
    ) -> EngineResult<bool> {
        let result = serde_json::to_string(result)?;
        let settled = self
            .metadata
            .complete_job(job.id, lock_id, Some(&result), OffsetDateTime::now_utc())
            .await?;
        if settled {
            metrics::JOBS_COMPLETED
                .with_label_values(&[job.job_type.as_str()])
                .inc();
        }
        Ok(settled)
    }

    /// Record a failure, rescheduling with exponential backoff while
    /// attempts remain.
    pub async fn fail(&self, job: &JobRow, lock_id: Uuid, error: &str) -> EngineResult<bool> {
        let now = OffsetDateTime::now_utc();
        let attempt = u32::try_from(job.attempts).unwrap_or(0);
        let delay = retry_backoff(
            attempt,
            self.config.backoff_base(),
            self.config.backoff_max(),
        );
        let settled = self
            .metadata
            .fail_job(job.id, lock_id, error, lease_end(now, delay), now)
            .await?;

        if settled {
            let label = [job.job_type.as_str()];
            if job.has_attempts_left() {
                metrics::JOBS_RETRIED.with_label_values(&label).inc();
                tracing::warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error,
                    "Job failed, will retry"
                );
            } else {
                metrics::JOBS_FAILED.with_label_values(&label).inc();
                tracing::error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt,
                    error,
                    "Job failed permanently"
                );
            }
        }
        Ok(settled)
    }

    /// Fail jobs whose lease expired with no attempts left.
    pub async fn reap(&self) -> EngineResult<u64> {
        let reaped = self
            .metadata
            .reap_exhausted_jobs(OffsetDateTime::now_utc())
            .await?;
        if reaped > 0 {
            metrics::JOBS_REAPED.inc_by(reaped);
            tracing::warn!(count = reaped, "Failed expired jobs with no attempts left");
        }
        Ok(reaped)
    }

    pub async fn get(&self, id: JobId) -> EngineResult<Option<JobRow>> {
        Ok(self.metadata.get_job(*id.as_uuid()).await?)
    }
}
