//! Job execution with lease heartbeats and panic capture.

use super::queue::JobQueue;
use crate::error::EngineResult;
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stowage_core::{JobId, JobType};
use stowage_metadata::JobRow;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Runs the work a job describes.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute `job`. The returned value is stored as the job's result.
    async fn handle(&self, job: &JobRow) -> EngineResult<serde_json::Value>;
}

/// How one execution ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed; `retrying` when attempts remain.
    Failed { error: String, retrying: bool },
    Panicked { message: String },
    /// Another worker took over the lease, so the result was discarded.
    LeaseLost,
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Panicked { .. } => "panicked",
            Self::LeaseLost => "lease_lost",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: JobId,
    pub job_type: String,
    pub outcome: JobOutcome,
}

/// Claims jobs and runs them concurrently.
///
/// Each running job has its lease heartbeated; a job whose lease is lost is
/// abandoned so it never completes twice.
#[derive(Clone)]
pub struct JobWorker {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    lock_id: Uuid,
    job_types: Arc<[&'static str]>,
}

impl JobWorker {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            queue,
            handler,
            lock_id: Uuid::new_v4(),
            job_types: Arc::from(Vec::new()),
        }
    }

    /// Only claim jobs of these types.
    pub fn with_job_types(mut self, job_types: &[JobType]) -> Self {
        self.job_types = job_types.iter().map(JobType::as_str).collect();
        self
    }

    /// Lock id written into every job this worker claims.
    pub fn lock_id(&self) -> Uuid {
        self.lock_id
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.queue.config().lease_ttl() / 3).max(Duration::from_millis(100))
    }

    /// Claim one batch and run it to completion.
    pub async fn run_once(&self) -> EngineResult<Vec<JobReport>> {
        let jobs = self
            .queue
            .claim(self.lock_id, self.queue.config().concurrency, &self.job_types)
            .await?;

        let mut set = JoinSet::new();
        for job in jobs {
            let worker = self.clone();
            set.spawn(async move { worker.execute(job).await });
        }

        let mut reports = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(error = %e, "Job supervisor task failed"),
            }
        }
        Ok(reports)
    }

    /// Poll for jobs until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(lock_id = %self.lock_id, "Job worker started");
        let poll = self.queue.config().poll_interval();

        while !*shutdown.borrow() {
            let claimed = match self.run_once().await {
                Ok(reports) => reports.len(),
                Err(e) => {
                    tracing::error!(error = %e, "Job claim failed");
                    0
                }
            };
            if claimed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        tracing::info!(lock_id = %self.lock_id, "Job worker stopped");
    }

    async fn execute(&self, job: JobRow) -> JobReport {
        metrics::JOBS_RUNNING.inc();
        let started = Instant::now();
        tracing::info!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "Job started");

        let outcome = self.supervise(&job).await;

        metrics::JOBS_RUNNING.dec();
        metrics::record_job(&job.job_type, outcome.label(), started.elapsed());
        JobReport {
            job_id: job.job_id(),
            job_type: job.job_type,
            outcome,
        }
    }

    async fn supervise(&self, job: &JobRow) -> JobOutcome {
        let handler = Arc::clone(&self.handler);
        let task_job = job.clone();
        // A separate task so a panicking handler surfaces as a JoinError.
        let mut task = tokio::spawn(async move { handler.handle(&task_job).await });

        let mut ticker = tokio::time::interval(self.heartbeat_interval());
        ticker.tick().await;

        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = ticker.tick() => match self.queue.heartbeat(job, self.lock_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        task.abort();
                        metrics::JOBS_LEASE_LOST
                            .with_label_values(&[job.job_type.as_str()])
                            .inc();
                        tracing::warn!(job_id = %job.id, "Job lease lost, abandoning");
                        return JobOutcome::LeaseLost;
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Job heartbeat failed");
                    }
                },
            }
        };

        match joined {
            Ok(Ok(result)) => match self.queue.complete(job, self.lock_id, &result).await {
                Ok(true) => {
                    tracing::info!(job_id = %job.id, job_type = %job.job_type, "Job completed");
                    JobOutcome::Completed
                }
                Ok(false) => JobOutcome::LeaseLost,
                Err(e) => {
                    // The lease runs out and the job is retried.
                    tracing::error!(job_id = %job.id, error = %e, "Failed to record job completion");
                    JobOutcome::Failed {
                        error: e.to_string(),
                        retrying: job.has_attempts_left(),
                    }
                }
            },
            Ok(Err(e)) => {
                let error = format!("{}: {e}", e.kind());
                self.settle_failure(job, error).await
            }
            Err(join_err) if join_err.is_panic() => {
                metrics::JOBS_PANICKED.inc();
                let message = panic_message(join_err.into_panic());
                tracing::error!(job_id = %job.id, panic = %message, "Job handler panicked");
                match self.settle_failure(job, format!("panicked: {message}")).await {
                    JobOutcome::LeaseLost => JobOutcome::LeaseLost,
                    _ => JobOutcome::Panicked { message },
                }
            }
            Err(join_err) => self.settle_failure(job, format!("cancelled: {join_err}")).await,
        }
    }

    async fn settle_failure(&self, job: &JobRow, error: String) -> JobOutcome {
        match self.queue.fail(job, self.lock_id, &error).await {
            Ok(true) => JobOutcome::Failed {
                error,
                retrying: job.has_attempts_left(),
            },
            Ok(false) => JobOutcome::LeaseLost,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to record job failure");
                JobOutcome::Failed {
                    error,
                    retrying: job.has_attempts_left(),
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
