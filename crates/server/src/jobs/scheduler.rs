//! Periodic job enqueueing.

use super::queue::JobQueue;
use crate::error::EngineResult;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use stowage_core::config::SchedulerConfig;
use stowage_core::{JobId, JobType, UploadGcPayload};
use tokio::sync::watch;

const UPLOAD_GC_TASK: &str = "upload_gc";
const REAPER_TASK: &str = "reaper";

/// Enqueues `upload_gc` and configured `cleanup_sweep` jobs on their
/// intervals, and runs the lease reaper.
///
/// A type that already has a pending or running job is never enqueued
/// again; the task stays due and is retried on the next tick.
pub struct Scheduler {
    queue: JobQueue,
    config: SchedulerConfig,
    last_run: HashMap<String, Instant>,
}

impl Scheduler {
    pub fn new(queue: JobQueue, config: SchedulerConfig) -> Self {
        Self {
            queue,
            config,
            last_run: HashMap::new(),
        }
    }

    fn is_due(&self, task: &str, interval: Duration, now: Instant) -> bool {
        self.last_run
            .get(task)
            .is_none_or(|last| now.saturating_duration_since(*last) >= interval)
    }

    /// Run every task due at `now`. Returns the jobs enqueued.
    pub async fn run_due(&mut self, now: Instant) -> EngineResult<Vec<JobId>> {
        let mut enqueued = Vec::new();

        let gc_interval = Duration::from_secs(self.config.upload_gc_interval_secs);
        if !gc_interval.is_zero() && self.is_due(UPLOAD_GC_TASK, gc_interval, now) {
            if let Some(id) = self
                .queue
                .enqueue_if_idle(JobType::UploadGc, &UploadGcPayload::default())
                .await?
            {
                tracing::info!(job_id = ?id, "Scheduled upload GC");
                enqueued.push(id);
                self.last_run.insert(UPLOAD_GC_TASK.to_string(), now);
            }
        }

        let reaper_interval = Duration::from_secs(self.config.reaper_interval_secs);
        if self.is_due(REAPER_TASK, reaper_interval, now) {
            self.queue.reap().await?;
            self.last_run.insert(REAPER_TASK.to_string(), now);
        }

        for sweep in &self.config.sweeps {
            let task = format!("sweep:{}", sweep.name);
            if !self.is_due(&task, Duration::from_secs(sweep.interval_secs), now) {
                continue;
            }
            if let Some(id) = self
                .queue
                .enqueue_if_idle(JobType::CleanupSweep, &sweep.payload)
                .await?
            {
                tracing::info!(job_id = ?id, sweep = %sweep.name, "Scheduled cleanup sweep");
                enqueued.push(id);
                self.last_run.insert(task, now);
            }
        }

        Ok(enqueued)
    }

    /// Tick once a second until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(sweeps = self.config.sweeps.len(), "Scheduler started");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_due(Instant::now()).await {
                        tracing::error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Scheduler stopped");
    }
}
