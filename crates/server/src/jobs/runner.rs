//! Dispatch of claimed jobs to the engines.

use super::queue::JobQueue;
use super::sweep::CleanupSweep;
use super::worker::JobHandler;
use crate::context::EngineContext;
use crate::error::EngineResult;
use crate::proxy::ProxyCacheEngine;
use crate::uploads::UploadSessionManager;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use stowage_core::{
    CacheDeletePayload, CacheFillPayload, CleanupSweepPayload, JobType, UploadGcPayload,
};
use stowage_metadata::JobRow;

/// Result of a `cache_delete` job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub entries_deleted: u64,
    pub objects_deleted: u64,
    pub bytes_freed: u64,
}

/// Handles every built-in job type.
#[derive(Clone)]
pub struct EngineJobHandler {
    engine: ProxyCacheEngine,
    uploads: UploadSessionManager,
    sweep: CleanupSweep,
}

impl EngineJobHandler {
    pub fn new(ctx: EngineContext) -> Self {
        let queue = JobQueue::new(ctx.metadata.clone(), ctx.config.jobs.clone());
        Self {
            engine: ProxyCacheEngine::new(ctx.clone()),
            uploads: UploadSessionManager::new(ctx.clone()),
            sweep: CleanupSweep::new(ctx, queue),
        }
    }

    async fn cache_fill(&self, payload: CacheFillPayload) -> EngineResult<serde_json::Value> {
        let state = self.engine.fill(&payload.repository, &payload.path).await?;
        Ok(serde_json::json!({
            "state": state.map(|s| s.as_str()),
            "skipped": state.is_none(),
        }))
    }

    /// Entry rows go first, then their objects; stray objects last.
    async fn cache_delete(&self, payload: CacheDeletePayload) -> EngineResult<DeleteReport> {
        let mut report = DeleteReport::default();
        for key in &payload.entries {
            if let Some(row) = self.engine.delete_entry(key).await? {
                report.entries_deleted += 1;
                report.bytes_freed += row.size();
            }
        }
        for object in &payload.objects {
            if self
                .engine
                .discard_object(&object.backend, &object.key)
                .await?
            {
                report.objects_deleted += 1;
            }
        }
        Ok(report)
    }
}

fn parse<P: DeserializeOwned>(job: &JobRow) -> EngineResult<P> {
    Ok(serde_json::from_str(&job.payload)?)
}

#[async_trait]
impl JobHandler for EngineJobHandler {
    async fn handle(&self, job: &JobRow) -> EngineResult<serde_json::Value> {
        let value = match job.parsed_type()? {
            JobType::CacheFill => self.cache_fill(parse(job)?).await?,
            JobType::CacheDelete => {
                serde_json::to_value(self.cache_delete(parse(job)?).await?)?
            }
            JobType::CleanupSweep => {
                let payload: CleanupSweepPayload = parse(job)?;
                serde_json::to_value(self.sweep.run(&payload).await?)?
            }
            JobType::UploadGc => {
                let payload: UploadGcPayload = parse(job)?;
                serde_json::to_value(self.uploads.gc_expired(payload.batch_size).await?)?
            }
        };
        Ok(value)
    }
}
