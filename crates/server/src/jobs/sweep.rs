//! Cleanup sweeps: select cache entries or stray objects and enqueue their
//! deletion in deterministic batches.

use super::queue::JobQueue;
use crate::context::{EngineContext, seconds};
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::proxy::PROXY_PREFIX;
use futures::StreamExt;
use serde::Serialize;
use stowage_core::{
    CacheDeletePayload, CleanupSweepPayload, JobId, JobType, ObjectRef, SweepSelector,
    normalize_storage_key,
};
use stowage_metadata::{CacheEntryCursor, CacheEntryRow};
use stowage_storage::ListingOptions;
use time::OffsetDateTime;

/// Outcome of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entries or objects examined.
    pub scanned: u64,
    /// Entries or objects chosen for deletion.
    pub selected: u64,
    pub selected_bytes: u64,
    /// Delete batches formed; enqueued unless `dry_run`.
    pub batches: u64,
    /// Ids of the enqueued `cache_delete` jobs.
    pub jobs: Vec<JobId>,
    pub dry_run: bool,
}

/// Per-entry verdict while scanning oldest-first.
enum Decision {
    Select,
    /// No later entry can match.
    Stop,
}

fn selector_kind(selector: &SweepSelector) -> &'static str {
    match selector {
        SweepSelector::OlderThan { .. } => "older_than",
        SweepSelector::KeepNewest { .. } => "keep_newest",
        SweepSelector::MaxTotalBytes { .. } => "max_total_bytes",
        SweepSelector::Keys { .. } => "keys",
        SweepSelector::OrphanedObjects { .. } => "orphaned_objects",
    }
}

/// Accumulates selections and turns each full batch into a `cache_delete` job.
struct DeleteBatcher<'a> {
    queue: &'a JobQueue,
    batch_size: usize,
    kind: &'static str,
    pending: CacheDeletePayload,
    report: SweepReport,
}

impl<'a> DeleteBatcher<'a> {
    fn new(queue: &'a JobQueue, payload: &CleanupSweepPayload) -> Self {
        Self {
            queue,
            batch_size: payload.delete_batch_size as usize,
            kind: selector_kind(&payload.selector),
            pending: CacheDeletePayload::default(),
            report: SweepReport {
                dry_run: payload.dry_run,
                ..SweepReport::default()
            },
        }
    }

    async fn entry(&mut self, entry: &CacheEntryRow) -> EngineResult<()> {
        self.pending.entries.push(entry.cache_key.clone());
        self.selected(entry.size()).await
    }

    async fn object(&mut self, object: ObjectRef, size: u64) -> EngineResult<()> {
        self.pending.objects.push(object);
        self.selected(size).await
    }

    async fn selected(&mut self, size: u64) -> EngineResult<()> {
        self.report.selected += 1;
        self.report.selected_bytes += size;
        metrics::SWEEP_ENTRIES_SELECTED
            .with_label_values(&[self.kind])
            .inc();
        if self.pending.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> EngineResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut batch = std::mem::take(&mut self.pending);
        batch.entries.sort();
        batch.objects.sort();
        self.report.batches += 1;

        if self.report.dry_run {
            tracing::info!(
                entries = batch.entries.len(),
                objects = batch.objects.len(),
                "Dry run: would enqueue delete batch"
            );
            return Ok(());
        }
        let job_id = self.queue.enqueue(JobType::CacheDelete, &batch).await?;
        self.report.jobs.push(job_id);
        Ok(())
    }

    async fn finish(mut self) -> EngineResult<SweepReport> {
        self.flush().await?;
        Ok(self.report)
    }
}

/// Runs `cleanup_sweep` payloads.
#[derive(Clone)]
pub struct CleanupSweep {
    ctx: EngineContext,
    queue: JobQueue,
}

impl CleanupSweep {
    pub fn new(ctx: EngineContext, queue: JobQueue) -> Self {
        Self { ctx, queue }
    }

    /// Scan, select and enqueue deletions.
    ///
    /// Entries are visited oldest-first, one page at a time. Each batch is
    /// sorted by key, so rerunning a sweep over unchanged data yields the
    /// same batches.
    #[tracing::instrument(skip(self, payload), fields(selector = selector_kind(&payload.selector)))]
    pub async fn run(&self, payload: &CleanupSweepPayload) -> EngineResult<SweepReport> {
        payload.validate()?;
        let mut batcher = DeleteBatcher::new(&self.queue, payload);
        let repository = payload.repository.as_deref();
        let now = OffsetDateTime::now_utc();

        match &payload.selector {
            SweepSelector::OlderThan { max_age_secs } => {
                let cutoff = now.saturating_sub(seconds(*max_age_secs));
                self.scan_entries(payload, &mut batcher, |entry| {
                    if entry.fetched_at < cutoff {
                        Decision::Select
                    } else {
                        Decision::Stop
                    }
                })
                .await?;
            }
            SweepSelector::KeepNewest { count } => {
                let stats = self.ctx.metadata.cache_entry_stats(repository).await?;
                let mut remaining = stats.count.saturating_sub(*count);
                self.scan_entries(payload, &mut batcher, |_| {
                    if remaining == 0 {
                        return Decision::Stop;
                    }
                    remaining -= 1;
                    Decision::Select
                })
                .await?;
            }
            SweepSelector::MaxTotalBytes { bytes } => {
                let stats = self.ctx.metadata.cache_entry_stats(repository).await?;
                let mut excess = stats.total_bytes.saturating_sub(*bytes);
                self.scan_entries(payload, &mut batcher, |entry| {
                    if excess == 0 {
                        return Decision::Stop;
                    }
                    excess = excess.saturating_sub(entry.size());
                    Decision::Select
                })
                .await?;
            }
            SweepSelector::Keys { keys } => {
                self.select_keys(keys, repository, &mut batcher).await?;
            }
            SweepSelector::OrphanedObjects {
                backend,
                grace_secs,
            } => {
                let cutoff = now.saturating_sub(seconds(*grace_secs));
                self.select_orphans(backend, repository, cutoff, payload, &mut batcher)
                    .await?;
            }
        }

        let report = batcher.finish().await?;
        tracing::info!(
            scanned = report.scanned,
            selected = report.selected,
            selected_bytes = report.selected_bytes,
            batches = report.batches,
            dry_run = report.dry_run,
            "Cleanup sweep finished"
        );
        Ok(report)
    }

    async fn scan_entries<F>(
        &self,
        payload: &CleanupSweepPayload,
        batcher: &mut DeleteBatcher<'_>,
        mut decide: F,
    ) -> EngineResult<()>
    where
        F: FnMut(&CacheEntryRow) -> Decision + Send,
    {
        let mut cursor: Option<CacheEntryCursor> = None;
        loop {
            let page = self
                .ctx
                .metadata
                .list_cache_entries(
                    payload.repository.as_deref(),
                    cursor.as_ref(),
                    payload.page_size,
                )
                .await?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            cursor = Some(CacheEntryCursor::from(last));
            let full_page = page.len() >= payload.page_size as usize;

            for entry in &page {
                batcher.report.scanned += 1;
                match decide(entry) {
                    Decision::Select => batcher.entry(entry).await?,
                    Decision::Stop => return Ok(()),
                }
            }
            if !full_page {
                return Ok(());
            }
        }
    }

    async fn select_keys(
        &self,
        keys: &[String],
        repository: Option<&str>,
        batcher: &mut DeleteBatcher<'_>,
    ) -> EngineResult<()> {
        let mut keys: Vec<String> = keys
            .iter()
            .map(|key| normalize_storage_key(key))
            .filter(|key| !key.is_empty())
            .collect();
        keys.sort();
        keys.dedup();

        for key in &keys {
            batcher.report.scanned += 1;
            let Some(entry) = self.ctx.metadata.get_cache_entry(key).await? else {
                tracing::debug!(key = %key, "Sweep key has no cache entry");
                continue;
            };
            if repository.is_some_and(|repo| repo != entry.repository) {
                continue;
            }
            batcher.entry(&entry).await?;
        }
        Ok(())
    }

    /// Proxy objects older than `cutoff` that no entry references.
    async fn select_orphans(
        &self,
        backend: &str,
        repository: Option<&str>,
        cutoff: OffsetDateTime,
        payload: &CleanupSweepPayload,
        batcher: &mut DeleteBatcher<'_>,
    ) -> EngineResult<()> {
        let resolved = self.ctx.storage.require(backend)?;
        let prefix = match repository {
            Some(repo) => {
                let repo = normalize_storage_key(repo);
                if repo.is_empty() {
                    return Err(EngineError::InvalidRequest(
                        "empty repository in sweep".to_string(),
                    ));
                }
                format!("{PROXY_PREFIX}/{repo}/")
            }
            None => format!("{PROXY_PREFIX}/"),
        };

        let mut pages = resolved
            .backend
            .list_pages(&prefix, ListingOptions::new(payload.page_size as usize));
        while let Some(page) = pages.next().await {
            let mut page = page?;
            page.sort();
            for key in page {
                batcher.report.scanned += 1;
                if !key.contains("/objects/") {
                    continue;
                }
                let meta = match resolved.backend.head(&key).await {
                    Ok(meta) => meta,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e.into()),
                };
                // Objects without a modification time are never old enough.
                if !meta.last_modified.is_some_and(|modified| modified < cutoff) {
                    continue;
                }
                if self
                    .ctx
                    .metadata
                    .is_object_referenced(&resolved.key, &key)
                    .await?
                {
                    continue;
                }
                let object = ObjectRef {
                    backend: resolved.key.clone(),
                    key,
                };
                batcher.object(object, meta.size).await?;
            }
        }
        Ok(())
    }
}
