//! Pull-through proxy cache.

use super::coalesce::{FillCoalescer, FillSignal, Slot};
use super::response::{CacheRequest, CacheResponse};
use crate::context::{EngineContext, seconds};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::jobs::JobQueue;
use crate::metrics;
use crate::upstream::{UpstreamBody, UpstreamResponse};
use futures::StreamExt;
use std::time::Instant;
use stowage_core::config::ContentionPolicy;
use stowage_core::{
    CacheFillPayload, CacheState, ContentHash, JobType, StorageKey, Validator, build_key,
    try_normalize_repo_names,
};
use stowage_metadata::CacheEntryRow;
use stowage_storage::ByteRange;
use time::OffsetDateTime;
use uuid::Uuid;

/// Rounds of lookup and fill before a request gives up on the cache.
const MAX_ROUNDS: usize = 3;

/// Storage prefix holding proxied objects.
pub const PROXY_PREFIX: &str = "proxy";

/// Key of a freshly staged proxy object in `repository`.
pub fn proxy_object_key(repository: &str, object_id: Uuid) -> String {
    let id = object_id.to_string();
    match StorageKey::from_segments(&[PROXY_PREFIX, repository, "objects", id.as_str()]) {
        Ok(key) => key.into(),
        Err(_) => format!("{PROXY_PREFIX}/objects/{id}"),
    }
}

/// Cache keys of one artifact: the canonical key new writes use, followed
/// by the legacy encodings older entries may still live under.
#[derive(Clone, Debug)]
pub(crate) struct CacheKeys {
    pub repository: String,
    pub path: String,
    pub canonical: String,
    pub candidates: Vec<String>,
}

impl CacheKeys {
    pub(crate) fn new(repository: &str, path: &str) -> EngineResult<Self> {
        let names = try_normalize_repo_names(repository);
        let tail = build_key(&[path]);
        if names.is_empty() || tail.is_empty() {
            return Err(EngineError::InvalidRequest(format!(
                "empty repository or path: {repository:?} {path:?}"
            )));
        }
        let candidates: Vec<String> = names
            .iter()
            .map(|name| format!("{name}/{tail}"))
            .collect();
        Ok(Self {
            repository: repository.to_string(),
            path: path.to_string(),
            canonical: candidates[0].clone(),
            candidates,
        })
    }
}

/// How a fill attempt ended.
enum Filled {
    /// The cache holds an answer for the key.
    Cached {
        state: CacheState,
        entry: CacheEntryRow,
    },
    /// The fill lock is held elsewhere; serve without caching.
    PassThrough,
}

/// The state reported for a fill, given what was cached before it.
fn state_after_fill(prior: Option<&CacheEntryRow>) -> CacheState {
    if prior.is_some() {
        CacheState::Revalidated
    } else {
        CacheState::Miss
    }
}

fn record(response: &CacheResponse) {
    metrics::CACHE_REQUESTS
        .with_label_values(&[response.cache_state.as_str()])
        .inc();
}

/// Read-through cache over the storage registry.
///
/// Misses and stale entries are filled by at most one fetch per key: requests
/// in this process coalesce on an in-memory leader, and leaders across
/// processes serialize on a distributed lock named after the key.
#[derive(Clone)]
pub struct ProxyCacheEngine {
    ctx: EngineContext,
    queue: JobQueue,
    coalescer: FillCoalescer,
}

impl ProxyCacheEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let queue = JobQueue::new(ctx.metadata.clone(), ctx.config.jobs.clone());
        Self {
            ctx,
            queue,
            coalescer: FillCoalescer::default(),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Serve an artifact, filling or revalidating the cache as needed.
    #[tracing::instrument(skip(self, request), fields(repository = %request.repository, path = %request.path))]
    pub async fn get(&self, request: &CacheRequest) -> EngineResult<CacheResponse> {
        let keys = CacheKeys::new(&request.repository, &request.path)?;

        for _ in 0..MAX_ROUNDS {
            let now = OffsetDateTime::now_utc();
            let entry = self.lookup(&keys).await?;

            if let Some(entry) = &entry
                && entry.is_fresh_at(now)
                && let Some(response) = self.serve(entry, CacheState::Hit, request.range).await?
            {
                self.maybe_refresh_ahead(&keys, entry, now).await;
                record(&response);
                return Ok(response);
            }

            match self.coalescer.join(&keys.canonical) {
                Slot::Leader(guard) => match self.lead_fill(&keys, entry.as_ref()).await {
                    Ok(Filled::Cached { state, entry }) => {
                        guard.finish(FillSignal::Settled(state));
                        if let Some(response) = self.serve(&entry, state, request.range).await? {
                            record(&response);
                            return Ok(response);
                        }
                        // Replaced or evicted between fill and read.
                    }
                    Ok(Filled::PassThrough) => {
                        guard.finish(FillSignal::PassedThrough);
                        return self.pass_through(&keys, entry.as_ref(), "contention").await;
                    }
                    Err(err) => {
                        guard.finish(FillSignal::Failed {
                            kind: err.kind(),
                            message: err.to_string(),
                        });
                        return Err(err);
                    }
                },
                Slot::Follower(mut rx) => {
                    metrics::COALESCED_WAITS.inc();
                    let wait = self.ctx.config.proxy.lock_wait();
                    match tokio::time::timeout(wait, rx.recv()).await {
                        Ok(Ok(FillSignal::Settled(state))) => {
                            if let Some(entry) = self.lookup(&keys).await?
                                && let Some(response) =
                                    self.serve(&entry, state, request.range).await?
                            {
                                record(&response);
                                return Ok(response);
                            }
                        }
                        Ok(Ok(FillSignal::PassedThrough)) => {
                            return self.pass_through(&keys, entry.as_ref(), "contention").await;
                        }
                        Ok(Ok(FillSignal::Failed { kind, message })) => {
                            return Err(EngineError::relayed(kind, message));
                        }
                        // The leader went away without an outcome; start over.
                        Ok(Err(_)) => {}
                        Err(_) => {
                            tracing::debug!(key = %keys.canonical, "Coalesced wait timed out");
                            return self.pass_through(&keys, entry.as_ref(), "wait_timeout").await;
                        }
                    }
                }
            }
        }

        let entry = self.lookup(&keys).await?;
        self.pass_through(&keys, entry.as_ref(), "unsettled").await
    }

    /// Refill an entry from upstream regardless of freshness.
    ///
    /// Returns `None` when another holder of the fill lock is already at it.
    #[tracing::instrument(skip(self))]
    pub async fn fill(&self, repository: &str, path: &str) -> EngineResult<Option<CacheState>> {
        let keys = CacheKeys::new(repository, path)?;
        let lock_name = fill_lock_name(&keys);
        if !self
            .ctx
            .lock
            .try_acquire(&lock_name, self.ctx.config.proxy.lock_ttl())
            .await?
        {
            tracing::debug!(key = %keys.canonical, "Fill already in progress elsewhere");
            return Ok(None);
        }

        let result = self.fill_locked(&keys, None, true).await;
        self.release(&lock_name).await;
        match result? {
            Filled::Cached { state, .. } => Ok(Some(state)),
            Filled::PassThrough => Ok(None),
        }
    }

    /// Remove an artifact from the cache: entry row first, then its object.
    #[tracing::instrument(skip(self))]
    pub async fn evict(&self, repository: &str, path: &str) -> EngineResult<bool> {
        let keys = CacheKeys::new(repository, path)?;
        let mut evicted = false;
        for key in &keys.candidates {
            evicted |= self.delete_entry(key).await?.is_some();
        }
        Ok(evicted)
    }

    /// Delete one entry by key and discard its object. Returns the row.
    pub async fn delete_entry(&self, cache_key: &str) -> EngineResult<Option<CacheEntryRow>> {
        let Some(row) = self.ctx.metadata.delete_cache_entry(cache_key).await? else {
            return Ok(None);
        };
        if let Some(object_key) = &row.object_key {
            self.discard_object(&row.backend, object_key).await?;
        }
        tracing::info!(key = %cache_key, size = row.size_bytes, "Cache entry deleted");
        Ok(Some(row))
    }

    /// Delete an object unless some entry still references it.
    pub async fn discard_object(&self, backend: &str, object_key: &str) -> EngineResult<bool> {
        if self
            .ctx
            .metadata
            .is_object_referenced(backend, object_key)
            .await?
        {
            return Ok(false);
        }
        let deleted = self
            .ctx
            .storage
            .require(backend)?
            .backend
            .delete(object_key)
            .await?;
        if deleted {
            metrics::CACHE_OBJECTS_DELETED.inc();
        }
        Ok(deleted)
    }

    /// First entry found under the canonical key or a legacy encoding.
    async fn lookup(&self, keys: &CacheKeys) -> EngineResult<Option<CacheEntryRow>> {
        for key in &keys.candidates {
            if let Some(entry) = self.ctx.metadata.get_cache_entry(key).await? {
                if key != &keys.canonical {
                    tracing::debug!(legacy_key = %key, canonical = %keys.canonical, "Found entry under legacy key");
                }
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Answer from a cache entry. `None` means its object is gone.
    async fn serve(
        &self,
        entry: &CacheEntryRow,
        state: CacheState,
        range: Option<ByteRange>,
    ) -> EngineResult<Option<CacheResponse>> {
        if entry.negative {
            metrics::CACHE_NEGATIVE_HITS.inc();
            return Ok(Some(CacheResponse::not_found(state)));
        }
        let Some(object_key) = &entry.object_key else {
            return Ok(None);
        };
        let backend = self.ctx.storage.require(&entry.backend)?.backend;

        if let Some(range) = range
            && range.start >= entry.size()
        {
            return Ok(Some(CacheResponse::range_not_satisfiable(entry.size(), state)));
        }

        match backend.get_stream(object_key, range).await {
            Ok(object) => Ok(Some(CacheResponse::from_object(
                entry,
                object,
                range.is_some(),
                state,
            ))),
            Err(e) if e.is_not_found() => {
                tracing::warn!(key = %entry.cache_key, object_key = %object_key, "Cached object missing from storage");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take the distributed fill lock (per the contention policy) and fill.
    async fn lead_fill(
        &self,
        keys: &CacheKeys,
        seen: Option<&CacheEntryRow>,
    ) -> EngineResult<Filled> {
        let proxy = &self.ctx.config.proxy;
        let lock_name = fill_lock_name(keys);

        if !self.ctx.lock.try_acquire(&lock_name, proxy.lock_ttl()).await? {
            metrics::LOCK_CONTENTION.inc();
            match proxy.contention_policy {
                ContentionPolicy::PassThrough => return Ok(Filled::PassThrough),
                ContentionPolicy::Wait => {
                    if let Some(filled) = self.wait_for_holder(keys, &lock_name, seen).await? {
                        return Ok(filled);
                    }
                }
            }
        }

        let result = self.fill_locked(keys, seen, false).await;
        self.release(&lock_name).await;
        result
    }

    /// Poll until the lock holder fills the key, the lock frees up, or the
    /// wait budget runs out. `None` means this caller now holds the lock.
    async fn wait_for_holder(
        &self,
        keys: &CacheKeys,
        lock_name: &str,
        seen: Option<&CacheEntryRow>,
    ) -> EngineResult<Option<Filled>> {
        let proxy = &self.ctx.config.proxy;
        let deadline = tokio::time::Instant::now() + proxy.lock_wait();

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(proxy.lock_poll()).await;

            if let Some(entry) = self.lookup(keys).await?
                && entry.is_fresh_at(OffsetDateTime::now_utc())
            {
                return Ok(Some(Filled::Cached {
                    state: state_after_fill(seen),
                    entry,
                }));
            }
            if self.ctx.lock.try_acquire(lock_name, proxy.lock_ttl()).await? {
                return Ok(None);
            }
        }

        tracing::debug!(key = %keys.canonical, "Fill lock wait expired");
        Ok(Some(Filled::PassThrough))
    }

    async fn release(&self, lock_name: &str) {
        if let Err(e) = self.ctx.lock.release(lock_name).await {
            tracing::warn!(lock = %lock_name, error = %e, "Failed to release fill lock");
        }
    }

    /// Fetch from upstream and update the cache. Caller holds the fill lock.
    async fn fill_locked(
        &self,
        keys: &CacheKeys,
        seen: Option<&CacheEntryRow>,
        force: bool,
    ) -> EngineResult<Filled> {
        // Another process may have filled between our lookup and the lock.
        let current = self.lookup(keys).await?;
        let prior = current.as_ref().or(seen);
        let intact = match prior {
            Some(entry) => self.object_present(entry).await?,
            None => false,
        };
        if !force
            && intact
            && let Some(entry) = &current
            && entry.is_fresh_at(OffsetDateTime::now_utc())
        {
            return Ok(Filled::Cached {
                state: state_after_fill(seen),
                entry: entry.clone(),
            });
        }
        if !intact && let Some(entry) = prior {
            tracing::warn!(key = %entry.cache_key, "Cached object missing, refetching unconditionally");
        }

        let url = self.ctx.upstream_url(&keys.repository, &keys.path)?;
        // Without its bytes an entry can neither be revalidated nor served stale.
        let validator = prior
            .filter(|e| intact && !e.negative && e.object_key.is_some())
            .map(CacheEntryRow::validator)
            .filter(|v| !v.is_empty());

        metrics::UPSTREAM_FETCHES.with_label_values(&["fill"]).inc();
        let started = Instant::now();
        let outcome = match self.ctx.upstream.fetch(&url, validator.as_ref()).await {
            Ok(UpstreamResponse::NotModified { validator: fresh }) => match prior {
                Some(prior) if validator.is_some() => self
                    .refresh_entry(keys, prior, &fresh)
                    .await
                    .map(|entry| Filled::Cached {
                        state: CacheState::Revalidated,
                        entry,
                    }),
                _ => Err(EngineError::UpstreamUnavailable(format!(
                    "{url} answered 304 to an unconditional request"
                ))),
            },
            Ok(UpstreamResponse::Fetched(body)) => self
                .store(keys, &url, prior, body)
                .await
                .map(|entry| Filled::Cached {
                    state: state_after_fill(prior),
                    entry,
                }),
            Ok(UpstreamResponse::NotFound) => self
                .store_negative(keys, &url, prior)
                .await
                .map(|entry| Filled::Cached {
                    state: state_after_fill(prior),
                    entry,
                }),
            Err(e) => Err(e),
        };
        metrics::UPSTREAM_FETCH_DURATION.observe(started.elapsed().as_secs_f64());

        match outcome {
            Err(e) if e.kind() == ErrorKind::UpstreamUnavailable => {
                metrics::UPSTREAM_ERRORS
                    .with_label_values(&[e.kind().as_str()])
                    .inc();
                match prior {
                    Some(prior) if intact => {
                        tracing::warn!(key = %keys.canonical, error = %e, "Upstream failed, serving stale entry");
                        Ok(Filled::Cached {
                            state: CacheState::StaleError,
                            entry: prior.clone(),
                        })
                    }
                    _ => Err(e),
                }
            }
            other => other,
        }
    }

    /// Whether an entry's bytes are still in storage. Negative entries have none.
    async fn object_present(&self, entry: &CacheEntryRow) -> EngineResult<bool> {
        if entry.negative {
            return Ok(true);
        }
        let Some(object_key) = &entry.object_key else {
            return Ok(false);
        };
        let backend = self.ctx.storage.require(&entry.backend)?.backend;
        Ok(backend.exists(object_key).await?)
    }

    /// A 304 keeps the bytes and pushes out freshness.
    async fn refresh_entry(
        &self,
        keys: &CacheKeys,
        prior: &CacheEntryRow,
        fresh: &Validator,
    ) -> EngineResult<CacheEntryRow> {
        let now = OffsetDateTime::now_utc();
        let expires_at = now.saturating_add(self.ctx.ttl_for(&keys.repository));
        let merged = prior.validator().merged_with(fresh);
        let refreshed = self
            .ctx
            .metadata
            .refresh_cache_entry(
                &prior.cache_key,
                now,
                expires_at,
                merged.etag.as_deref(),
                merged.last_modified.as_deref(),
            )
            .await?;
        if !refreshed {
            return Err(EngineError::NotFound(format!(
                "cache entry {} vanished during revalidation",
                prior.cache_key
            )));
        }
        tracing::debug!(key = %prior.cache_key, "Cache entry revalidated");
        Ok(CacheEntryRow {
            fetched_at: now,
            expires_at,
            etag: merged.etag,
            last_modified: merged.last_modified,
            ..prior.clone()
        })
    }

    /// Stage the upstream body under a fresh object key, then swap the entry.
    async fn store(
        &self,
        keys: &CacheKeys,
        url: &str,
        prior: Option<&CacheEntryRow>,
        body: UpstreamBody,
    ) -> EngineResult<CacheEntryRow> {
        let resolved = self.ctx.storage.resolve(&keys.repository);
        let object_key = proxy_object_key(&keys.repository, Uuid::new_v4());

        let UpstreamBody {
            mut stream,
            validator,
            content_type,
            ..
        } = body;

        let mut upload = resolved.backend.put_stream(&object_key).await?;
        let mut hasher = ContentHash::hasher();
        let mut size: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Err(abort_err) = upload.abort().await {
                        tracing::warn!(object_key = %object_key, error = %abort_err, "Failed to abort staged object");
                    }
                    return Err(e);
                }
            };
            hasher.update(&chunk);
            size += chunk.len() as u64;
            if let Err(e) = upload.write(chunk).await {
                if let Err(abort_err) = upload.abort().await {
                    tracing::warn!(object_key = %object_key, error = %abort_err, "Failed to abort staged object");
                }
                return Err(e.into());
            }
        }
        upload.finish().await?;
        metrics::CACHE_BYTES_STORED.inc_by(size);

        let now = OffsetDateTime::now_utc();
        let row = CacheEntryRow {
            cache_key: keys.canonical.clone(),
            repository: keys.repository.clone(),
            path: keys.path.clone(),
            backend: resolved.key.clone(),
            object_key: Some(object_key),
            upstream_url: url.to_string(),
            fetched_at: now,
            expires_at: now.saturating_add(self.ctx.ttl_for(&keys.repository)),
            etag: validator.etag,
            last_modified: validator.last_modified,
            content_type,
            size_bytes: i64::try_from(size).unwrap_or(i64::MAX),
            content_hash: Some(hasher.finalize().to_hex()),
            negative: false,
        };
        self.swap(keys, prior, &row).await?;
        tracing::info!(key = %row.cache_key, size, "Cached upstream artifact");
        Ok(row)
    }

    async fn store_negative(
        &self,
        keys: &CacheKeys,
        url: &str,
        prior: Option<&CacheEntryRow>,
    ) -> EngineResult<CacheEntryRow> {
        let now = OffsetDateTime::now_utc();
        let row = CacheEntryRow {
            cache_key: keys.canonical.clone(),
            repository: keys.repository.clone(),
            path: keys.path.clone(),
            backend: self.ctx.storage.resolve(&keys.repository).key,
            object_key: None,
            upstream_url: url.to_string(),
            fetched_at: now,
            expires_at: now.saturating_add(self.ctx.negative_ttl()),
            etag: None,
            last_modified: None,
            content_type: None,
            size_bytes: 0,
            content_hash: None,
            negative: true,
        };
        self.swap(keys, prior, &row).await?;
        tracing::debug!(key = %row.cache_key, "Cached upstream not-found");
        Ok(row)
    }

    /// Replace the entry row, then drop whatever it used to point at.
    async fn swap(
        &self,
        keys: &CacheKeys,
        prior: Option<&CacheEntryRow>,
        row: &CacheEntryRow,
    ) -> EngineResult<()> {
        let previous = self.ctx.metadata.replace_cache_entry(row).await?;

        if let Some(previous) = &previous
            && let Some(old_key) = &previous.object_key
            && Some(old_key) != row.object_key.as_ref()
        {
            self.discard_after_swap(&previous.backend, old_key).await;
        }

        // Entries found under a legacy key move to the canonical one.
        if let Some(prior) = prior
            && prior.cache_key != keys.canonical
            && let Some(legacy) = self.ctx.metadata.delete_cache_entry(&prior.cache_key).await?
            && let Some(old_key) = &legacy.object_key
        {
            self.discard_after_swap(&legacy.backend, old_key).await;
        }
        Ok(())
    }

    async fn discard_after_swap(&self, backend: &str, object_key: &str) {
        if let Err(e) = self.discard_object(backend, object_key).await {
            // The orphaned-object sweep picks it up later.
            tracing::warn!(backend, object_key, error = %e, "Failed to delete replaced object");
        }
    }

    /// Fetch straight from upstream without touching the cache.
    async fn pass_through(
        &self,
        keys: &CacheKeys,
        stale: Option<&CacheEntryRow>,
        reason: &str,
    ) -> EngineResult<CacheResponse> {
        metrics::PASS_THROUGH_FETCHES.with_label_values(&[reason]).inc();
        metrics::UPSTREAM_FETCHES
            .with_label_values(&["pass_through"])
            .inc();
        let url = self.ctx.upstream_url(&keys.repository, &keys.path)?;

        let response = match self.ctx.upstream.fetch(&url, None).await {
            Ok(UpstreamResponse::Fetched(body)) => {
                let mut headers = Vec::new();
                if let Some(content_type) = &body.content_type {
                    headers.push(("Content-Type".to_string(), content_type.clone()));
                }
                if let Some(len) = body.content_length {
                    headers.push(("Content-Length".to_string(), len.to_string()));
                }
                if let Some(etag) = &body.validator.etag {
                    headers.push(("ETag".to_string(), etag.clone()));
                }
                CacheResponse {
                    status: 200,
                    headers,
                    size: body.content_length,
                    body: body.stream,
                    cache_state: CacheState::Miss,
                }
            }
            Ok(UpstreamResponse::NotFound) => CacheResponse::not_found(CacheState::Miss),
            Ok(UpstreamResponse::NotModified { .. }) => {
                return Err(EngineError::UpstreamUnavailable(format!(
                    "{url} answered 304 to an unconditional request"
                )));
            }
            Err(e) if e.kind() == ErrorKind::UpstreamUnavailable => {
                metrics::UPSTREAM_ERRORS
                    .with_label_values(&[e.kind().as_str()])
                    .inc();
                let Some(stale) = stale else {
                    return Err(e);
                };
                match self.serve(stale, CacheState::StaleError, None).await? {
                    Some(response) => response,
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };
        record(&response);
        Ok(response)
    }

    /// Enqueue a background refill when a hit is close to expiry.
    async fn maybe_refresh_ahead(
        &self,
        keys: &CacheKeys,
        entry: &CacheEntryRow,
        now: OffsetDateTime,
    ) {
        let Some(window_secs) = self.ctx.config.proxy.refresh_ahead_secs else {
            return;
        };
        if entry.negative || entry.expires_at - now > seconds(window_secs) {
            return;
        }

        let lock_name = format!("refresh:{}", keys.canonical);
        let window = std::time::Duration::from_secs(window_secs.max(1));
        let result = async {
            // The lock is left to expire so one refresh is queued per window.
            if self.ctx.lock.try_acquire(&lock_name, window).await? {
                let payload = CacheFillPayload {
                    repository: keys.repository.clone(),
                    path: keys.path.clone(),
                };
                self.queue.enqueue(JobType::CacheFill, &payload).await?;
                tracing::debug!(key = %keys.canonical, "Queued refresh-ahead fill");
            }
            Ok::<_, EngineError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(key = %keys.canonical, error = %e, "Failed to queue refresh-ahead fill");
        }
    }
}

fn fill_lock_name(keys: &CacheKeys) -> String {
    format!("fill:{}", keys.canonical)
}
