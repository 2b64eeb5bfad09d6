//! Shared engine context.

use crate::error::{EngineError, EngineResult};
use crate::lock::{DistributedLock, MetadataLock};
use crate::upstream::{HttpUpstream, Upstream};
use std::sync::Arc;
use stowage_core::config::AppConfig;
use stowage_metadata::MetadataStore;
use stowage_storage::StorageRegistry;
use uuid::Uuid;

/// Everything the engines need, passed explicitly to each of them.
///
/// Cloning is cheap; all members are reference counted.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<AppConfig>,
    pub storage: Arc<StorageRegistry>,
    pub metadata: Arc<dyn MetadataStore>,
    pub lock: Arc<dyn DistributedLock>,
    pub upstream: Arc<dyn Upstream>,
    /// Identifies this process in lock ownership and logs.
    pub worker_id: Arc<str>,
}

impl EngineContext {
    /// Assemble a context, using a metadata-backed lease lock owned by
    /// `worker_id` plus a per-process suffix.
    pub fn new(
        config: AppConfig,
        storage: StorageRegistry,
        metadata: Arc<dyn MetadataStore>,
        upstream: Arc<dyn Upstream>,
        worker_id: impl Into<String>,
    ) -> Self {
        let worker_id: String = worker_id.into();
        let owner = format!("{worker_id}:{}", Uuid::new_v4());
        let lock = Arc::new(MetadataLock::new(metadata.clone(), owner));
        Self {
            config: Arc::new(config),
            storage: Arc::new(storage),
            metadata,
            lock,
            upstream,
            worker_id: worker_id.into(),
        }
    }

    /// Replace the distributed lock implementation.
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = lock;
        self
    }

    /// Connect storage, metadata and the HTTP upstream described by `config`.
    pub async fn from_config(
        config: AppConfig,
        worker_id: impl Into<String>,
    ) -> EngineResult<Self> {
        config.validate().map_err(EngineError::Config)?;

        let storage = StorageRegistry::from_config(&config.storage, &config.repositories).await?;
        tracing::info!(backends = ?storage.keys(), "Storage backends initialized");

        let metadata = stowage_metadata::from_config(&config.metadata).await?;
        tracing::info!("Metadata store initialized");

        let upstream = Arc::new(HttpUpstream::new(config.proxy.upstream_timeout())?);
        Ok(Self::new(config, storage, metadata, upstream, worker_id))
    }

    /// Upstream URL of `path` in `repository`.
    pub fn upstream_url(&self, repository: &str, path: &str) -> EngineResult<String> {
        let base = self
            .config
            .repositories
            .get(repository)
            .and_then(|repo| repo.upstream.as_deref())
            .ok_or_else(|| {
                EngineError::InvalidRequest(format!(
                    "repository '{repository}' has no upstream configured"
                ))
            })?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }

    /// Freshness lifetime of entries in `repository`.
    pub fn ttl_for(&self, repository: &str) -> time::Duration {
        let secs = self
            .config
            .repositories
            .get(repository)
            .and_then(|repo| repo.ttl_secs)
            .unwrap_or(self.config.proxy.default_ttl_secs);
        seconds(secs)
    }

    pub fn negative_ttl(&self) -> time::Duration {
        seconds(self.config.proxy.negative_ttl_secs)
    }
}

/// Saturating conversion of a configured second count.
pub(crate) fn seconds(secs: u64) -> time::Duration {
    time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("storage", &self.storage)
            .field("worker_id", &self.worker_id)
            .field("lock_owner", &self.lock.owner())
            .finish_non_exhaustive()
    }
}
