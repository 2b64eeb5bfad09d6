//! Engine test utilities.

use super::upstream::MockUpstream;
use std::sync::Arc;
use stowage_core::config::{AppConfig, RepositoryConfig};
use stowage_metadata::{MetadataStore, SqliteStore};
use stowage_server::{
    EngineContext, EngineJobHandler, JobQueue, JobWorker, ProxyCacheEngine, UploadSessionManager,
};
use stowage_storage::{ResolvedBackend, StorageRegistry};
use tempfile::TempDir;

/// Upstream base URL of the `npm` test repository.
pub const NPM_UPSTREAM: &str = "https://registry.npmjs.test";

/// A test engine with temporary storage, SQLite metadata and a mock upstream.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestEngine {
    pub ctx: EngineContext,
    pub upstream: Arc<MockUpstream>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEngine {
    /// Create a new test engine with default configuration.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test engine, letting `configure` adjust the configuration.
    pub async fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let mut config = AppConfig::for_testing(temp_dir.path());
        config.repositories.insert(
            "npm".to_string(),
            RepositoryConfig {
                storage: None,
                upstream: Some(NPM_UPSTREAM.to_string()),
                ttl_secs: None,
            },
        );
        // Keep lock waits short so contention tests finish quickly.
        config.proxy.lock_wait_ms = 500;
        config.proxy.lock_poll_ms = 20;
        config.jobs.backoff_base_ms = 10;
        config.jobs.backoff_max_ms = 50;
        configure(&mut config);

        let storage = StorageRegistry::from_config(&config.storage, &config.repositories)
            .await
            .expect("Failed to create storage registry");

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let upstream = Arc::new(MockUpstream::new());
        let ctx = EngineContext::new(config, storage, metadata, upstream.clone(), "test-worker");

        Self {
            ctx,
            upstream,
            _temp_dir: temp_dir,
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.ctx.metadata
    }

    /// The backend every test repository resolves to.
    pub fn storage(&self) -> ResolvedBackend {
        self.ctx.storage.resolve("npm")
    }

    /// Upstream URL of `path` in the `npm` repository.
    pub fn npm_url(&self, path: &str) -> String {
        format!("{NPM_UPSTREAM}/{path}")
    }

    pub fn proxy(&self) -> ProxyCacheEngine {
        ProxyCacheEngine::new(self.ctx.clone())
    }

    pub fn uploads(&self) -> UploadSessionManager {
        UploadSessionManager::new(self.ctx.clone())
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.ctx.metadata.clone(), self.ctx.config.jobs.clone())
    }

    /// A worker running the built-in job handlers.
    pub fn worker(&self) -> JobWorker {
        JobWorker::new(
            self.queue(),
            Arc::new(EngineJobHandler::new(self.ctx.clone())),
        )
    }
}
