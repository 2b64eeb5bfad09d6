//! Metadata store test utilities.

use std::sync::Arc;
use stowage_metadata::{MetadataStore, PostgresStore, SqliteStore};
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// SQLite store in a temp directory, removed on drop.
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let store = SqliteStore::new(temp_dir.path().join("test.db"), None)
            .await
            .expect("Failed to open SQLite store");
        Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
        }
    }
}

/// PostgreSQL store backed by a testcontainer.
pub struct PostgresTestMetadata {
    pub store: Arc<dyn MetadataStore>,
    _container: ContainerAsync<Postgres>,
}

impl PostgresTestMetadata {
    /// Start a container. `Err` means Docker is unavailable; schema or
    /// connection failures panic so regressions are not skipped silently.
    pub async fn new() -> Result<Self, String> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| format!("Failed to start PostgreSQL container: {e}"))?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        // Default credentials from testcontainers-modules postgres
        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let store = PostgresStore::from_url(&url, 5, None)
            .await
            .expect("PostgreSQL store setup failed");

        Ok(Self {
            store: Arc::new(store),
            _container: container,
        })
    }
}

/// Run a test against SQLite, then PostgreSQL when Docker is available and
/// SKIP_POSTGRES_TESTS is unset.
pub async fn run_metadata_test_both<F, Fut>(test_fn: F)
where
    F: Fn(Arc<dyn MetadataStore>) -> Fut + Clone,
    Fut: std::future::Future<Output = ()>,
{
    let sqlite = TestMetadata::new().await;
    test_fn.clone()(sqlite.store.clone()).await;

    if std::env::var("SKIP_POSTGRES_TESTS").is_err() {
        match PostgresTestMetadata::new().await {
            Ok(postgres) => test_fn(postgres.store.clone()).await,
            Err(err) => eprintln!("Skipping PostgreSQL metadata tests: {err}"),
        }
    }
}
