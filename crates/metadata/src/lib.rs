//! Durable metadata for the Stowage engine.
//!
//! This crate provides:
//! - The job table behind the lease-based work queue
//! - Proxy cache entries with freshness and validators
//! - Resumable upload sessions
//! - Named lease locks shared across processes

pub mod error;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use postgres::PostgresStore;
pub use models::{
    CacheEntryCursor, CacheEntryRow, CacheEntryStats, JobRow, LockRow, UploadSessionRow,
};
pub use repos::{CacheEntryRepo, ClaimRequest, JobRepo, LockRepo, UploadRepo};
pub use store::{MetadataStore, SqliteStore};

use stowage_core::config::MetadataConfig;
use std::sync::Arc;

/// Open the configured store, creating or migrating its schema.
///
/// PostgreSQL accepts either a full `url` or discrete connection fields, so
/// the password can be injected through its own environment variable.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    let store: Arc<dyn MetadataStore> = match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            tracing::info!(path = %path.display(), "Opening SQLite metadata store");
            Arc::new(SqliteStore::new(path, *query_timeout_secs).await?)
        }
        MetadataConfig::Postgres {
            url: Some(url),
            max_connections,
            statement_timeout_ms,
            ..
        } => {
            tracing::info!("Connecting to PostgreSQL metadata store by URL");
            Arc::new(PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?)
        }
        MetadataConfig::Postgres {
            url: None,
            host: Some(host),
            database: Some(database),
            port,
            username,
            password,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            tracing::info!(%host, %database, "Connecting to PostgreSQL metadata store");
            Arc::new(
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?,
            )
        }
        MetadataConfig::Postgres { .. } => {
            return Err(MetadataError::Config(
                "postgres metadata needs either `url` or both `host` and `database`".to_string(),
            ));
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_core::config::MetadataConfig;

    #[tokio::test]
    async fn test_postgres_without_target_is_rejected() {
        let config = MetadataConfig::Postgres {
            url: None,
            host: Some("db.internal".to_string()),
            port: None,
            username: None,
            password: None,
            database: None,
            ssl_mode: None,
            max_connections: 4,
            statement_timeout_ms: None,
        };
        let err = from_config(&config).await.err().unwrap();
        assert!(matches!(err, MetadataError::Config(_)));
    }

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("metadata.db");
        let config = MetadataConfig::Sqlite {
            path: db_path.clone(),
            query_timeout_secs: None,
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }
}
