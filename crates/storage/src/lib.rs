//! Pluggable object storage for Stowage.
//!
//! This crate provides:
//! - One `StorageBackend` contract with streaming and inclusive byte-range reads
//! - Backends: local filesystem, S3-compatible, GCS and Azure (with local emulation)
//! - A registry binding repositories to configured backends

pub mod backends;
pub mod error;
pub mod registry;
pub mod traits;

pub use backends::{cloud::CloudBackend, filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageErrorKind, StorageResult};
pub use registry::{ResolvedBackend, StorageRegistry};
pub use traits::{
    ByteRange, ByteStream, ListingOptions, ObjectMeta, ObjectStream, PageStream, SaveOutcome,
    StorageBackend, StreamingUpload, bytes_stream, empty_stream, resolve_range,
};

use std::sync::Arc;
use stowage_core::config::StorageConfig;

/// Create a storage backend from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Gcs {
            bucket,
            prefix,
            service_account_path,
            emulator,
        } => {
            let backend = CloudBackend::gcs(
                bucket,
                prefix.clone(),
                service_account_path.as_deref(),
                emulator.as_ref(),
            )?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Azure {
            account,
            container,
            access_key,
            prefix,
            emulator,
        } => {
            let backend = CloudBackend::azure(
                account,
                container,
                access_key.as_deref(),
                prefix.clone(),
                emulator.as_ref(),
            )?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stowage_core::config::EmulatorConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        store
            .put("hello.txt", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert!(store.exists("hello.txt").await.unwrap());
        assert_eq!(store.backend_name(), "filesystem");
    }

    #[tokio::test]
    async fn from_config_emulated_azure_ok() {
        let config = StorageConfig::Azure {
            account: "devstoreaccount1".into(),
            container: "artifacts".into(),
            access_key: None,
            prefix: Some("stowage".into()),
            emulator: Some(EmulatorConfig::default()),
        };

        let store = from_config(&config).await.unwrap();
        assert_eq!(store.backend_name(), "azure");
        store.put("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn from_config_rejects_invalid() {
        let config = StorageConfig::Gcs {
            bucket: String::new(),
            prefix: None,
            service_account_path: None,
            emulator: None,
        };
        assert!(matches!(
            from_config(&config).await,
            Err(StorageError::Config(_))
        ));
    }
}
