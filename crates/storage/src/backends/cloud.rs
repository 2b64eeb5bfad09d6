//! Google Cloud Storage and Azure Blob backends built on `object_store`.
//!
//! Both providers share one adapter; only construction differs. Either can
//! run against a local emulation (in-memory or a directory) for tests and
//! development.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteRange, ListingOptions, ObjectMeta, ObjectStream, PageStream, StorageBackend,
    StreamingUpload, empty_stream, resolve_range,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{GetOptions, GetRange, ObjectStore, PutPayload, WriteMultipart};
use std::path::Path;
use std::sync::Arc;
use stowage_core::config::EmulatorConfig;
use tracing::instrument;

/// Buffered bytes before a streaming upload switches to multipart.
const PART_SIZE: usize = 5 * 1024 * 1024;

/// Parts uploaded concurrently by a multipart writer.
const MAX_CONCURRENT_PARTS: usize = 4;

/// Map an `object_store` error for `key` onto the storage taxonomy.
fn map_object_store_error(err: object_store::Error, key: &str) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
        object_store::Error::PermissionDenied { .. }
        | object_store::Error::Unauthenticated { .. } => {
            StorageError::PermissionDenied(key.to_string())
        }
        object_store::Error::InvalidPath { source } => {
            StorageError::InvalidKey(format!("{key}: {source}"))
        }
        other => StorageError::Backend(Box::new(other)),
    }
}

/// Object storage on GCS or Azure.
pub struct CloudBackend {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    name: &'static str,
}

impl std::fmt::Debug for CloudBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudBackend")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl CloudBackend {
    /// Wrap an existing store.
    pub fn from_store(
        store: Arc<dyn ObjectStore>,
        prefix: Option<String>,
        name: &'static str,
    ) -> Self {
        Self {
            store,
            prefix: prefix
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
            name,
        }
    }

    /// Google Cloud Storage. Without a service account file the builder
    /// picks up application default credentials from the environment.
    pub fn gcs(
        bucket: &str,
        prefix: Option<String>,
        service_account_path: Option<&Path>,
        emulator: Option<&EmulatorConfig>,
    ) -> StorageResult<Self> {
        if let Some(emulator) = emulator {
            return Self::emulated(emulator, prefix, "gcs");
        }

        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(path) = service_account_path {
            builder = builder.with_service_account_path(path.to_string_lossy());
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::Config(format!("failed to create GCS client: {e}")))?;
        Ok(Self::from_store(Arc::new(store), prefix, "gcs"))
    }

    /// Azure Blob Storage.
    pub fn azure(
        account: &str,
        container: &str,
        access_key: Option<&str>,
        prefix: Option<String>,
        emulator: Option<&EmulatorConfig>,
    ) -> StorageResult<Self> {
        if let Some(emulator) = emulator {
            return Self::emulated(emulator, prefix, "azure");
        }

        let mut builder = MicrosoftAzureBuilder::from_env()
            .with_account(account)
            .with_container_name(container);
        if let Some(key) = access_key {
            builder = builder.with_access_key(key);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::Config(format!("failed to create Azure client: {e}")))?;
        Ok(Self::from_store(Arc::new(store), prefix, "azure"))
    }

    /// A local stand-in for a cloud store.
    pub fn emulated(
        emulator: &EmulatorConfig,
        prefix: Option<String>,
        name: &'static str,
    ) -> StorageResult<Self> {
        let store: Arc<dyn ObjectStore> = match &emulator.path {
            Some(path) => {
                std::fs::create_dir_all(path)?;
                Arc::new(LocalFileSystem::new_with_prefix(path).map_err(|e| {
                    StorageError::Config(format!(
                        "failed to create emulated store at {}: {e}",
                        path.display()
                    ))
                })?)
            }
            None => Arc::new(InMemory::new()),
        };
        Ok(Self::from_store(store, prefix, name))
    }

    /// In-memory store, mostly for tests.
    pub fn memory(name: &'static str) -> Self {
        Self::from_store(Arc::new(InMemory::new()), None, name)
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) if key.is_empty() => prefix.clone(),
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    fn object_path(&self, key: &str) -> StorageResult<ObjectPath> {
        let full = self.full_key(key);
        ObjectPath::parse(&full).map_err(|e| StorageError::InvalidKey(format!("{key}: {e}")))
    }

    fn strip_prefix(&self, full_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full_key)
                .to_string(),
            None => full_key.to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for CloudBackend {
    #[instrument(skip(self), fields(backend = self.name))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.object_path(key)?;
        let meta = self
            .store
            .head(&path)
            .await
            .map_err(|e| map_object_store_error(e, key))?;

        Ok(ObjectMeta {
            size: meta.size as u64,
            last_modified: time::OffsetDateTime::from_unix_timestamp(meta.last_modified.timestamp())
                .ok(),
            content_type: None,
        })
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let path = self.object_path(key)?;
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(map_object_store_error(e, key)),
        };
        let bytes = result
            .bytes()
            .await
            .map_err(|e| map_object_store_error(e, key))?;
        Ok(Some(bytes))
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn get_stream(
        &self,
        key: &str,
        range: Option<ByteRange>,
    ) -> StorageResult<ObjectStream> {
        let path = self.object_path(key)?;
        let size = self.head(key).await?.size;
        let span = resolve_range(range, size)?;
        if span.is_empty() {
            return Ok(ObjectStream {
                stream: empty_stream(),
                size,
                span,
            });
        }

        let options = GetOptions {
            range: range.map(|_| GetRange::Bounded(span.clone())),
            ..Default::default()
        };
        let result = self
            .store
            .get_opts(&path, options)
            .await
            .map_err(|e| map_object_store_error(e, key))?;

        let owned_key = key.to_string();
        let stream = result
            .into_stream()
            .map(move |chunk| chunk.map_err(|e| map_object_store_error(e, &owned_key)));

        Ok(ObjectStream {
            stream: Box::pin(stream),
            size,
            span,
        })
    }

    #[instrument(skip(self, data), fields(backend = self.name, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.object_path(key)?;
        self.store
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|e| map_object_store_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        Ok(Box::new(CloudUpload {
            store: Arc::clone(&self.store),
            path: self.object_path(key)?,
            key: key.to_string(),
            buffer: Vec::new(),
            writer: None,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn delete(&self, key: &str) -> StorageResult<bool> {
        if !self.exists(key).await? {
            return Ok(false);
        }
        let path = self.object_path(key)?;
        match self.store.delete(&path).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(map_object_store_error(e, key)),
        }
    }

    fn list_pages<'a>(&'a self, prefix: &str, options: ListingOptions) -> PageStream<'a> {
        let page_size = options.normalized_page_size();
        let full_prefix = self.full_key(prefix);
        // object_store lists whole path segments, so list the deepest
        // complete directory and filter the partial segment by string.
        let dir = match full_prefix.rfind('/') {
            Some(idx) => full_prefix[..idx].to_string(),
            None => String::new(),
        };
        let owned_prefix = prefix.to_string();

        let stream = async_stream::try_stream! {
            let dir_path = ObjectPath::parse(&dir)
                .map_err(|e| StorageError::InvalidKey(format!("{owned_prefix}: {e}")))?;
            let listing_root = if dir.is_empty() { None } else { Some(&dir_path) };
            let mut entries = self.store.list(listing_root);
            let mut page = Vec::with_capacity(page_size);

            while let Some(entry) = entries.next().await {
                let meta = entry.map_err(|e| map_object_store_error(e, &owned_prefix))?;
                let location = meta.location.to_string();
                if !location.starts_with(&full_prefix) {
                    continue;
                }
                page.push(self.strip_prefix(&location));
                if page.len() >= page_size {
                    yield std::mem::replace(&mut page, Vec::with_capacity(page_size));
                }
            }
            if !page.is_empty() {
                yield page;
            }
        };

        Box::pin(stream)
    }

    fn backend_name(&self) -> &'static str {
        self.name
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn health_check(&self) -> StorageResult<()> {
        let marker_key = ".stowage-health-check";
        self.put(marker_key, Bytes::from_static(b"health-check"))
            .await?;
        self.delete(marker_key).await?;
        Ok(())
    }
}

/// Streaming upload that stays in memory until a full part accumulates.
struct CloudUpload {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    key: String,
    buffer: Vec<u8>,
    writer: Option<WriteMultipart>,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for CloudUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.bytes_written += data.len() as u64;

        if self.writer.is_none() {
            self.buffer.extend_from_slice(&data);
            if self.buffer.len() < PART_SIZE {
                return Ok(());
            }
            let upload = self
                .store
                .put_multipart(&self.path)
                .await
                .map_err(|e| map_object_store_error(e, &self.key))?;
            let mut writer = WriteMultipart::new_with_chunk_size(upload, PART_SIZE);
            writer.write(&std::mem::take(&mut self.buffer));
            self.writer = Some(writer);
        } else if let Some(writer) = self.writer.as_mut() {
            writer.write(&data);
        }

        if let Some(writer) = self.writer.as_mut() {
            writer
                .wait_for_capacity(MAX_CONCURRENT_PARTS)
                .await
                .map_err(|e| map_object_store_error(e, &self.key))?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        match self.writer.take() {
            Some(writer) => {
                writer
                    .finish()
                    .await
                    .map_err(|e| map_object_store_error(e, &self.key))?;
            }
            None => {
                let body = Bytes::from(std::mem::take(&mut self.buffer));
                self.store
                    .put(&self.path, PutPayload::from(body))
                    .await
                    .map_err(|e| map_object_store_error(e, &self.key))?;
            }
        }
        Ok(self.bytes_written)
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .abort()
                .await
                .map_err(|e| map_object_store_error(e, &self.key))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_roundtrip_and_range() {
        let backend = CloudBackend::memory("gcs");
        backend
            .put("a/b/obj", Bytes::from_static(b"abcdefghijkl"))
            .await
            .unwrap();

        assert_eq!(
            backend.get("a/b/obj").await.unwrap().unwrap(),
            Bytes::from_static(b"abcdefghijkl")
        );
        let ranged = backend
            .get_stream("a/b/obj", Some(ByteRange::new(2, 5)))
            .await
            .unwrap();
        assert_eq!(ranged.size, 12);
        assert_eq!(ranged.span, 2..6);
        assert_eq!(ranged.collect_bytes().await.unwrap(), Bytes::from_static(b"cdef"));

        assert!(backend.get("missing").await.unwrap().is_none());
        assert!(backend.delete("a/b/obj").await.unwrap());
        assert!(!backend.delete("a/b/obj").await.unwrap());
    }

    #[tokio::test]
    async fn test_prefix_is_applied_and_stripped() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let scoped = CloudBackend::from_store(Arc::clone(&store), Some("/tenant/".into()), "azure");
        let raw = CloudBackend::from_store(store, None, "azure");

        scoped.put("x/one", Bytes::from_static(b"1")).await.unwrap();
        scoped.put("x/two", Bytes::from_static(b"2")).await.unwrap();

        assert!(raw.exists("tenant/x/one").await.unwrap());
        assert_eq!(scoped.list("x/").await.unwrap(), vec!["x/one", "x/two"]);
        assert_eq!(scoped.list("x/t").await.unwrap(), vec!["x/two"]);
    }

    #[tokio::test]
    async fn test_streaming_upload_crosses_part_size() {
        let backend = CloudBackend::memory("gcs");
        let mut upload = backend.put_stream("big").await.unwrap();
        let chunk = Bytes::from(vec![7u8; 1024 * 1024]);
        for _ in 0..6 {
            upload.write(chunk.clone()).await.unwrap();
        }
        assert_eq!(upload.finish().await.unwrap(), 6 * 1024 * 1024);
        assert_eq!(backend.head("big").await.unwrap().size, 6 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_aborted_small_upload_leaves_nothing() {
        let backend = CloudBackend::memory("azure");
        let mut upload = backend.put_stream("tiny").await.unwrap();
        upload.write(Bytes::from_static(b"partial")).await.unwrap();
        upload.abort().await.unwrap();
        assert!(!backend.exists("tiny").await.unwrap());
    }

    #[tokio::test]
    async fn test_emulated_directory() {
        let temp = tempdir().unwrap();
        let emulator = EmulatorConfig {
            path: Some(temp.path().join("gcs")),
        };
        let backend = CloudBackend::gcs("bucket", None, None, Some(&emulator)).unwrap();
        backend.put("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(backend.backend_name(), "gcs");
        assert!(temp.path().join("gcs").join("k").exists());
    }
}
