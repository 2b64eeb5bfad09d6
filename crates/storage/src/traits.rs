//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use stowage_core::ContentHash;

/// A boxed stream of bytes for streaming reads and writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// A boxed stream of listing pages.
pub type PageStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<Vec<String>>> + Send + 'a>>;

pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const MAX_PAGE_SIZE: usize = 10000;

/// Options for paged listing.
#[derive(Clone, Copy, Debug)]
pub struct ListingOptions {
    /// Keys per page, clamped to `1..=MAX_PAGE_SIZE`.
    pub page_size: usize,
}

impl ListingOptions {
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }

    pub fn normalized_page_size(&self) -> usize {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// An inclusive byte range. `end: None` reads to the end of the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Bytes `start..=end`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Bytes from `start` to the end of the object.
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Resolve against an object of `size` bytes.
    ///
    /// Returns the half-open span to read, clamped to the object. A range
    /// starting at or past the end resolves to an empty span.
    pub fn resolve(&self, size: u64) -> StorageResult<std::ops::Range<u64>> {
        if let Some(end) = self.end
            && end < self.start
        {
            return Err(StorageError::InvalidRange(format!(
                "end ({end}) < start ({})",
                self.start
            )));
        }
        let start = self.start.min(size);
        let end = match self.end {
            Some(end) => end.saturating_add(1).min(size),
            None => size,
        };
        Ok(start..end.max(start))
    }
}

/// Resolve an optional range against `size`; `None` covers the whole object.
pub fn resolve_range(range: Option<ByteRange>, size: u64) -> StorageResult<std::ops::Range<u64>> {
    match range {
        Some(range) => range.resolve(size),
        None => Ok(0..size),
    }
}

/// A streaming read.
pub struct ObjectStream {
    pub stream: ByteStream,
    /// Total object size, independent of any requested range.
    pub size: u64,
    /// Half-open span of the object the stream covers.
    pub span: std::ops::Range<u64>,
}

impl ObjectStream {
    /// Collect the stream into memory.
    pub async fn collect_bytes(mut self) -> StorageResult<Bytes> {
        let capacity = usize::try_from(self.span.end - self.span.start).unwrap_or(0);
        let mut buf = Vec::with_capacity(capacity);
        while let Some(chunk) = self.stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

impl std::fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream")
            .field("size", &self.size)
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}

/// What a save wrote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveOutcome {
    pub size: u64,
    /// SHA-256 of the stored bytes.
    pub hash: ContentHash,
    /// Key the object was stored under.
    pub path: String,
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: Option<time::OffsetDateTime>,
    pub content_type: Option<String>,
}

/// Storage backend contract shared by every adapter.
///
/// Implementations map their native failures onto [`StorageError`] so
/// callers never need to know which backend they talk to.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's size and modification time without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content, or `None` if it does not exist.
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Stream an object, optionally restricted to an inclusive byte range.
    async fn get_stream(&self, key: &str, range: Option<ByteRange>)
    -> StorageResult<ObjectStream>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Start a streaming upload. Nothing is visible under `key` until `finish`.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object. Returns false if it did not exist.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// List objects under a prefix, one page at a time.
    fn list_pages<'a>(&'a self, prefix: &str, options: ListingOptions) -> PageStream<'a>;

    /// Get the name of this storage backend, used for logging.
    fn backend_name(&self) -> &'static str;

    /// Verify connectivity at startup.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    /// List every key under a prefix, sorted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut pages = self.list_pages(prefix, ListingOptions::default());
        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            keys.extend(page?);
        }
        keys.sort();
        Ok(keys)
    }

    /// Store `data`, reporting its size and hash.
    async fn save(&self, key: &str, data: Bytes) -> StorageResult<SaveOutcome> {
        let hash = ContentHash::compute(&data);
        let size = data.len() as u64;
        self.put(key, data).await?;
        Ok(SaveOutcome {
            size,
            hash,
            path: key.to_string(),
        })
    }

    /// Store a stream, hashing it on the way through.
    ///
    /// On any read or write error the upload is aborted and nothing is left
    /// under `key`.
    async fn save_stream(&self, key: &str, mut stream: ByteStream) -> StorageResult<SaveOutcome> {
        let mut upload = self.put_stream(key).await?;
        let mut hasher = ContentHash::hasher();

        while let Some(next) = stream.next().await {
            let written = match next {
                Ok(chunk) => {
                    hasher.update(&chunk);
                    upload.write(chunk).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                if let Err(abort_err) = upload.abort().await {
                    tracing::warn!(key = %key, error = %abort_err, "Failed to abort streaming upload");
                }
                return Err(e);
            }
        }

        let size = upload.finish().await?;
        Ok(SaveOutcome {
            size,
            hash: hasher.finalize(),
            path: key.to_string(),
        })
    }
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Wrap in-memory bytes as a single-chunk [`ByteStream`].
pub fn bytes_stream(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// An empty [`ByteStream`].
pub fn empty_stream() -> ByteStream {
    Box::pin(futures::stream::empty())
}
