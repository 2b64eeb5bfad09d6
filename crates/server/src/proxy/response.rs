//! Request and response shapes of the proxy cache.

use crate::error::EngineResult;
use crate::upstream::BodyStream;
use bytes::Bytes;
use futures::StreamExt;
use stowage_core::CacheState;
use stowage_metadata::CacheEntryRow;
use stowage_storage::{ByteRange, ObjectStream};
use time::OffsetDateTime;

/// A read-through request for one artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRequest {
    pub repository: String,
    /// Artifact path relative to the repository root.
    pub path: String,
    pub range: Option<ByteRange>,
}

impl CacheRequest {
    pub fn new(repository: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            path: path.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// What protocol handlers get back for a cache request.
///
/// Bodies are raw upstream bytes; any payload rewriting is up to the caller.
pub struct CacheResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: BodyStream,
    pub cache_state: CacheState,
    /// Total size of the artifact, when known.
    pub size: Option<u64>,
}

impl CacheResponse {
    /// Whether the status is a success (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Collect the body into memory.
    pub async fn collect_body(mut self) -> EngineResult<Bytes> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }

    pub(crate) fn not_found(cache_state: CacheState) -> Self {
        Self {
            status: 404,
            headers: Vec::new(),
            body: Box::pin(futures::stream::empty()),
            cache_state,
            size: None,
        }
    }

    pub(crate) fn range_not_satisfiable(size: u64, cache_state: CacheState) -> Self {
        Self {
            status: 416,
            headers: vec![("Content-Range".to_string(), format!("bytes */{size}"))],
            body: Box::pin(futures::stream::empty()),
            cache_state,
            size: Some(size),
        }
    }

    /// Respond with a (possibly ranged) read of a cached object.
    pub(crate) fn from_object(
        entry: &CacheEntryRow,
        object: ObjectStream,
        ranged: bool,
        cache_state: CacheState,
    ) -> Self {
        let ObjectStream { stream, size, span } = object;
        let mut headers = vec![
            ("Content-Length".to_string(), (span.end - span.start).to_string()),
            ("Accept-Ranges".to_string(), "bytes".to_string()),
        ];
        if let Some(content_type) = &entry.content_type {
            headers.push(("Content-Type".to_string(), content_type.clone()));
        }
        if let Some(etag) = &entry.etag {
            headers.push(("ETag".to_string(), etag.clone()));
        }
        if let Some(last_modified) = &entry.last_modified {
            headers.push(("Last-Modified".to_string(), last_modified.clone()));
        }
        let age = (OffsetDateTime::now_utc() - entry.fetched_at).whole_seconds().max(0);
        headers.push(("Age".to_string(), age.to_string()));

        let status = if ranged {
            headers.push((
                "Content-Range".to_string(),
                format!("bytes {}-{}/{size}", span.start, span.end - 1),
            ));
            206
        } else {
            200
        };

        Self {
            status,
            headers,
            body: Box::pin(stream.map(|chunk| chunk.map_err(Into::into))),
            cache_state,
            size: Some(size),
        }
    }
}

impl std::fmt::Debug for CacheResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("cache_state", &self.cache_state)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
