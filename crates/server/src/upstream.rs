//! Upstream registries the proxy cache pulls from.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{
    CONTENT_TYPE, ETAG, HeaderMap, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use std::pin::Pin;
use std::time::Duration;
use stowage_core::Validator;

/// A stream of upstream body bytes.
pub type BodyStream = Pin<Box<dyn Stream<Item = EngineResult<Bytes>> + Send>>;

/// A successful upstream response body with its validators.
pub struct UpstreamBody {
    pub stream: BodyStream,
    pub validator: Validator,
    pub content_type: Option<String>,
    /// Declared length, when the upstream sent one.
    pub content_length: Option<u64>,
}

impl UpstreamBody {
    /// A body held entirely in memory.
    pub fn from_bytes(data: Bytes, validator: Validator, content_type: Option<String>) -> Self {
        let content_length = Some(data.len() as u64);
        Self {
            stream: Box::pin(futures::stream::once(async move { Ok(data) })),
            validator,
            content_type,
            content_length,
        }
    }
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamBody")
            .field("validator", &self.validator)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Outcome of an upstream fetch.
///
/// Timeouts, connection failures and 5xx responses are returned as
/// [`EngineError::UpstreamUnavailable`] rather than as a variant here.
#[derive(Debug)]
pub enum UpstreamResponse {
    Fetched(UpstreamBody),
    /// The stored validator still matches.
    NotModified { validator: Validator },
    /// The upstream confirmed the artifact does not exist.
    NotFound,
}

/// Source of artifacts for cache misses and revalidation.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch `url`, conditionally when `validator` is given.
    async fn fetch(
        &self,
        url: &str,
        validator: Option<&Validator>,
    ) -> EngineResult<UpstreamResponse>;
}

/// HTTP upstream backed by reqwest.
#[derive(Clone, Debug)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    /// Create a client whose requests (body included) are bounded by `timeout`.
    pub fn new(timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stowage/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn validator_from(headers: &HeaderMap) -> Validator {
    Validator {
        etag: header_string(headers, ETAG),
        last_modified: header_string(headers, LAST_MODIFIED),
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    #[tracing::instrument(skip(self, validator), fields(upstream = "http"))]
    async fn fetch(
        &self,
        url: &str,
        validator: Option<&Validator>,
    ) -> EngineResult<UpstreamResponse> {
        let mut request = self.client.get(url);
        if let Some(validator) = validator {
            if let Some(etag) = &validator.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &validator.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(format!("{url}: {e}")))?;

        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => Ok(UpstreamResponse::NotModified {
                validator: validator_from(response.headers()),
            }),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(UpstreamResponse::NotFound),
            s if s.is_success() => {
                let validator = validator_from(response.headers());
                let content_type = header_string(response.headers(), CONTENT_TYPE);
                let content_length = response.content_length();
                let stream = response.bytes_stream().map(|chunk| {
                    chunk.map_err(|e| {
                        EngineError::UpstreamUnavailable(format!("body read failed: {e}"))
                    })
                });
                Ok(UpstreamResponse::Fetched(UpstreamBody {
                    stream: Box::pin(stream),
                    validator,
                    content_type,
                    content_length,
                }))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                EngineError::PermissionDenied(format!("{url} returned {status}")),
            ),
            s => Err(EngineError::UpstreamUnavailable(format!(
                "{url} returned {s}"
            ))),
        }
    }
}
