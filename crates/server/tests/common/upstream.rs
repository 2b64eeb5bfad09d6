//! Scripted in-memory upstream.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use stowage_core::Validator;
use stowage_server::{EngineError, EngineResult, Upstream, UpstreamBody, UpstreamResponse};

/// What the mock answers for one URL.
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub enum Scripted {
    /// Serve `data`; conditional requests carrying a matching ETag get a 304.
    Body {
        data: Bytes,
        etag: Option<String>,
        content_type: Option<String>,
    },
    NotFound,
    /// Connection failure or 5xx.
    Unavailable,
}

#[allow(dead_code)]
impl Scripted {
    pub fn body(data: &'static [u8], etag: &str) -> Self {
        Self::Body {
            data: Bytes::from_static(data),
            etag: Some(etag.to_string()),
            content_type: Some("application/octet-stream".to_string()),
        }
    }
}

/// An [`Upstream`] that answers from a script and counts fetches.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
#[derive(Default)]
pub struct MockUpstream {
    routes: Mutex<HashMap<String, Scripted>>,
    calls: AtomicUsize,
    conditional_calls: AtomicUsize,
    delay: Mutex<Duration>,
}

#[allow(dead_code)]
impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, url: &str, response: Scripted) {
        self.routes.lock().unwrap().insert(url.to_string(), response);
    }

    /// Delay every answer, so concurrent requests overlap.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fetches that carried a validator.
    pub fn conditional_calls(&self) -> usize {
        self.conditional_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn fetch(
        &self,
        url: &str,
        validator: Option<&Validator>,
    ) -> EngineResult<UpstreamResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if validator.is_some() {
            self.conditional_calls.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.routes.lock().unwrap().get(url).cloned();
        match scripted {
            None | Some(Scripted::NotFound) => Ok(UpstreamResponse::NotFound),
            Some(Scripted::Unavailable) => Err(EngineError::UpstreamUnavailable(format!(
                "{url}: connection refused"
            ))),
            Some(Scripted::Body {
                data,
                etag,
                content_type,
            }) => {
                let current = Validator {
                    etag,
                    last_modified: None,
                };
                if let Some(sent) = validator
                    && sent.etag.is_some()
                    && sent.etag == current.etag
                {
                    return Ok(UpstreamResponse::NotModified { validator: current });
                }
                Ok(UpstreamResponse::Fetched(UpstreamBody::from_bytes(
                    data,
                    current,
                    content_type,
                )))
            }
        }
    }
}
