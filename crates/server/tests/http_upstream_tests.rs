//! Integration tests for the reqwest upstream against a mock HTTP server.

mod common;

use bytes::Bytes;
use common::TestEngine;
use futures::StreamExt;
use httpmock::Method::GET;
use httpmock::MockServer;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::config::RepositoryConfig;
use stowage_core::{CacheState, Validator};
use stowage_server::{CacheRequest, ErrorKind, HttpUpstream, Upstream, UpstreamResponse};

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn upstream() -> HttpUpstream {
    HttpUpstream::new(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_fetch_returns_body_and_validators() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/pkg.tgz");
        then.status(200)
            .header("etag", "\"v1\"")
            .header("last-modified", "Wed, 01 Jan 2025 00:00:00 GMT")
            .header("content-type", "application/gzip")
            .body("tarball");
    });

    let response = upstream().fetch(&server.url("/pkg.tgz"), None).await.unwrap();
    let body = match response {
        UpstreamResponse::Fetched(body) => body,
        other => panic!("expected a body, got {other:?}"),
    };
    assert_eq!(body.validator.etag.as_deref(), Some("\"v1\""));
    assert_eq!(
        body.validator.last_modified.as_deref(),
        Some("Wed, 01 Jan 2025 00:00:00 GMT")
    );
    assert_eq!(body.content_type.as_deref(), Some("application/gzip"));
    assert_eq!(body.content_length, Some(7));

    let mut stream = body.stream;
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(data, b"tarball");
}

#[tokio::test]
async fn test_conditional_fetch_sends_validators() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/pkg.tgz")
            .header("if-none-match", "\"v1\"")
            .header("if-modified-since", "Wed, 01 Jan 2025 00:00:00 GMT");
        then.status(304).header("etag", "\"v1\"");
    });

    let validator = Validator {
        etag: Some("\"v1\"".to_string()),
        last_modified: Some("Wed, 01 Jan 2025 00:00:00 GMT".to_string()),
    };
    let response = upstream()
        .fetch(&server.url("/pkg.tgz"), Some(&validator))
        .await
        .unwrap();
    match response {
        UpstreamResponse::NotModified { validator } => {
            assert_eq!(validator.etag.as_deref(), Some("\"v1\""));
        }
        other => panic!("expected 304, got {other:?}"),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn test_status_mapping() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }
    let server = MockServer::start();
    for (path, status) in [("/gone", 410), ("/missing", 404), ("/broken", 503), ("/secret", 403)] {
        server.mock(|when, then| {
            when.method(GET).path(path);
            then.status(status);
        });
    }
    let upstream = upstream();

    assert!(matches!(
        upstream.fetch(&server.url("/missing"), None).await.unwrap(),
        UpstreamResponse::NotFound
    ));
    assert!(matches!(
        upstream.fetch(&server.url("/gone"), None).await.unwrap(),
        UpstreamResponse::NotFound
    ));
    let err = upstream
        .fetch(&server.url("/broken"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    let err = upstream
        .fetch(&server.url("/secret"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn test_connection_failure_is_unavailable() {
    let err = upstream()
        .fetch("http://127.0.0.1:1/pkg.tgz", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
}

#[tokio::test]
async fn test_proxy_revalidates_over_http() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }
    let server = MockServer::start();
    let mut full = server.mock(|when, then| {
        when.method(GET).path("/lodash.tgz");
        then.status(200).header("etag", "\"l1\"").body("lodash");
    });

    let base_url = server.base_url();
    let engine = TestEngine::with_config(|config| {
        config.proxy.default_ttl_secs = 0;
        config.repositories.insert(
            "npm".to_string(),
            RepositoryConfig {
                storage: None,
                upstream: Some(base_url),
                ttl_secs: None,
            },
        );
    })
    .await;
    let mut ctx = engine.ctx.clone();
    ctx.upstream = Arc::new(upstream());
    let proxy = stowage_server::ProxyCacheEngine::new(ctx);
    let request = CacheRequest::new("npm", "lodash.tgz");

    let first = proxy.get(&request).await.unwrap();
    assert_eq!(first.cache_state, CacheState::Miss);
    assert_eq!(first.collect_body().await.unwrap(), Bytes::from_static(b"lodash"));

    full.assert_hits_async(1).await;
    full.delete_async().await;

    let conditional = server.mock(|when, then| {
        when.method(GET)
            .path("/lodash.tgz")
            .header("if-none-match", "\"l1\"");
        then.status(304);
    });
    let second = proxy.get(&request).await.unwrap();
    assert_eq!(second.cache_state, CacheState::Revalidated);
    assert_eq!(second.collect_body().await.unwrap(), Bytes::from_static(b"lodash"));
    conditional.assert_hits_async(1).await;
}
