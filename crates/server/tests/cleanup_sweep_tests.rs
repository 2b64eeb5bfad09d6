//! Integration tests for cleanup sweep selection and batching.

mod common;

use bytes::Bytes;
use common::TestEngine;
use std::time::Duration;
use stowage_core::{CacheDeletePayload, CleanupSweepPayload, JobId, ObjectRef, SweepSelector};
use stowage_metadata::CacheEntryRow;
use stowage_server::{CleanupSweep, JobOutcome};
use time::OffsetDateTime;

fn entry(key: &str, age: time::Duration, size: i64, object_key: Option<&str>) -> CacheEntryRow {
    let fetched_at = OffsetDateTime::now_utc() - age;
    let (repository, path) = key.split_once('/').unwrap();
    CacheEntryRow {
        cache_key: key.to_string(),
        repository: repository.to_string(),
        path: path.to_string(),
        backend: "local".to_string(),
        object_key: object_key.map(str::to_string),
        upstream_url: format!("https://upstream.test/{path}"),
        fetched_at,
        expires_at: fetched_at + time::Duration::hours(1),
        etag: None,
        last_modified: None,
        content_type: None,
        size_bytes: size,
        content_hash: None,
        negative: false,
    }
}

/// Three npm entries aged 10 days, 5 days and 1 hour, sized 100, 200, 300.
async fn seeded_engine() -> TestEngine {
    let engine = TestEngine::new().await;
    let metadata = engine.metadata();
    for row in [
        entry("npm/old.tgz", time::Duration::days(10), 100, None),
        entry("npm/middle.tgz", time::Duration::days(5), 200, None),
        entry("npm/new.tgz", time::Duration::hours(1), 300, None),
        entry("maven/other.jar", time::Duration::days(30), 50, None),
    ] {
        metadata.replace_cache_entry(&row).await.unwrap();
    }
    engine
}

fn npm_sweep(selector: SweepSelector) -> CleanupSweepPayload {
    CleanupSweepPayload {
        repository: Some("npm".to_string()),
        ..CleanupSweepPayload::new(selector)
    }
}

fn sweeper(engine: &TestEngine) -> CleanupSweep {
    CleanupSweep::new(engine.ctx.clone(), engine.queue())
}

async fn delete_payload(engine: &TestEngine, id: JobId) -> CacheDeletePayload {
    let job = engine.queue().get(id).await.unwrap().unwrap();
    assert_eq!(job.job_type, "cache_delete");
    serde_json::from_str(&job.payload).unwrap()
}

#[tokio::test]
async fn test_older_than_selects_by_age() {
    let engine = seeded_engine().await;
    let report = sweeper(&engine)
        .run(&npm_sweep(SweepSelector::OlderThan {
            max_age_secs: 2 * 86400,
        }))
        .await
        .unwrap();

    assert_eq!(report.selected, 2);
    assert_eq!(report.selected_bytes, 300);
    assert_eq!(report.jobs.len(), 1);
    let batch = delete_payload(&engine, report.jobs[0]).await;
    assert_eq!(batch.entries, vec!["npm/middle.tgz", "npm/old.tgz"]);
    assert!(batch.objects.is_empty());
}

#[tokio::test]
async fn test_sweep_without_repository_covers_all() {
    let engine = seeded_engine().await;
    let report = sweeper(&engine)
        .run(&CleanupSweepPayload::new(SweepSelector::OlderThan {
            max_age_secs: 2 * 86400,
        }))
        .await
        .unwrap();
    assert_eq!(report.selected, 3);
    let batch = delete_payload(&engine, report.jobs[0]).await;
    assert_eq!(
        batch.entries,
        vec!["maven/other.jar", "npm/middle.tgz", "npm/old.tgz"]
    );
}

#[tokio::test]
async fn test_keep_newest_selects_the_rest() {
    let engine = seeded_engine().await;
    let report = sweeper(&engine)
        .run(&npm_sweep(SweepSelector::KeepNewest { count: 1 }))
        .await
        .unwrap();

    assert_eq!(report.selected, 2);
    let batch = delete_payload(&engine, report.jobs[0]).await;
    assert_eq!(batch.entries, vec!["npm/middle.tgz", "npm/old.tgz"]);
}

#[tokio::test]
async fn test_keep_newest_above_count_selects_nothing() {
    let engine = seeded_engine().await;
    let report = sweeper(&engine)
        .run(&npm_sweep(SweepSelector::KeepNewest { count: 10 }))
        .await
        .unwrap();
    assert_eq!(report.selected, 0);
    assert_eq!(report.batches, 0);
    assert!(report.jobs.is_empty());
}

#[tokio::test]
async fn test_max_total_bytes_trims_oldest_first() {
    let engine = seeded_engine().await;
    let report = sweeper(&engine)
        .run(&npm_sweep(SweepSelector::MaxTotalBytes { bytes: 350 }))
        .await
        .unwrap();

    // 600 bytes against a 350 budget: dropping 100 + 200 covers the excess.
    assert_eq!(report.selected, 2);
    assert_eq!(report.selected_bytes, 300);
    let batch = delete_payload(&engine, report.jobs[0]).await;
    assert_eq!(batch.entries, vec!["npm/middle.tgz", "npm/old.tgz"]);
}

#[tokio::test]
async fn test_explicit_keys_are_normalized_and_deduplicated() {
    let engine = seeded_engine().await;
    let report = sweeper(&engine)
        .run(&CleanupSweepPayload::new(SweepSelector::Keys {
            keys: vec![
                "npm/new.tgz".to_string(),
                "npm//old.tgz".to_string(),
                "npm/new.tgz".to_string(),
                "npm/absent.tgz".to_string(),
            ],
        }))
        .await
        .unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.selected, 2);
    let batch = delete_payload(&engine, report.jobs[0]).await;
    assert_eq!(batch.entries, vec!["npm/new.tgz", "npm/old.tgz"]);
}

#[tokio::test]
async fn test_batches_are_sorted_and_bounded() {
    let engine = seeded_engine().await;
    let payload = CleanupSweepPayload {
        page_size: 1,
        delete_batch_size: 2,
        ..CleanupSweepPayload::new(SweepSelector::KeepNewest { count: 0 })
    };
    let report = sweeper(&engine).run(&payload).await.unwrap();

    assert_eq!(report.scanned, 4);
    assert_eq!(report.selected, 4);
    assert_eq!(report.batches, 2);
    let first = delete_payload(&engine, report.jobs[0]).await;
    let second = delete_payload(&engine, report.jobs[1]).await;
    // Oldest first across batches, sorted by key within each.
    assert_eq!(first.entries, vec!["maven/other.jar", "npm/old.tgz"]);
    assert_eq!(second.entries, vec!["npm/middle.tgz", "npm/new.tgz"]);
}

#[tokio::test]
async fn test_rerun_produces_identical_batches() {
    let engine = seeded_engine().await;
    let payload = CleanupSweepPayload {
        delete_batch_size: 2,
        ..CleanupSweepPayload::new(SweepSelector::KeepNewest { count: 0 })
    };
    let first = sweeper(&engine).run(&payload).await.unwrap();
    let second = sweeper(&engine).run(&payload).await.unwrap();

    for (a, b) in first.jobs.iter().zip(&second.jobs) {
        assert_eq!(
            delete_payload(&engine, *a).await,
            delete_payload(&engine, *b).await
        );
    }
}

#[tokio::test]
async fn test_dry_run_enqueues_nothing() {
    let engine = seeded_engine().await;
    let payload = CleanupSweepPayload {
        dry_run: true,
        ..npm_sweep(SweepSelector::KeepNewest { count: 0 })
    };
    let report = sweeper(&engine).run(&payload).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.selected, 3);
    assert_eq!(report.batches, 1);
    assert!(report.jobs.is_empty());
    assert_eq!(
        engine.metadata().count_active_jobs("cache_delete").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_invalid_payload_is_rejected() {
    let engine = seeded_engine().await;
    let payload = CleanupSweepPayload {
        page_size: 0,
        ..CleanupSweepPayload::new(SweepSelector::KeepNewest { count: 0 })
    };
    assert!(sweeper(&engine).run(&payload).await.is_err());
}

#[tokio::test]
async fn test_orphaned_objects_are_collected() {
    let engine = TestEngine::new().await;
    let backend = engine.storage().backend;
    for key in [
        "proxy/npm/objects/referenced",
        "proxy/npm/objects/orphan",
        "proxy/npm/manifest.json",
        "blobs/sha256/ab/abcd",
    ] {
        backend.put(key, Bytes::from_static(b"payload")).await.unwrap();
    }
    engine
        .metadata()
        .replace_cache_entry(&entry(
            "npm/kept.tgz",
            time::Duration::minutes(1),
            7,
            Some("proxy/npm/objects/referenced"),
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let payload = CleanupSweepPayload::new(SweepSelector::OrphanedObjects {
        backend: "local".to_string(),
        grace_secs: 0,
    });
    let report = sweeper(&engine).run(&payload).await.unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.selected_bytes, 7);
    let batch = delete_payload(&engine, report.jobs[0]).await;
    assert_eq!(
        batch.objects,
        vec![ObjectRef {
            backend: "local".to_string(),
            key: "proxy/npm/objects/orphan".to_string(),
        }]
    );

    let reports = engine.worker().run_once().await.unwrap();
    assert_eq!(reports[0].outcome, JobOutcome::Completed);
    assert!(!backend.exists("proxy/npm/objects/orphan").await.unwrap());
    assert!(backend.exists("proxy/npm/objects/referenced").await.unwrap());
    assert!(backend.exists("blobs/sha256/ab/abcd").await.unwrap());
}

#[tokio::test]
async fn test_orphans_within_grace_period_are_kept() {
    let engine = TestEngine::new().await;
    let backend = engine.storage().backend;
    backend
        .put("proxy/npm/objects/fresh", Bytes::from_static(b"payload"))
        .await
        .unwrap();

    let payload = CleanupSweepPayload::new(SweepSelector::OrphanedObjects {
        backend: "local".to_string(),
        grace_secs: 3600,
    });
    let report = sweeper(&engine).run(&payload).await.unwrap();
    assert_eq!(report.selected, 0);
}
