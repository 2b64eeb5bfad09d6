//! Job table semantics: exclusive claims, lease expiry, retry and reaping.

mod common;

use common::run_metadata_test_both;
use std::sync::Arc;
use stowage_core::JobType;
use stowage_metadata::{ClaimRequest, JobRow, MetadataStore};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

fn request(lock_id: Uuid, now: OffsetDateTime, lease: Duration) -> ClaimRequest<'static> {
    ClaimRequest {
        lock_id,
        limit: 10,
        now,
        lease_expires_at: now + lease,
        job_types: &[],
    }
}

async fn enqueue(store: &Arc<dyn MetadataStore>, job_type: JobType, max_attempts: u32) -> Uuid {
    let job = JobRow::pending(job_type, r#"{"batch_size":10}"#.to_string(), max_attempts);
    store.enqueue_job(&job).await.unwrap();
    job.id
}

#[tokio::test]
async fn test_racing_workers_claim_exactly_once() {
    run_metadata_test_both(|store| async move {
        let id = enqueue(&store, JobType::UploadGc, 3).await;
        let now = OffsetDateTime::now_utc();

        let req_a = request(Uuid::new_v4(), now, Duration::minutes(5));
        let req_b = request(Uuid::new_v4(), now, Duration::minutes(5));
        let (a, b) = tokio::join!(store.claim_jobs(&req_a), store.claim_jobs(&req_b));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.len() + b.len(), 1, "exactly one worker wins");

        let winner = a.into_iter().chain(b).next().unwrap();
        assert_eq!(winner.id, id);
        assert_eq!(winner.status, "running");
        assert_eq!(winner.attempts, 1);
        assert!(winner.lock_id.is_some());

        // Nobody else gets it while the lease is live.
        let later = now + Duration::minutes(1);
        assert!(
            store
                .claim_jobs(&request(Uuid::new_v4(), later, Duration::minutes(5)))
                .await
                .unwrap()
                .is_empty()
        );
    })
    .await;
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    run_metadata_test_both(|store| async move {
        let id = enqueue(&store, JobType::CacheFill, 3).await;
        let now = OffsetDateTime::now_utc();
        let crashed = Uuid::new_v4();

        let first = store
            .claim_jobs(&request(crashed, now, Duration::seconds(30)))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let after_expiry = now + Duration::seconds(31);
        let rescuer = Uuid::new_v4();
        let second = store
            .claim_jobs(&request(rescuer, after_expiry, Duration::seconds(30)))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, id);
        assert_eq!(second[0].lock_id, Some(rescuer));
        assert_eq!(second[0].attempts, 2, "reclaim counts as an attempt");

        // The crashed worker's late completion is rejected.
        assert!(
            !store
                .complete_job(id, crashed, None, after_expiry)
                .await
                .unwrap()
        );
        assert!(
            store
                .complete_job(id, rescuer, Some(r#"{"ok":true}"#), after_expiry)
                .await
                .unwrap()
        );
        let done = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(done.status, "completed");
        assert_eq!(done.result.as_deref(), Some(r#"{"ok":true}"#));
        assert!(done.lock_id.is_none());
        assert!(done.completed_at.is_some());
    })
    .await;
}

#[tokio::test]
async fn test_failures_retry_until_exhausted() {
    run_metadata_test_both(|store| async move {
        let id = enqueue(&store, JobType::CacheDelete, 2).await;
        let mut now = OffsetDateTime::now_utc();

        let lock = Uuid::new_v4();
        let claimed = store
            .claim_jobs(&request(lock, now, Duration::minutes(5)))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        let retry_at = now + Duration::seconds(10);
        assert!(store.fail_job(id, lock, "boom", retry_at, now).await.unwrap());

        let row = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.error.as_deref(), Some("boom"));

        // Not claimable before the backoff elapses.
        assert!(
            store
                .claim_jobs(&request(Uuid::new_v4(), now, Duration::minutes(5)))
                .await
                .unwrap()
                .is_empty()
        );

        now += Duration::seconds(11);
        let lock = Uuid::new_v4();
        let claimed = store
            .claim_jobs(&request(lock, now, Duration::minutes(5)))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(!claimed[0].has_attempts_left());
        assert!(store.fail_job(id, lock, "boom again", now, now).await.unwrap());

        let row = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.attempts, 2);
        assert_eq!(row.error.as_deref(), Some("boom again"));
        assert!(
            store
                .claim_jobs(&request(
                    Uuid::new_v4(),
                    now + Duration::hours(1),
                    Duration::minutes(5)
                ))
                .await
                .unwrap()
                .is_empty()
        );
    })
    .await;
}

#[tokio::test]
async fn test_reaper_fails_exhausted_expired_leases() {
    run_metadata_test_both(|store| async move {
        let id = enqueue(&store, JobType::CleanupSweep, 1).await;
        let now = OffsetDateTime::now_utc();
        let claimed = store
            .claim_jobs(&request(Uuid::new_v4(), now, Duration::seconds(10)))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        assert_eq!(store.reap_exhausted_jobs(now).await.unwrap(), 0);
        // Exhausted, so an expired lease is not reclaimable.
        let later = now + Duration::seconds(11);
        assert!(
            store
                .claim_jobs(&request(Uuid::new_v4(), later, Duration::seconds(10)))
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.reap_exhausted_jobs(later).await.unwrap(), 1);

        let row = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert!(row.error.unwrap().contains("lease expired"));
        assert_eq!(store.count_active_jobs("cleanup_sweep").await.unwrap(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_heartbeat_and_type_filter() {
    run_metadata_test_both(|store| async move {
        enqueue(&store, JobType::CacheFill, 3).await;
        let gc = enqueue(&store, JobType::UploadGc, 3).await;
        assert_eq!(store.count_active_jobs("cache_fill").await.unwrap(), 1);

        let now = OffsetDateTime::now_utc();
        let lock = Uuid::new_v4();
        let types = ["upload_gc"];
        let claimed = store
            .claim_jobs(&ClaimRequest {
                lock_id: lock,
                limit: 10,
                now,
                lease_expires_at: now + Duration::seconds(10),
                job_types: &types,
            })
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, gc);

        let extended = now + Duration::minutes(10);
        assert!(store.heartbeat_job(gc, lock, extended, now).await.unwrap());
        assert!(
            !store
                .heartbeat_job(gc, Uuid::new_v4(), extended, now)
                .await
                .unwrap()
        );
        // The heartbeat kept the lease alive past its original expiry.
        assert!(
            store
                .claim_jobs(&ClaimRequest {
                    lock_id: Uuid::new_v4(),
                    limit: 10,
                    now: now + Duration::seconds(30),
                    lease_expires_at: now + Duration::minutes(1),
                    job_types: &types,
                })
                .await
                .unwrap()
                .is_empty()
        );

        assert!(store.complete_job(gc, lock, None, now).await.unwrap());
        assert_eq!(store.list_jobs(Some("completed"), 10).await.unwrap().len(), 1);
        assert_eq!(store.list_jobs(None, 10).await.unwrap().len(), 2);
        assert_eq!(
            store
                .purge_finished_jobs(now + Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
    })
    .await;
}
