//! Prometheus metrics for the stowage engine.
//!
//! Metrics live in a crate-local registry. Call [`register_metrics`] once at
//! startup and render them for a scraper with [`gather`].

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Proxy cache metrics
pub static CACHE_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_cache_requests_total",
            "Proxy cache requests by cache state",
        ),
        &["state"],
    )
    .expect("metric creation failed")
});

pub static CACHE_NEGATIVE_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_cache_negative_hits_total",
        "Requests answered from a cached upstream not-found",
    )
    .expect("metric creation failed")
});

pub static CACHE_BYTES_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_cache_bytes_stored_total",
        "Bytes written to storage by cache fills",
    )
    .expect("metric creation failed")
});

pub static CACHE_OBJECTS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_cache_objects_deleted_total",
        "Cached objects removed by replacement or eviction",
    )
    .expect("metric creation failed")
});

pub static UPSTREAM_FETCHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_upstream_fetches_total",
            "Upstream fetches by mode",
        ),
        &["mode"],
    )
    .expect("metric creation failed")
});

pub static UPSTREAM_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_upstream_errors_total",
            "Upstream fetch failures by error kind",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static COALESCED_WAITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_coalesced_waits_total",
        "Requests that waited on another in-process fill",
    )
    .expect("metric creation failed")
});

pub static LOCK_CONTENTION: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_fill_lock_contention_total",
        "Fill lock attempts that found the lock held elsewhere",
    )
    .expect("metric creation failed")
});

pub static PASS_THROUGH_FETCHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_pass_through_fetches_total",
            "Uncached upstream fetches by reason",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static UPSTREAM_FETCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "stowage_upstream_fetch_duration_seconds",
            "Time to fetch and store an upstream artifact",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

// Job queue metrics
pub static JOBS_ENQUEUED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_jobs_enqueued_total",
            "Jobs enqueued by type",
        ),
        &["job_type"],
    )
    .expect("metric creation failed")
});

pub static JOBS_CLAIMED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_jobs_claimed_total",
            "Jobs claimed by type",
        ),
        &["job_type"],
    )
    .expect("metric creation failed")
});

pub static JOBS_COMPLETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_jobs_completed_total",
            "Jobs completed by type",
        ),
        &["job_type"],
    )
    .expect("metric creation failed")
});

pub static JOBS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_jobs_failed_total",
            "Jobs failed terminally by type",
        ),
        &["job_type"],
    )
    .expect("metric creation failed")
});

pub static JOBS_RETRIED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_jobs_retried_total",
            "Job failures rescheduled for retry by type",
        ),
        &["job_type"],
    )
    .expect("metric creation failed")
});

pub static JOBS_RECLAIMED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_jobs_reclaimed_total",
            "Jobs reclaimed after their lease expired by type",
        ),
        &["job_type"],
    )
    .expect("metric creation failed")
});

pub static JOBS_LEASE_LOST: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_jobs_lease_lost_total",
            "Jobs abandoned because their lease was taken over",
        ),
        &["job_type"],
    )
    .expect("metric creation failed")
});

pub static JOBS_PANICKED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_jobs_panicked_total",
        "Job handlers that panicked",
    )
    .expect("metric creation failed")
});

pub static JOBS_REAPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_jobs_reaped_total",
        "Expired jobs with no attempts left failed by the reaper",
    )
    .expect("metric creation failed")
});

pub static JOBS_RUNNING: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "stowage_jobs_running",
        "Jobs currently executing in this process",
    )
    .expect("metric creation failed")
});

pub static JOB_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "stowage_job_duration_seconds",
            "Job execution time by type and outcome",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0]),
        &["job_type", "outcome"],
    )
    .expect("metric creation failed")
});

pub static SWEEP_ENTRIES_SELECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_sweep_entries_selected_total",
            "Entries or objects selected for deletion by sweep selector",
        ),
        &["selector"],
    )
    .expect("metric creation failed")
});

// Upload session metrics
pub static UPLOAD_SESSIONS_INITIATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_upload_sessions_initiated_total",
        "Upload sessions created",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_FINALIZED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_upload_sessions_finalized_total",
        "Upload sessions committed",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_upload_sessions_aborted_total",
        "Upload sessions aborted by the client or a failed verification",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_upload_sessions_expired_total",
        "Upload sessions collected after expiry",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_DIGEST_MISMATCHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_upload_digest_mismatches_total",
        "Finalize attempts rejected for a digest mismatch",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_BYTES_APPENDED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_upload_bytes_appended_total",
        "Bytes appended to upload staging files",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_BLOBS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_upload_blobs_deduplicated_total",
        "Finalized blobs that already existed in storage",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_FINALIZE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "stowage_upload_finalize_duration_seconds",
            "Time to verify and commit an upload",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests and embedders may call it repeatedly.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(CACHE_REQUESTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_NEGATIVE_HITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_BYTES_STORED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_OBJECTS_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPSTREAM_FETCHES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPSTREAM_ERRORS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(COALESCED_WAITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(LOCK_CONTENTION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PASS_THROUGH_FETCHES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPSTREAM_FETCH_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_ENQUEUED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_CLAIMED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_COMPLETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_RETRIED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_RECLAIMED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_LEASE_LOST.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_PANICKED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_REAPED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_RUNNING.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOB_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SWEEP_ENTRIES_SELECTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_SESSIONS_INITIATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_SESSIONS_FINALIZED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_SESSIONS_ABORTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_SESSIONS_EXPIRED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_DIGEST_MISMATCHES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_BYTES_APPENDED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_BLOBS_DEDUPLICATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_FINALIZE_DURATION.clone()))
            .expect("metric registration failed");
    });
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Count a job outcome and its duration.
pub fn record_job(job_type: &str, outcome: &str, elapsed: std::time::Duration) {
    JOB_DURATION
        .with_label_values(&[job_type, outcome])
        .observe(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // Registering twice must not panic.
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_gather_renders_registered_metrics() {
        register_metrics();
        CACHE_REQUESTS.with_label_values(&["hit"]).inc();
        let text = gather();
        assert!(text.contains("stowage_cache_requests_total"));
    }
}
