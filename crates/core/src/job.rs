//! Background job types and payloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::InvalidJob(format!("unknown job status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of background work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Populate or refresh one proxied artifact.
    CacheFill,
    /// Delete a batch of cache entries and their objects.
    CacheDelete,
    /// Select entries by policy and enqueue deletions.
    CleanupSweep,
    /// Collect abandoned upload sessions.
    UploadGc,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        Self::CacheFill,
        Self::CacheDelete,
        Self::CleanupSweep,
        Self::UploadGc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFill => "cache_fill",
            Self::CacheDelete => "cache_delete",
            Self::CleanupSweep => "cleanup_sweep",
            Self::UploadGc => "upload_gc",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidJob(format!("unknown job type: {s}")))
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `cache_fill` job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFillPayload {
    pub repository: String,
    pub path: String,
}

/// Payload of a `cache_delete` job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDeletePayload {
    /// Cache entry keys to delete, row first and object second.
    #[serde(default)]
    pub entries: Vec<String>,
    /// Stray objects with no entry, grouped by backend.
    #[serde(default)]
    pub objects: Vec<ObjectRef>,
}

impl CacheDeletePayload {
    pub fn len(&self) -> usize {
        self.entries.len() + self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An object addressed by backend and key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub backend: String,
    pub key: String,
}

/// How a cleanup sweep chooses what to delete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SweepSelector {
    /// Entries fetched more than `max_age_secs` ago.
    OlderThan { max_age_secs: u64 },
    /// Everything except the newest `count` entries.
    KeepNewest { count: u64 },
    /// Oldest entries beyond a total size budget.
    MaxTotalBytes { bytes: u64 },
    /// An explicit set of entry keys.
    Keys { keys: Vec<String> },
    /// Proxy objects on `backend` that no entry references.
    OrphanedObjects {
        backend: String,
        #[serde(default = "default_orphan_grace_secs")]
        grace_secs: u64,
    },
}

fn default_orphan_grace_secs() -> u64 {
    3600 // 1 hour
}

/// Payload of a `cleanup_sweep` job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSweepPayload {
    /// Restrict the sweep to one repository.
    #[serde(default)]
    pub repository: Option<String>,
    pub selector: SweepSelector,
    /// Entries scanned per metadata page.
    #[serde(default = "default_sweep_page_size")]
    pub page_size: u32,
    /// Keys per enqueued `cache_delete` job.
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: u32,
    /// Report what would be deleted without enqueuing deletions.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_sweep_page_size() -> u32 {
    500
}

fn default_delete_batch_size() -> u32 {
    100
}

impl CleanupSweepPayload {
    pub fn new(selector: SweepSelector) -> Self {
        Self {
            repository: None,
            selector,
            page_size: default_sweep_page_size(),
            delete_batch_size: default_delete_batch_size(),
            dry_run: false,
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.page_size == 0 {
            return Err(crate::Error::InvalidJob("page_size must be > 0".to_string()));
        }
        if self.delete_batch_size == 0 {
            return Err(crate::Error::InvalidJob(
                "delete_batch_size must be > 0".to_string(),
            ));
        }
        if let SweepSelector::OrphanedObjects { backend, .. } = &self.selector
            && backend.is_empty()
        {
            return Err(crate::Error::InvalidJob(
                "orphaned_objects selector requires a backend".to_string(),
            ));
        }
        Ok(())
    }
}

/// Payload of an `upload_gc` job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadGcPayload {
    /// Sessions handled per batch.
    #[serde(default = "default_upload_gc_batch")]
    pub batch_size: u32,
}

fn default_upload_gc_batch() -> u32 {
    100
}

impl Default for UploadGcPayload {
    fn default() -> Self {
        Self {
            batch_size: default_upload_gc_batch(),
        }
    }
}

/// Exponential retry delay: `base * 2^(attempt - 1)`, capped at `max`.
///
/// `attempt` is the 1-based number of the attempt that just failed.
pub fn retry_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_strings_roundtrip() {
        for job_type in JobType::ALL {
            assert_eq!(JobType::parse(job_type.as_str()).unwrap(), job_type);
            let json = serde_json::to_string(&job_type).unwrap();
            assert_eq!(json, format!("\"{}\"", job_type.as_str()));
        }
        assert!(JobType::parse("reindex").is_err());
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert_eq!(JobStatus::parse("running").unwrap(), JobStatus::Running);
    }

    #[test]
    fn test_sweep_payload_defaults_from_json() {
        let payload: CleanupSweepPayload = serde_json::from_str(
            r#"{"selector": {"kind": "keep_newest", "count": 10}, "repository": "npm-remote"}"#,
        )
        .unwrap();
        assert_eq!(payload.selector, SweepSelector::KeepNewest { count: 10 });
        assert_eq!(payload.page_size, 500);
        assert_eq!(payload.delete_batch_size, 100);
        assert!(!payload.dry_run);
        payload.validate().unwrap();

        let orphan: SweepSelector =
            serde_json::from_str(r#"{"kind": "orphaned_objects", "backend": "local"}"#).unwrap();
        assert_eq!(
            orphan,
            SweepSelector::OrphanedObjects {
                backend: "local".to_string(),
                grace_secs: 3600
            }
        );
    }

    #[test]
    fn test_sweep_payload_validation() {
        let mut payload = CleanupSweepPayload::new(SweepSelector::OlderThan { max_age_secs: 60 });
        payload.page_size = 0;
        assert!(payload.validate().is_err());

        let payload = CleanupSweepPayload::new(SweepSelector::OrphanedObjects {
            backend: String::new(),
            grace_secs: 0,
        });
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_retry_backoff_grows_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(10);
        assert_eq!(retry_backoff(1, base, max), Duration::from_millis(500));
        assert_eq!(retry_backoff(2, base, max), Duration::from_secs(1));
        assert_eq!(retry_backoff(3, base, max), Duration::from_secs(2));
        assert_eq!(retry_backoff(10, base, max), max);
        assert_eq!(retry_backoff(u32::MAX, base, max), max);
        assert_eq!(retry_backoff(0, base, max), base);
    }
}
