//! Configuration types shared across crates.

use crate::job::CleanupSweepPayload;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// One configured storage backend.
///
/// Repositories bind to a backend by `key`; exactly one record is the default.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageBackendConfig {
    /// Unique name repositories refer to.
    pub key: String,
    /// Whether repositories without an explicit binding use this backend.
    #[serde(default)]
    pub default: bool,
    #[serde(flatten)]
    pub backend: StorageConfig,
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// Falls back to the ambient AWS credential chain when unset.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        /// Path-style URLs (`endpoint/bucket/key`), required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
    /// Google Cloud Storage.
    Gcs {
        bucket: String,
        prefix: Option<String>,
        /// Service account JSON file. Falls back to application default credentials.
        service_account_path: Option<PathBuf>,
        /// Run against a local emulation instead of the remote bucket.
        emulator: Option<EmulatorConfig>,
    },
    /// Azure Blob Storage.
    Azure {
        account: String,
        container: String,
        /// WARNING: Prefer STOWAGE_STORAGE__... env vars over storing keys in config files.
        access_key: Option<String>,
        prefix: Option<String>,
        /// Run against a local emulation instead of the remote container.
        emulator: Option<EmulatorConfig>,
    },
}

/// Local emulation of a cloud object store.
///
/// With a `path`, objects live in that directory; without one they live in
/// memory for the lifetime of the process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EmulatorConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Short backend type name used in logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            StorageConfig::Filesystem { .. } => "filesystem",
            StorageConfig::S3 { .. } => "s3",
            StorageConfig::Gcs { .. } => "gcs",
            StorageConfig::Azure { .. } => "azure",
        }
    }

    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("filesystem storage requires a non-empty path".to_string());
                }
                Ok(())
            }
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 storage requires a bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Gcs { bucket, .. } => {
                if bucket.is_empty() {
                    return Err("gcs storage requires a bucket".to_string());
                }
                Ok(())
            }
            StorageConfig::Azure {
                account,
                container,
                ..
            } => {
                if account.is_empty() || container.is_empty() {
                    return Err("azure storage requires an account and a container".to_string());
                }
                Ok(())
            }
        }
    }
}

fn default_storage_backends() -> Vec<StorageBackendConfig> {
    vec![StorageBackendConfig {
        key: "local".to_string(),
        default: true,
        backend: StorageConfig::default(),
    }]
}

/// Validate the full set of storage records.
pub fn validate_storage_backends(backends: &[StorageBackendConfig]) -> Result<(), String> {
    if backends.is_empty() {
        return Err("at least one storage backend must be configured".to_string());
    }

    let mut seen = HashSet::new();
    for record in backends {
        if record.key.is_empty() {
            return Err("storage backend key must not be empty".to_string());
        }
        if !seen.insert(record.key.as_str()) {
            return Err(format!("duplicate storage backend key: {}", record.key));
        }
        record
            .backend
            .validate()
            .map_err(|e| format!("storage backend '{}': {e}", record.key))?;
    }

    match backends.iter().filter(|b| b.default).count() {
        1 => Ok(()),
        0 => Err("exactly one storage backend must be marked default (found none)".to_string()),
        n => Err(format!(
            "exactly one storage backend must be marked default (found {n})"
        )),
    }
}

/// Per-repository binding.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Storage backend key; the default backend when unset.
    #[serde(default)]
    pub storage: Option<String>,
    /// Upstream base URL for proxy repositories.
    #[serde(default)]
    pub upstream: Option<String>,
    /// Freshness override for this repository's cache entries.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single process deployments and tests).
    Sqlite {
        path: PathBuf,
        /// Advisory query timeout; SQLite cannot cancel a running statement.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL; takes precedence over the individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// WARNING: Prefer STOWAGE_METADATA__PASSWORD over storing in config.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Server-side statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300000) // 5 minutes
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600) // 10 minutes (advisory only)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) | (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => {
                    Err("postgres config requires either 'url' or 'host' + 'database'".to_string())
                }
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// What a request does when another process holds the fill lock for its key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Wait (bounded) for the holder, then re-check the cache.
    #[default]
    Wait,
    /// Fetch from upstream directly without caching.
    PassThrough,
}

/// Pull-through proxy cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Freshness of a cached artifact when the repository sets no override.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Freshness of a cached upstream "not found".
    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// Lease on the per-key fill lock.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Longest a request waits for another fill before passing through.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
    #[serde(default)]
    pub contention_policy: ContentionPolicy,
    /// Hits with less remaining freshness than this enqueue a background refresh.
    #[serde(default)]
    pub refresh_ahead_secs: Option<u64>,
}

fn default_ttl_secs() -> u64 {
    3600 // 1 hour
}

fn default_negative_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

fn default_lock_ttl_secs() -> u64 {
    60
}

fn default_lock_wait_ms() -> u64 {
    5000
}

fn default_lock_poll_ms() -> u64 {
    100
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            negative_ttl_secs: default_negative_ttl_secs(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_wait_ms: default_lock_wait_ms(),
            lock_poll_ms: default_lock_poll_ms(),
            contention_policy: ContentionPolicy::default(),
            refresh_ahead_secs: None,
        }
    }
}

impl ProxyConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.upstream_timeout_secs == 0 {
            return Err("proxy.upstream_timeout_secs must be > 0".to_string());
        }
        if self.lock_ttl_secs == 0 {
            return Err("proxy.lock_ttl_secs must be > 0".to_string());
        }
        if self.lock_poll_ms == 0 {
            return Err("proxy.lock_poll_ms must be > 0".to_string());
        }
        // A fill that outlives its lock lets a second fetch start.
        if self.lock_ttl_secs < self.upstream_timeout_secs {
            return Err(format!(
                "proxy.lock_ttl_secs ({}) must be >= proxy.upstream_timeout_secs ({})",
                self.lock_ttl_secs, self.upstream_timeout_secs
            ));
        }
        Ok(())
    }
}

/// Upload session configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Directory holding private per-session staging files.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Sessions idle longer than this are collected.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Reject appends whose expected offset does not match.
    #[serde(default = "default_enforce_offsets")]
    pub enforce_offsets: bool,
    /// How long terminal sessions stay queryable before being purged.
    #[serde(default = "default_terminal_retention_secs")]
    pub terminal_retention_secs: u64,
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("./data/staging")
}

fn default_session_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_enforce_offsets() -> bool {
    true
}

fn default_terminal_retention_secs() -> u64 {
    604800 // 7 days
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            session_ttl_secs: default_session_ttl_secs(),
            enforce_offsets: default_enforce_offsets(),
            terminal_retention_secs: default_terminal_retention_secs(),
        }
    }
}

impl UploadConfig {
    pub fn session_ttl(&self) -> time::Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        time::Duration::seconds(i64::try_from(self.session_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn terminal_retention(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.terminal_retention_secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.session_ttl_secs == 0 {
            return Err("uploads.session_ttl_secs must be > 0".to_string());
        }
        if self.staging_dir.as_os_str().is_empty() {
            return Err("uploads.staging_dir must not be empty".to_string());
        }
        Ok(())
    }
}

/// Background job execution configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobConfig {
    /// Run the worker pool in this process.
    #[serde(default = "default_jobs_enabled")]
    pub enabled: bool,
    /// Jobs claimed and run concurrently per worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Visibility lease on a claimed job; reclaimable after expiry.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_jobs_enabled() -> bool {
    true
}

fn default_concurrency() -> u32 {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    300000 // 5 minutes
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            enabled: default_jobs_enabled(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl JobConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("jobs.concurrency must be > 0".to_string());
        }
        if self.max_attempts == 0 {
            return Err("jobs.max_attempts must be > 0".to_string());
        }
        if self.lease_ttl_secs == 0 {
            return Err("jobs.lease_ttl_secs must be > 0".to_string());
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err("jobs.backoff_max_ms must be >= jobs.backoff_base_ms".to_string());
        }
        Ok(())
    }
}

/// A cleanup sweep enqueued on a fixed interval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduledSweep {
    pub name: String,
    pub interval_secs: u64,
    #[serde(flatten)]
    pub payload: CleanupSweepPayload,
}

/// Periodic job scheduling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// Interval between `upload_gc` jobs (0 disables them).
    #[serde(default = "default_upload_gc_interval_secs")]
    pub upload_gc_interval_secs: u64,
    /// Interval between passes failing jobs whose lease expired with no
    /// attempts left.
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default)]
    pub sweeps: Vec<ScheduledSweep>,
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_upload_gc_interval_secs() -> u64 {
    600 // 10 minutes
}

fn default_reaper_interval_secs() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            upload_gc_interval_secs: default_upload_gc_interval_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            sweeps: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.reaper_interval_secs == 0 {
            return Err("scheduler.reaper_interval_secs must be > 0".to_string());
        }
        for sweep in &self.sweeps {
            if sweep.interval_secs == 0 {
                return Err(format!(
                    "scheduler sweep '{}' must have interval_secs > 0",
                    sweep.name
                ));
            }
            sweep
                .payload
                .validate()
                .map_err(|e| format!("scheduler sweep '{}': {e}", sweep.name))?;
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_storage_backends")]
    pub storage: Vec<StorageBackendConfig>,
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryConfig>,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default)]
    pub jobs: JobConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Create a test configuration rooted in `root`.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata
    /// under the given directory.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            storage: vec![StorageBackendConfig {
                key: "local".to_string(),
                default: true,
                backend: StorageConfig::Filesystem {
                    path: root.join("storage"),
                },
            }],
            repositories: BTreeMap::new(),
            metadata: MetadataConfig::Sqlite {
                path: root.join("metadata.db"),
                query_timeout_secs: default_sqlite_query_timeout_secs(),
            },
            proxy: ProxyConfig::default(),
            uploads: UploadConfig {
                staging_dir: root.join("staging"),
                ..UploadConfig::default()
            },
            jobs: JobConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    /// Validate every section and the cross references between them.
    pub fn validate(&self) -> Result<(), String> {
        validate_storage_backends(&self.storage)?;
        self.metadata.validate()?;
        self.proxy.validate()?;
        self.uploads.validate()?;
        self.jobs.validate()?;
        self.scheduler.validate()?;

        for (name, repo) in &self.repositories {
            if let Some(storage) = &repo.storage
                && !self.storage.iter().any(|b| &b.key == storage)
            {
                return Err(format!(
                    "repository '{name}' references unknown storage backend '{storage}'"
                ));
            }
            if let Some(upstream) = &repo.upstream {
                let lower = upstream.to_ascii_lowercase();
                if !lower.starts_with("http://") && !lower.starts_with("https://") {
                    return Err(format!(
                        "repository '{name}' upstream must be an http(s) URL: {upstream}"
                    ));
                }
            }
        }
        Ok(())
    }

    /// The configured default backend key.
    pub fn default_storage_key(&self) -> Option<&str> {
        self.storage
            .iter()
            .find(|b| b.default)
            .map(|b| b.key.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SweepSelector;

    fn fs_record(key: &str, default: bool) -> StorageBackendConfig {
        StorageBackendConfig {
            key: key.to_string(),
            default,
            backend: StorageConfig::Filesystem {
                path: PathBuf::from(format!("/tmp/{key}")),
            },
        }
    }

    #[test]
    fn test_exactly_one_default_backend() {
        assert!(validate_storage_backends(&[fs_record("a", true)]).is_ok());
        assert!(validate_storage_backends(&[fs_record("a", false)]).is_err());
        assert!(validate_storage_backends(&[fs_record("a", true), fs_record("b", true)]).is_err());
        assert!(validate_storage_backends(&[fs_record("a", true), fs_record("a", false)]).is_err());
        assert!(validate_storage_backends(&[]).is_err());
    }

    #[test]
    fn test_storage_record_deserializes_flattened_type() {
        let json = r#"{
            "key": "cloud",
            "default": true,
            "type": "gcs",
            "bucket": "artifacts",
            "prefix": "stowage",
            "emulator": {}
        }"#;
        let record: StorageBackendConfig = serde_json::from_str(json).unwrap();
        assert_eq!(record.key, "cloud");
        assert!(record.default);
        match record.backend {
            StorageConfig::Gcs {
                bucket, emulator, ..
            } => {
                assert_eq!(bucket, "artifacts");
                assert!(emulator.unwrap().path.is_none());
            }
            other => panic!("expected gcs config, got {other:?}"),
        }
    }

    #[test]
    fn test_s3_partial_credentials_rejected() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_repository_must_reference_known_backend() {
        let mut config = AppConfig::for_testing("/tmp/stowage");
        config.validate().unwrap();

        config.repositories.insert(
            "npm-remote".to_string(),
            RepositoryConfig {
                storage: Some("missing".to_string()),
                upstream: Some("https://registry.npmjs.org".to_string()),
                ttl_secs: None,
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.contains("unknown storage backend"), "{err}");
    }

    #[test]
    fn test_proxy_lock_ttl_must_cover_upstream_timeout() {
        let config = ProxyConfig {
            lock_ttl_secs: 5,
            upstream_timeout_secs: 30,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_scheduled_sweep_flattens_payload() {
        let json = r#"{
            "enabled": true,
            "sweeps": [{
                "name": "trim-npm",
                "interval_secs": 3600,
                "repository": "npm-remote",
                "selector": {"kind": "max_total_bytes", "bytes": 1073741824}
            }]
        }"#;
        let scheduler: SchedulerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(scheduler.upload_gc_interval_secs, 600);
        let sweep = &scheduler.sweeps[0];
        assert_eq!(sweep.payload.repository.as_deref(), Some("npm-remote"));
        assert_eq!(
            sweep.payload.selector,
            SweepSelector::MaxTotalBytes { bytes: 1073741824 }
        );
        scheduler.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.default_storage_key(), Some("local"));
        assert_eq!(config.proxy.contention_policy, ContentionPolicy::Wait);
        assert!(config.uploads.enforce_offsets);
        assert_eq!(config.jobs.max_attempts, 3);
        config.validate().unwrap();
    }
}
