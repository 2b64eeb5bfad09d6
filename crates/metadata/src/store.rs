//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{CacheEntryRepo, JobRepo, LockRepo, UploadRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: JobRepo + CacheEntryRepo + UploadRepo + LockRepo + Send + Sync {
    /// Create tables and indexes if missing.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
///
/// Timestamps are stored as RFC 3339 text, whose fractional digits vary, so
/// every time comparison goes through `julianday()`.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) a SQLite store at `path`.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One writer at a time; more connections only add lock contention.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        if let Some(secs) = query_timeout_secs {
            tracing::debug!(
                query_timeout_secs = secs,
                "SQLite query timeout is advisory; use PostgreSQL for multi-process deployments"
            );
        }

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Claimability predicate shared by candidate selection and the CAS update.
/// Binds: now, now.
const SQLITE_CLAIMABLE: &str = "((status = 'pending' AND julianday(run_after) <= julianday(?)) \
     OR (status = 'running' AND julianday(lock_expires_at) <= julianday(?) AND attempts < max_attempts))";

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::ClaimRequest;
    use sqlx::QueryBuilder;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl JobRepo for SqliteStore {
        async fn enqueue_job(&self, job: &JobRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_type, status, payload, result, error, lock_id, locked_at,
                    lock_expires_at, run_after, started_at, completed_at, attempts,
                    max_attempts, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job.id)
            .bind(&job.job_type)
            .bind(&job.status)
            .bind(&job.payload)
            .bind(&job.result)
            .bind(&job.error)
            .bind(job.lock_id)
            .bind(job.locked_at)
            .bind(job.lock_expires_at)
            .bind(job.run_after)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(job.attempts)
            .bind(job.max_attempts)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| MetadataError::from_insert(e, format!("job {}", job.id)))?;
            Ok(())
        }

        async fn get_job(&self, id: Uuid) -> MetadataResult<Option<JobRow>> {
            let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn claim_jobs(&self, request: &ClaimRequest<'_>) -> MetadataResult<Vec<JobRow>> {
            let mut select = QueryBuilder::<Sqlite>::new("SELECT id FROM jobs WHERE ");
            select
                .push("((status = 'pending' AND julianday(run_after) <= julianday(")
                .push_bind(request.now)
                .push(")) OR (status = 'running' AND julianday(lock_expires_at) <= julianday(")
                .push_bind(request.now)
                .push(") AND attempts < max_attempts))");
            if !request.job_types.is_empty() {
                select.push(" AND job_type IN (");
                let mut types = select.separated(", ");
                for job_type in request.job_types {
                    types.push_bind(*job_type);
                }
                types.push_unseparated(")");
            }
            select
                .push(" ORDER BY julianday(created_at), id LIMIT ")
                .push_bind(i64::from(request.limit));

            let candidates = select
                .build_query_scalar::<Uuid>()
                .fetch_all(&self.pool)
                .await?;

            let mut claimed = Vec::with_capacity(candidates.len());
            for id in candidates {
                let result = sqlx::query(&format!(
                    "UPDATE jobs SET status = 'running', lock_id = ?, locked_at = ?, \
                     lock_expires_at = ?, started_at = COALESCE(started_at, ?), \
                     attempts = attempts + 1, updated_at = ? \
                     WHERE id = ? AND {SQLITE_CLAIMABLE}"
                ))
                .bind(request.lock_id)
                .bind(request.now)
                .bind(request.lease_expires_at)
                .bind(request.now)
                .bind(request.now)
                .bind(id)
                .bind(request.now)
                .bind(request.now)
                .execute(&self.pool)
                .await?;

                // Zero rows: another worker won this row between select and update.
                if result.rows_affected() == 1
                    && let Some(row) = self.get_job(id).await?
                {
                    claimed.push(row);
                }
            }
            Ok(claimed)
        }

        async fn heartbeat_job(
            &self,
            id: Uuid,
            lock_id: Uuid,
            lease_expires_at: OffsetDateTime,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE jobs SET lock_expires_at = ?, updated_at = ? \
                 WHERE id = ? AND lock_id = ? AND status = 'running'",
            )
            .bind(lease_expires_at)
            .bind(now)
            .bind(id)
            .bind(lock_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn complete_job(
            &self,
            id: Uuid,
            lock_id: Uuid,
            result: Option<&str>,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let outcome = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'completed', result = ?, error = NULL, completed_at = ?,
                    lock_id = NULL, locked_at = NULL, lock_expires_at = NULL, updated_at = ?
                WHERE id = ? AND lock_id = ? AND status = 'running'
                "#,
            )
            .bind(result)
            .bind(now)
            .bind(now)
            .bind(id)
            .bind(lock_id)
            .execute(&self.pool)
            .await?;
            Ok(outcome.rows_affected() == 1)
        }

        async fn fail_job(
            &self,
            id: Uuid,
            lock_id: Uuid,
            error: &str,
            retry_at: OffsetDateTime,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let outcome = sqlx::query(
                r#"
                UPDATE jobs
                SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                    completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE ? END,
                    run_after = ?, error = ?,
                    lock_id = NULL, locked_at = NULL, lock_expires_at = NULL, updated_at = ?
                WHERE id = ? AND lock_id = ? AND status = 'running'
                "#,
            )
            .bind(now)
            .bind(retry_at)
            .bind(error)
            .bind(now)
            .bind(id)
            .bind(lock_id)
            .execute(&self.pool)
            .await?;
            Ok(outcome.rows_affected() == 1)
        }

        async fn reap_exhausted_jobs(&self, now: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed', completed_at = ?,
                    error = COALESCE(error, 'lease expired with no attempts left'),
                    lock_id = NULL, locked_at = NULL, lock_expires_at = NULL, updated_at = ?
                WHERE status = 'running'
                  AND julianday(lock_expires_at) <= julianday(?)
                  AND attempts >= max_attempts
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }

        async fn count_active_jobs(&self, job_type: &str) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM jobs WHERE job_type = ? AND status IN ('pending', 'running')",
            )
            .bind(job_type)
            .fetch_one(&self.pool)
            .await?;
            Ok(count.max(0) as u64)
        }

        async fn list_jobs(&self, status: Option<&str>, limit: u32) -> MetadataResult<Vec<JobRow>> {
            let rows = match status {
                Some(status) => {
                    sqlx::query_as::<_, JobRow>(
                        "SELECT * FROM jobs WHERE status = ? ORDER BY julianday(created_at) DESC LIMIT ?",
                    )
                    .bind(status)
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, JobRow>(
                        "SELECT * FROM jobs ORDER BY julianday(created_at) DESC LIMIT ?",
                    )
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            Ok(rows)
        }

        async fn purge_finished_jobs(&self, before: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed') \
                 AND julianday(completed_at) < julianday(?)",
            )
            .bind(before)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl CacheEntryRepo for SqliteStore {
        async fn get_cache_entry(&self, cache_key: &str) -> MetadataResult<Option<CacheEntryRow>> {
            let row = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries WHERE cache_key = ?",
            )
            .bind(cache_key)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn replace_cache_entry(
            &self,
            entry: &CacheEntryRow,
        ) -> MetadataResult<Option<CacheEntryRow>> {
            let mut tx = self.pool.begin().await?;

            let previous = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries WHERE cache_key = ?",
            )
            .bind(&entry.cache_key)
            .fetch_optional(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO cache_entries (
                    cache_key, repository, path, backend, object_key, upstream_url,
                    fetched_at, expires_at, etag, last_modified, content_type,
                    size_bytes, content_hash, negative
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(cache_key) DO UPDATE SET
                    repository = excluded.repository,
                    path = excluded.path,
                    backend = excluded.backend,
                    object_key = excluded.object_key,
                    upstream_url = excluded.upstream_url,
                    fetched_at = excluded.fetched_at,
                    expires_at = excluded.expires_at,
                    etag = excluded.etag,
                    last_modified = excluded.last_modified,
                    content_type = excluded.content_type,
                    size_bytes = excluded.size_bytes,
                    content_hash = excluded.content_hash,
                    negative = excluded.negative
                "#,
            )
            .bind(&entry.cache_key)
            .bind(&entry.repository)
            .bind(&entry.path)
            .bind(&entry.backend)
            .bind(&entry.object_key)
            .bind(&entry.upstream_url)
            .bind(entry.fetched_at)
            .bind(entry.expires_at)
            .bind(&entry.etag)
            .bind(&entry.last_modified)
            .bind(&entry.content_type)
            .bind(entry.size_bytes)
            .bind(&entry.content_hash)
            .bind(entry.negative)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(previous)
        }

        async fn refresh_cache_entry(
            &self,
            cache_key: &str,
            fetched_at: OffsetDateTime,
            expires_at: OffsetDateTime,
            etag: Option<&str>,
            last_modified: Option<&str>,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE cache_entries
                SET fetched_at = ?, expires_at = ?,
                    etag = COALESCE(?, etag),
                    last_modified = COALESCE(?, last_modified)
                WHERE cache_key = ?
                "#,
            )
            .bind(fetched_at)
            .bind(expires_at)
            .bind(etag)
            .bind(last_modified)
            .bind(cache_key)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn delete_cache_entry(
            &self,
            cache_key: &str,
        ) -> MetadataResult<Option<CacheEntryRow>> {
            let mut tx = self.pool.begin().await?;
            let existing = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries WHERE cache_key = ?",
            )
            .bind(cache_key)
            .fetch_optional(&mut *tx)
            .await?;
            if existing.is_some() {
                sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
                    .bind(cache_key)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(existing)
        }

        async fn list_cache_entries(
            &self,
            repository: Option<&str>,
            after: Option<&CacheEntryCursor>,
            limit: u32,
        ) -> MetadataResult<Vec<CacheEntryRow>> {
            let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM cache_entries WHERE 1 = 1");
            if let Some(repository) = repository {
                query.push(" AND repository = ").push_bind(repository);
            }
            if let Some(cursor) = after {
                query
                    .push(" AND (julianday(fetched_at) > julianday(")
                    .push_bind(cursor.fetched_at)
                    .push(") OR (julianday(fetched_at) = julianday(")
                    .push_bind(cursor.fetched_at)
                    .push(") AND cache_key > ")
                    .push_bind(&cursor.cache_key)
                    .push("))");
            }
            query
                .push(" ORDER BY julianday(fetched_at), cache_key LIMIT ")
                .push_bind(i64::from(limit));

            let rows = query
                .build_query_as::<CacheEntryRow>()
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn cache_entry_stats(
            &self,
            repository: Option<&str>,
        ) -> MetadataResult<CacheEntryStats> {
            let (count, total): (i64, i64) = match repository {
                Some(repository) => {
                    sqlx::query_as(
                        "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries WHERE repository = ?",
                    )
                    .bind(repository)
                    .fetch_one(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as(
                        "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries",
                    )
                    .fetch_one(&self.pool)
                    .await?
                }
            };
            Ok(CacheEntryStats {
                count: count.max(0) as u64,
                total_bytes: total.max(0) as u64,
            })
        }

        async fn is_object_referenced(
            &self,
            backend: &str,
            object_key: &str,
        ) -> MetadataResult<bool> {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM cache_entries WHERE backend = ? AND object_key = ?)",
            )
            .bind(backend)
            .bind(object_key)
            .fetch_one(&self.pool)
            .await?;
            Ok(exists)
        }
    }

    #[async_trait]
    impl UploadRepo for SqliteStore {
        async fn create_upload(&self, session: &UploadSessionRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    upload_id, repository, artifact_name, staging_path, byte_offset,
                    state, digest, created_at, updated_at, expires_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session.upload_id)
            .bind(&session.repository)
            .bind(&session.artifact_name)
            .bind(&session.staging_path)
            .bind(session.byte_offset)
            .bind(&session.state)
            .bind(&session.digest)
            .bind(session.created_at)
            .bind(session.updated_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| MetadataError::from_insert(e, format!("upload {}", session.upload_id)))?;
            Ok(())
        }

        async fn get_upload(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn advance_upload_offset(
            &self,
            upload_id: Uuid,
            expected: i64,
            new_offset: i64,
            updated_at: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE upload_sessions
                SET byte_offset = ?, updated_at = ?, expires_at = ?
                WHERE upload_id = ? AND state = 'open' AND byte_offset = ?
                "#,
            )
            .bind(new_offset)
            .bind(updated_at)
            .bind(expires_at)
            .bind(upload_id)
            .bind(expected)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn transition_upload(
            &self,
            upload_id: Uuid,
            from: &str,
            to: &str,
            digest: Option<&str>,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE upload_sessions
                SET state = ?, digest = COALESCE(?, digest), updated_at = ?
                WHERE upload_id = ? AND state = ?
                "#,
            )
            .bind(to)
            .bind(digest)
            .bind(updated_at)
            .bind(upload_id)
            .bind(from)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn list_expired_uploads(
            &self,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(
                r#"
                SELECT * FROM upload_sessions
                WHERE state = 'open' AND julianday(expires_at) < julianday(?)
                ORDER BY julianday(expires_at)
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn purge_terminal_uploads(&self, before: OffsetDateTime) -> MetadataResult<u64> {
            let result = sqlx::query(
                "DELETE FROM upload_sessions WHERE state IN ('committed', 'aborted', 'expired') \
                 AND julianday(updated_at) < julianday(?)",
            )
            .bind(before)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl LockRepo for SqliteStore {
        async fn try_acquire_lock(
            &self,
            name: &str,
            owner: &str,
            now: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT INTO dist_locks (name, owner, acquired_at, expires_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    owner = excluded.owner,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                WHERE julianday(dist_locks.expires_at) <= julianday(excluded.acquired_at)
                "#,
            )
            .bind(name)
            .bind(owner)
            .bind(now)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn refresh_lock(
            &self,
            name: &str,
            owner: &str,
            now: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE dist_locks SET expires_at = ? \
                 WHERE name = ? AND owner = ? AND julianday(expires_at) > julianday(?)",
            )
            .bind(expires_at)
            .bind(name)
            .bind(owner)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn release_lock(&self, name: &str, owner: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM dist_locks WHERE name = ? AND owner = ?")
                .bind(name)
                .bind(owner)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn get_lock(&self, name: &str) -> MetadataResult<Option<LockRow>> {
            let row = sqlx::query_as::<_, LockRow>("SELECT * FROM dist_locks WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Durable job queue
CREATE TABLE IF NOT EXISTS jobs (
    id BLOB PRIMARY KEY,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    payload TEXT NOT NULL,
    result TEXT,
    error TEXT,
    lock_id BLOB,
    locked_at TEXT,
    lock_expires_at TEXT,
    run_after TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_type ON jobs(job_type);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_lock_id ON jobs(lock_id);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

-- Proxy cache entries
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY,
    repository TEXT NOT NULL,
    path TEXT NOT NULL,
    backend TEXT NOT NULL,
    object_key TEXT,
    upstream_url TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    etag TEXT,
    last_modified TEXT,
    content_type TEXT,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    content_hash TEXT,
    negative INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_repo_fetched ON cache_entries(repository, fetched_at);
CREATE INDEX IF NOT EXISTS idx_cache_entries_fetched ON cache_entries(fetched_at);
CREATE INDEX IF NOT EXISTS idx_cache_entries_object ON cache_entries(backend, object_key);

-- Resumable upload sessions
CREATE TABLE IF NOT EXISTS upload_sessions (
    upload_id BLOB PRIMARY KEY,
    repository TEXT NOT NULL,
    artifact_name TEXT NOT NULL,
    staging_path TEXT NOT NULL,
    byte_offset INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'open',
    digest TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_state ON upload_sessions(state, expires_at);

-- Named lease locks
CREATE TABLE IF NOT EXISTS dist_locks (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;
