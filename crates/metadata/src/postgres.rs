//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{CacheEntryRepo, ClaimRequest, JobRepo, LockRepo, UploadRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres, QueryBuilder};
use std::str::FromStr;
use stowage_core::config::PgSslMode;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Claimability predicate: `$1` is the claim time.
const PG_CLAIMABLE: &str = "((status = 'pending' AND run_after <= $1) \
     OR (status = 'running' AND lock_expires_at <= $1 AND attempts < max_attempts))";

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters,
    /// so the password can come from its own environment variable.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements hold one command each.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl JobRepo for PostgresStore {
    async fn enqueue_job(&self, job: &JobRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, status, payload, result, error, lock_id, locked_at,
                lock_expires_at, run_after, started_at, completed_at, attempts,
                max_attempts, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
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
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn claim_jobs(&self, request: &ClaimRequest<'_>) -> MetadataResult<Vec<JobRow>> {
        let mut select = QueryBuilder::<Postgres>::new(
            "SELECT id FROM jobs WHERE ((status = 'pending' AND run_after <= ",
        );
        select
            .push_bind(request.now)
            .push(") OR (status = 'running' AND lock_expires_at <= ")
            .push_bind(request.now)
            .push(" AND attempts < max_attempts))");
        if !request.job_types.is_empty() {
            select.push(" AND job_type IN (");
            let mut types = select.separated(", ");
            for job_type in request.job_types {
                types.push_bind(*job_type);
            }
            types.push_unseparated(")");
        }
        select
            .push(" ORDER BY created_at, id LIMIT ")
            .push_bind(i64::from(request.limit));

        let candidates = select
            .build_query_scalar::<Uuid>()
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            // RETURNING only yields a row when this update won the compare-and-set.
            let row = sqlx::query_as::<_, JobRow>(&format!(
                "UPDATE jobs SET status = 'running', lock_id = $2, locked_at = $1, \
                 lock_expires_at = $3, started_at = COALESCE(started_at, $1), \
                 attempts = attempts + 1, updated_at = $1 \
                 WHERE id = $4 AND {PG_CLAIMABLE} RETURNING *"
            ))
            .bind(request.now)
            .bind(request.lock_id)
            .bind(request.lease_expires_at)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
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
            "UPDATE jobs SET lock_expires_at = $1, updated_at = $2 \
             WHERE id = $3 AND lock_id = $4 AND status = 'running'",
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
            SET status = 'completed', result = $1, error = NULL, completed_at = $2,
                lock_id = NULL, locked_at = NULL, lock_expires_at = NULL, updated_at = $2
            WHERE id = $3 AND lock_id = $4 AND status = 'running'
            "#,
        )
        .bind(result)
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
                completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE $1 END,
                run_after = $2, error = $3,
                lock_id = NULL, locked_at = NULL, lock_expires_at = NULL, updated_at = $1
            WHERE id = $4 AND lock_id = $5 AND status = 'running'
            "#,
        )
        .bind(now)
        .bind(retry_at)
        .bind(error)
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
            SET status = 'failed', completed_at = $1,
                error = COALESCE(error, 'lease expired with no attempts left'),
                lock_id = NULL, locked_at = NULL, lock_expires_at = NULL, updated_at = $1
            WHERE status = 'running' AND lock_expires_at <= $1 AND attempts >= max_attempts
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_active_jobs(&self, job_type: &str) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE job_type = $1 AND status IN ('pending', 'running')",
        )
        .bind(job_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_jobs(&self, status: Option<&str>, limit: u32) -> MetadataResult<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(status)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn purge_finished_jobs(&self, before: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND completed_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CacheEntryRepo for PostgresStore {
    async fn get_cache_entry(&self, cache_key: &str) -> MetadataResult<Option<CacheEntryRow>> {
        let row =
            sqlx::query_as::<_, CacheEntryRow>("SELECT * FROM cache_entries WHERE cache_key = $1")
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

        // Row lock so concurrent replacements see each other's previous row.
        let previous = sqlx::query_as::<_, CacheEntryRow>(
            "SELECT * FROM cache_entries WHERE cache_key = $1 FOR UPDATE",
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
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (cache_key) DO UPDATE SET
                repository = EXCLUDED.repository,
                path = EXCLUDED.path,
                backend = EXCLUDED.backend,
                object_key = EXCLUDED.object_key,
                upstream_url = EXCLUDED.upstream_url,
                fetched_at = EXCLUDED.fetched_at,
                expires_at = EXCLUDED.expires_at,
                etag = EXCLUDED.etag,
                last_modified = EXCLUDED.last_modified,
                content_type = EXCLUDED.content_type,
                size_bytes = EXCLUDED.size_bytes,
                content_hash = EXCLUDED.content_hash,
                negative = EXCLUDED.negative
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
            SET fetched_at = $1, expires_at = $2,
                etag = COALESCE($3, etag),
                last_modified = COALESCE($4, last_modified)
            WHERE cache_key = $5
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

    async fn delete_cache_entry(&self, cache_key: &str) -> MetadataResult<Option<CacheEntryRow>> {
        let row = sqlx::query_as::<_, CacheEntryRow>(
            "DELETE FROM cache_entries WHERE cache_key = $1 RETURNING *",
        )
        .bind(cache_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_cache_entries(
        &self,
        repository: Option<&str>,
        after: Option<&CacheEntryCursor>,
        limit: u32,
    ) -> MetadataResult<Vec<CacheEntryRow>> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT * FROM cache_entries WHERE TRUE");
        if let Some(repository) = repository {
            query.push(" AND repository = ").push_bind(repository);
        }
        if let Some(cursor) = after {
            query
                .push(" AND (fetched_at, cache_key) > (")
                .push_bind(cursor.fetched_at)
                .push(", ")
                .push_bind(&cursor.cache_key)
                .push(")");
        }
        query
            .push(" ORDER BY fetched_at, cache_key LIMIT ")
            .push_bind(i64::from(limit));

        let rows = query
            .build_query_as::<CacheEntryRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn cache_entry_stats(&self, repository: Option<&str>) -> MetadataResult<CacheEntryStats> {
        let (count, total): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*)::BIGINT, COALESCE(SUM(size_bytes), 0)::BIGINT FROM cache_entries \
             WHERE ($1::TEXT IS NULL OR repository = $1)",
        )
        .bind(repository)
        .fetch_one(&self.pool)
        .await?;
        Ok(CacheEntryStats {
            count: count.max(0) as u64,
            total_bytes: total.max(0) as u64,
        })
    }

    async fn is_object_referenced(&self, backend: &str, object_key: &str) -> MetadataResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM cache_entries WHERE backend = $1 AND object_key = $2)",
        )
        .bind(backend)
        .bind(object_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl UploadRepo for PostgresStore {
    async fn create_upload(&self, session: &UploadSessionRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                upload_id, repository, artifact_name, staging_path, byte_offset,
                state, digest, created_at, updated_at, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            "SELECT * FROM upload_sessions WHERE upload_id = $1",
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
            SET byte_offset = $1, updated_at = $2, expires_at = $3
            WHERE upload_id = $4 AND state = 'open' AND byte_offset = $5
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
            SET state = $1, digest = COALESCE($2, digest), updated_at = $3
            WHERE upload_id = $4 AND state = $5
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
            WHERE state = 'open' AND expires_at < $1
            ORDER BY expires_at
            LIMIT $2
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
             AND updated_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LockRepo for PostgresStore {
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
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                owner = EXCLUDED.owner,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE dist_locks.expires_at <= EXCLUDED.acquired_at
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
            "UPDATE dist_locks SET expires_at = $1 WHERE name = $2 AND owner = $3 AND expires_at > $4",
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
        let result = sqlx::query("DELETE FROM dist_locks WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_lock(&self, name: &str) -> MetadataResult<Option<LockRow>> {
        let row = sqlx::query_as::<_, LockRow>("SELECT * FROM dist_locks WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_skip_comments() {
        let statements = postgres_schema_statements(POSTGRES_SCHEMA);
        assert!(statements.iter().all(|s| !s.is_empty()));
        assert!(
            statements
                .iter()
                .any(|s| s.contains("CREATE TABLE IF NOT EXISTS jobs"))
        );
        assert_eq!(
            postgres_schema_statements("-- only a comment;\n;  ;SELECT 1;"),
            vec!["SELECT 1"]
        );
    }
}
