//! Resumable, content-addressed blob uploads.
//!
//! Bytes accumulate in a private staging file per session. Finalize hashes
//! the staged content, verifies it against the client's digest and only then
//! streams it to storage under `blobs/sha256/<aa>/<digest>`. The staging
//! file is removed after the commit, so at least one copy always exists.

use crate::context::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use stowage_core::{
    BlobDigest, CommittedBlob, ContentHash, UploadId, UploadSession, UploadState, UploadStatus,
};
use stowage_metadata::UploadSessionRow;
use time::OffsetDateTime;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

/// Read buffer for hashing and committing staged files.
const STAGING_READ_BUF: usize = 64 * 1024;

/// Storage key of a committed blob.
pub fn blob_key(digest: &BlobDigest) -> String {
    let hex = digest.hex();
    format!("blobs/sha256/{}/{hex}", &hex[..2])
}

/// Outcome of one garbage collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UploadGcReport {
    pub expired: u64,
    pub purged: u64,
}

/// Manages upload sessions for every repository.
#[derive(Clone)]
pub struct UploadSessionManager {
    ctx: EngineContext,
    /// Serializes appends and finalize per session within this process.
    guards: Arc<DashMap<UploadId, Arc<Mutex<()>>>>,
}

impl UploadSessionManager {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            guards: Arc::new(DashMap::new()),
        }
    }

    fn staging_path(&self, session: &UploadSession) -> PathBuf {
        self.ctx.config.uploads.staging_dir.join(&session.staging_path)
    }

    /// Run `op` holding the session's mutex, then drop the mutex from the
    /// map unless another caller is queued on it.
    async fn with_guard<T, F, Fut>(&self, id: UploadId, op: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let guard = Arc::clone(self.guards.entry(id).or_default().value());
        let result = {
            let _held = guard.lock().await;
            op().await
        };
        drop(guard);
        self.guards.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Start a session with an empty private staging file.
    #[tracing::instrument(skip(self))]
    pub async fn initiate(
        &self,
        repository: &str,
        artifact_name: &str,
    ) -> EngineResult<UploadSession> {
        if repository.is_empty() || artifact_name.is_empty() {
            return Err(EngineError::InvalidRequest(
                "repository and artifact name are required".to_string(),
            ));
        }
        let session = UploadSession::new(
            repository,
            artifact_name,
            self.ctx.config.uploads.session_ttl(),
        );

        let path = self.staging_path(&session);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // create_new: a session never shares a staging file.
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        if let Err(e) = self
            .ctx
            .metadata
            .create_upload(&UploadSessionRow::from(&session))
            .await
        {
            remove_staging(&path).await;
            return Err(e.into());
        }

        metrics::UPLOAD_SESSIONS_INITIATED.inc();
        tracing::info!(upload_id = %session.id, "Upload session initiated");
        Ok(session)
    }

    /// Load an open, unexpired session belonging to `repository`.
    async fn open_session(&self, repository: &str, id: UploadId) -> EngineResult<UploadSession> {
        let row = self
            .ctx
            .metadata
            .get_upload(*id.as_uuid())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("upload {id}")))?;
        let session = UploadSession::try_from(row)?;

        if session.repository != repository {
            return Err(EngineError::NotFound(format!("upload {id}")));
        }
        if session.state != UploadState::Open {
            return Err(EngineError::NotFound(format!(
                "upload {id} is {}",
                session.state
            )));
        }
        if session.is_expired() {
            return Err(EngineError::NotFound(format!("upload {id} has expired")));
        }
        Ok(session)
    }

    /// Append `chunk` at the session's current offset.
    ///
    /// With offset enforcement on, `expected_offset` must match the offset
    /// already stored, which rejects duplicated or overlapping chunks.
    #[tracing::instrument(skip(self, chunk), fields(len = chunk.len()))]
    pub async fn append(
        &self,
        repository: &str,
        id: UploadId,
        expected_offset: Option<u64>,
        chunk: Bytes,
    ) -> EngineResult<u64> {
        self.with_guard(id, || async {
            let session = self.open_session(repository, id).await?;
            self.append_locked(&session, expected_offset, &chunk).await
        })
        .await
    }

    async fn append_locked(
        &self,
        session: &UploadSession,
        expected_offset: Option<u64>,
        chunk: &[u8],
    ) -> EngineResult<u64> {
        if self.ctx.config.uploads.enforce_offsets
            && let Some(expected) = expected_offset
            && expected != session.offset
        {
            return Err(EngineError::OffsetMismatch {
                expected: session.offset,
                actual: expected,
            });
        }
        if chunk.is_empty() {
            return Ok(session.offset);
        }

        let new_offset = session.offset + chunk.len() as u64;
        let path = self.staging_path(session);
        let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
        // Writing at the recorded offset overwrites bytes of a failed append.
        file.seek(SeekFrom::Start(session.offset)).await?;
        file.write_all(chunk).await?;
        file.set_len(new_offset).await?;
        file.sync_data().await?;

        let now = OffsetDateTime::now_utc();
        let advanced = self
            .ctx
            .metadata
            .advance_upload_offset(
                *session.id.as_uuid(),
                i64::try_from(session.offset).unwrap_or(i64::MAX),
                i64::try_from(new_offset).unwrap_or(i64::MAX),
                now,
                now.saturating_add(self.ctx.config.uploads.session_ttl()),
            )
            .await?;
        if !advanced {
            let current = self
                .ctx
                .metadata
                .get_upload(*session.id.as_uuid())
                .await?
                .map_or(session.offset, |row| u64::try_from(row.byte_offset).unwrap_or(0));
            return Err(EngineError::OffsetMismatch {
                expected: current,
                actual: session.offset,
            });
        }

        metrics::UPLOAD_BYTES_APPENDED.inc_by(chunk.len() as u64);
        tracing::debug!(upload_id = %session.id, offset = new_offset, "Chunk appended");
        Ok(new_offset)
    }

    /// Verify and commit the session's content.
    ///
    /// A digest mismatch aborts the session and leaves nothing under the
    /// blob key. Finalize skips the write when the blob already exists.
    #[tracing::instrument(skip(self, final_chunk))]
    pub async fn finalize(
        &self,
        repository: &str,
        artifact_name: &str,
        id: UploadId,
        expected_digest: Option<&str>,
        final_chunk: Option<Bytes>,
    ) -> EngineResult<CommittedBlob> {
        self.with_guard(id, || {
            self.finalize_locked(repository, artifact_name, id, expected_digest, final_chunk)
        })
        .await
    }

    async fn finalize_locked(
        &self,
        repository: &str,
        artifact_name: &str,
        id: UploadId,
        expected_digest: Option<&str>,
        final_chunk: Option<Bytes>,
    ) -> EngineResult<CommittedBlob> {
        let started = Instant::now();
        let mut session = self.open_session(repository, id).await?;
        if session.artifact_name != artifact_name {
            return Err(EngineError::InvalidRequest(format!(
                "upload {id} belongs to artifact '{}'",
                session.artifact_name
            )));
        }
        let expected = expected_digest
            .map(str::parse::<BlobDigest>)
            .transpose()?;

        if let Some(chunk) = final_chunk.filter(|c| !c.is_empty()) {
            session.offset = self.append_locked(&session, None, &chunk).await?;
        }

        let path = self.staging_path(&session);
        // Bytes past the acknowledged offset come from a failed append.
        truncate_staging(&path, session.offset).await?;
        let (actual, size) = hash_file(&path).await?;
        let actual = BlobDigest::from_hash(actual);

        if let Some(expected) = expected
            && expected != actual
        {
            metrics::UPLOAD_DIGEST_MISMATCHES.inc();
            tracing::warn!(upload_id = %id, expected = %expected, actual = %actual, "Upload digest mismatch");
            self.close(&session, UploadState::Aborted, None).await?;
            metrics::UPLOAD_SESSIONS_ABORTED.inc();
            return Err(EngineError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        let resolved = self.ctx.storage.resolve(repository);
        let key = blob_key(&actual);
        let stored = if resolved.backend.exists(&key).await? {
            metrics::UPLOAD_BLOBS_DEDUPLICATED.inc();
            tracing::debug!(upload_id = %id, key = %key, "Blob already stored");
            false
        } else {
            commit_file(&path, resolved.backend.as_ref(), &key).await?;
            true
        };

        let digest = actual.to_string();
        let committed = self
            .ctx
            .metadata
            .transition_upload(
                *id.as_uuid(),
                UploadState::Open.as_str(),
                UploadState::Committed.as_str(),
                Some(&digest),
                OffsetDateTime::now_utc(),
            )
            .await?;
        if !committed {
            return Err(EngineError::NotFound(format!(
                "upload {id} was closed during finalize"
            )));
        }
        remove_staging(&path).await;

        metrics::UPLOAD_SESSIONS_FINALIZED.inc();
        metrics::UPLOAD_FINALIZE_DURATION.observe(started.elapsed().as_secs_f64());
        tracing::info!(upload_id = %id, digest = %digest, size, stored, "Upload finalized");

        Ok(CommittedBlob {
            upload_id: id,
            repository: session.repository,
            artifact_name: session.artifact_name,
            digest: actual,
            size,
            storage_key: key,
            backend: resolved.key,
            stored,
        })
    }

    /// Progress of any session, open or not.
    pub async fn status(&self, id: UploadId) -> EngineResult<UploadStatus> {
        let row = self
            .ctx
            .metadata
            .get_upload(*id.as_uuid())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("upload {id}")))?;
        let session = UploadSession::try_from(row)?;
        Ok(UploadStatus::from(&session))
    }

    /// Abandon an open session and remove its staging file.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self, repository: &str, id: UploadId) -> EngineResult<()> {
        self.with_guard(id, || async {
            let session = self.open_session(repository, id).await?;
            self.close(&session, UploadState::Aborted, None).await?;
            metrics::UPLOAD_SESSIONS_ABORTED.inc();
            tracing::info!(upload_id = %id, "Upload aborted");
            Ok(())
        })
        .await
    }

    /// Move an open session to a terminal state, then drop its staging file.
    async fn close(
        &self,
        session: &UploadSession,
        to: UploadState,
        digest: Option<&str>,
    ) -> EngineResult<bool> {
        let closed = self
            .ctx
            .metadata
            .transition_upload(
                *session.id.as_uuid(),
                UploadState::Open.as_str(),
                to.as_str(),
                digest,
                OffsetDateTime::now_utc(),
            )
            .await?;
        if closed {
            remove_staging(&self.staging_path(session)).await;
        }
        Ok(closed)
    }

    /// Expire sessions past their deadline and purge old terminal records.
    #[tracing::instrument(skip(self))]
    pub async fn gc_expired(&self, batch_size: u32) -> EngineResult<UploadGcReport> {
        let now = OffsetDateTime::now_utc();
        let mut report = UploadGcReport::default();

        loop {
            let rows = self
                .ctx
                .metadata
                .list_expired_uploads(now, batch_size.max(1))
                .await?;
            if rows.is_empty() {
                break;
            }
            let mut progressed = false;
            for row in rows {
                let session = UploadSession::try_from(row)?;
                if self.close(&session, UploadState::Expired, None).await? {
                    progressed = true;
                    report.expired += 1;
                    metrics::UPLOAD_SESSIONS_EXPIRED.inc();
                    tracing::info!(upload_id = %session.id, "Expired upload session collected");
                }
            }
            if !progressed {
                break;
            }
        }

        let retention = self.ctx.config.uploads.terminal_retention();
        report.purged = self
            .ctx
            .metadata
            .purge_terminal_uploads(now.saturating_sub(retention))
            .await?;
        Ok(report)
    }
}

/// Cut a staged file back to the bytes the session has acknowledged.
async fn truncate_staging(path: &std::path::Path, len: u64) -> EngineResult<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    if file.metadata().await?.len() > len {
        file.set_len(len).await?;
        file.sync_data().await?;
    }
    Ok(())
}

/// SHA-256 and length of a staged file.
async fn hash_file(path: &std::path::Path) -> EngineResult<(ContentHash, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let mut stream = ReaderStream::with_capacity(file, STAGING_READ_BUF);
    let mut hasher = ContentHash::hasher();
    let mut size = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
    }
    Ok((hasher.finalize(), size))
}

/// Stream a staged file into storage under `key`.
async fn commit_file(
    path: &std::path::Path,
    backend: &dyn stowage_storage::StorageBackend,
    key: &str,
) -> EngineResult<()> {
    let file = tokio::fs::File::open(path).await?;
    let mut stream = ReaderStream::with_capacity(file, STAGING_READ_BUF);
    let mut upload = backend.put_stream(key).await?;
    while let Some(chunk) = stream.next().await {
        let written = match chunk {
            Ok(chunk) => upload.write(chunk).await.map_err(EngineError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            if let Err(abort_err) = upload.abort().await {
                tracing::warn!(key, error = %abort_err, "Failed to abort blob upload");
            }
            return Err(e);
        }
    }
    upload.finish().await?;
    Ok(())
}

async fn remove_staging(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staging file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::HttpUpstream;
    use std::time::Duration;
    use stowage_core::config::AppConfig;
    use stowage_metadata::{MetadataStore, SqliteStore};
    use stowage_storage::StorageRegistry;

    async fn manager() -> (tempfile::TempDir, UploadSessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::for_testing(dir.path());
        let storage = StorageRegistry::from_config(&config.storage, &config.repositories)
            .await
            .unwrap();
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(dir.path().join("metadata.db"), None)
                .await
                .unwrap(),
        );
        let upstream = Arc::new(HttpUpstream::new(Duration::from_secs(1)).unwrap());
        let ctx = EngineContext::new(config, storage, metadata, upstream, "upload-tests");
        (dir, UploadSessionManager::new(ctx))
    }

    #[tokio::test]
    async fn test_unknown_sessions_leave_no_guard_behind() {
        let (_dir, uploads) = manager().await;
        let id = UploadId::new();

        let err = uploads
            .append("docker", id, Some(0), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(uploads.finalize("docker", "app", id, None, None).await.is_err());
        assert!(uploads.abort("docker", id).await.is_err());
        assert!(uploads.guards.is_empty());
    }

    #[tokio::test]
    async fn test_guards_are_dropped_after_each_call() {
        let (_dir, uploads) = manager().await;
        let session = uploads.initiate("docker", "app").await.unwrap();

        uploads
            .append("docker", session.id, Some(0), Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert!(uploads.guards.is_empty());

        // A rejected chunk and a foreign repository are both errors.
        assert!(
            uploads
                .append("docker", session.id, Some(0), Bytes::from_static(b"abc"))
                .await
                .is_err()
        );
        assert!(
            uploads
                .append("maven", session.id, Some(3), Bytes::from_static(b"d"))
                .await
                .is_err()
        );
        assert!(uploads.guards.is_empty());

        uploads
            .finalize("docker", "app", session.id, None, None)
            .await
            .unwrap();
        assert!(uploads.guards.is_empty());
    }

    #[test]
    fn test_blob_keys_fan_out_by_prefix() {
        let digest = BlobDigest::from_hash(ContentHash::compute(b""));
        assert_eq!(
            blob_key(&digest),
            "blobs/sha256/e3/e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
