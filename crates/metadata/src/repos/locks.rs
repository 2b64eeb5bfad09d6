//! Named lease locks.

use crate::error::MetadataResult;
use crate::models::LockRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for named, expiring locks shared across processes.
#[async_trait]
pub trait LockRepo: Send + Sync {
    /// Take `name` for `owner` until `expires_at`.
    ///
    /// Succeeds when the lock is free or its previous lease expired before
    /// `now`. A holder re-acquiring its own live lock gets false.
    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Extend a live lease held by `owner`.
    async fn refresh_lock(
        &self,
        name: &str,
        owner: &str,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Release a lock held by `owner`. Releasing a lock owned by someone
    /// else is a no-op returning false.
    async fn release_lock(&self, name: &str, owner: &str) -> MetadataResult<bool>;

    async fn get_lock(&self, name: &str) -> MetadataResult<Option<LockRow>>;
}
