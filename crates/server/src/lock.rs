//! Named lease locks shared across processes.

use crate::error::EngineResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use stowage_metadata::MetadataStore;
use time::OffsetDateTime;

/// Mutual exclusion per name with lease expiry.
///
/// A holder that stops refreshing loses the lock once its lease runs out.
/// Release only succeeds for the current owner.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take `name` for `ttl`. Returns false while another owner holds it.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> EngineResult<bool>;

    /// Extend a held lock. Returns false if the lease was lost.
    async fn refresh(&self, name: &str, ttl: Duration) -> EngineResult<bool>;

    async fn release(&self, name: &str) -> EngineResult<bool>;

    /// Whether this owner currently holds an unexpired lease on `name`.
    async fn is_held(&self, name: &str) -> EngineResult<bool>;

    fn owner(&self) -> &str;
}

/// Lease lock stored in the metadata database.
pub struct MetadataLock {
    metadata: Arc<dyn MetadataStore>,
    owner: String,
}

impl MetadataLock {
    pub fn new(metadata: Arc<dyn MetadataStore>, owner: impl Into<String>) -> Self {
        Self {
            metadata,
            owner: owner.into(),
        }
    }
}

pub(crate) fn lease_end(now: OffsetDateTime, ttl: Duration) -> OffsetDateTime {
    now.saturating_add(time::Duration::try_from(ttl).unwrap_or(time::Duration::MAX))
}

#[async_trait]
impl DistributedLock for MetadataLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> EngineResult<bool> {
        let now = OffsetDateTime::now_utc();
        let acquired = self
            .metadata
            .try_acquire_lock(name, &self.owner, now, lease_end(now, ttl))
            .await?;
        tracing::trace!(lock = %name, owner = %self.owner, acquired, "Lock acquire attempt");
        Ok(acquired)
    }

    async fn refresh(&self, name: &str, ttl: Duration) -> EngineResult<bool> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .metadata
            .refresh_lock(name, &self.owner, now, lease_end(now, ttl))
            .await?)
    }

    async fn release(&self, name: &str) -> EngineResult<bool> {
        Ok(self.metadata.release_lock(name, &self.owner).await?)
    }

    async fn is_held(&self, name: &str) -> EngineResult<bool> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .metadata
            .get_lock(name)
            .await?
            .is_some_and(|lock| lock.owner == self.owner && lock.expires_at > now))
    }

    fn owner(&self) -> &str {
        &self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_metadata::SqliteStore;

    async fn store() -> (tempfile::TempDir, Arc<dyn MetadataStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("locks.db"), None)
            .await
            .unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn test_two_owners_exclude_each_other() {
        let (_dir, metadata) = store().await;
        let a = MetadataLock::new(metadata.clone(), "worker-a");
        let b = MetadataLock::new(metadata, "worker-b");
        let ttl = Duration::from_secs(30);

        assert!(a.try_acquire("fill:npm/x", ttl).await.unwrap());
        assert!(!b.try_acquire("fill:npm/x", ttl).await.unwrap());
        assert!(a.is_held("fill:npm/x").await.unwrap());
        assert!(!b.is_held("fill:npm/x").await.unwrap());

        assert!(!b.release("fill:npm/x").await.unwrap());
        assert!(a.refresh("fill:npm/x", ttl).await.unwrap());
        assert!(a.release("fill:npm/x").await.unwrap());
        assert!(b.try_acquire("fill:npm/x", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let (_dir, metadata) = store().await;
        let a = MetadataLock::new(metadata.clone(), "worker-a");
        let b = MetadataLock::new(metadata, "worker-b");

        assert!(a.try_acquire("sweep", Duration::from_millis(50)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!a.is_held("sweep").await.unwrap());
        assert!(b.try_acquire("sweep", Duration::from_secs(30)).await.unwrap());
        assert!(!a.refresh("sweep", Duration::from_secs(30)).await.unwrap());
    }
}
