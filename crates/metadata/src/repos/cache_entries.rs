//! Proxy cache entry repository.

use crate::error::MetadataResult;
use crate::models::{CacheEntryCursor, CacheEntryRow, CacheEntryStats};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for proxy cache entries.
#[async_trait]
pub trait CacheEntryRepo: Send + Sync {
    async fn get_cache_entry(&self, cache_key: &str) -> MetadataResult<Option<CacheEntryRow>>;

    /// Insert or replace an entry in one statement set, returning the row it
    /// replaced so the caller can delete the superseded object.
    async fn replace_cache_entry(
        &self,
        entry: &CacheEntryRow,
    ) -> MetadataResult<Option<CacheEntryRow>>;

    /// Refresh freshness and validators after a "not modified" answer.
    /// Returns false if the entry no longer exists.
    async fn refresh_cache_entry(
        &self,
        cache_key: &str,
        fetched_at: OffsetDateTime,
        expires_at: OffsetDateTime,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> MetadataResult<bool>;

    /// Delete an entry, returning it.
    async fn delete_cache_entry(&self, cache_key: &str) -> MetadataResult<Option<CacheEntryRow>>;

    /// Page through entries oldest-first (by `fetched_at`, then key).
    async fn list_cache_entries(
        &self,
        repository: Option<&str>,
        after: Option<&CacheEntryCursor>,
        limit: u32,
    ) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Count and total size of entries, optionally for one repository.
    async fn cache_entry_stats(&self, repository: Option<&str>) -> MetadataResult<CacheEntryStats>;

    /// Whether any entry references `object_key` on `backend`.
    async fn is_object_referenced(&self, backend: &str, object_key: &str) -> MetadataResult<bool>;
}
