//! Proxy cache vocabulary shared by the engine and metadata layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a cached response was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheState {
    /// Served from a fresh cache entry without contacting upstream.
    Hit,
    /// No usable entry existed; content came from upstream.
    Miss,
    /// A stale entry was checked against upstream and refreshed or replaced.
    Revalidated,
    /// Upstream failed and a stale entry was served instead.
    StaleError,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Revalidated => "revalidated",
            Self::StaleError => "stale-error",
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream validators used for conditional revalidation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validator {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Prefer freshly returned validators, keeping stored ones the upstream omitted.
    pub fn merged_with(&self, newer: &Validator) -> Validator {
        Validator {
            etag: newer.etag.clone().or_else(|| self.etag.clone()),
            last_modified: newer
                .last_modified
                .clone()
                .or_else(|| self.last_modified.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_state_tags() {
        assert_eq!(CacheState::Hit.as_str(), "hit");
        assert_eq!(CacheState::StaleError.to_string(), "stale-error");
        assert_eq!(
            serde_json::to_string(&CacheState::Revalidated).unwrap(),
            "\"revalidated\""
        );
        assert_eq!(
            serde_json::from_str::<CacheState>("\"stale-error\"").unwrap(),
            CacheState::StaleError
        );
    }

    #[test]
    fn test_validator_merge_keeps_missing_fields() {
        let stored = Validator {
            etag: Some("\"v1\"".to_string()),
            last_modified: Some("Tue, 01 Oct 2024 00:00:00 GMT".to_string()),
        };
        let fresh = Validator {
            etag: Some("\"v2\"".to_string()),
            last_modified: None,
        };
        let merged = stored.merged_with(&fresh);
        assert_eq!(merged.etag.as_deref(), Some("\"v2\""));
        assert_eq!(merged.last_modified, stored.last_modified);
        assert!(Validator::default().is_empty());
    }
}
