//! Binding of repositories to configured storage backends.

use crate::error::{StorageError, StorageResult};
use crate::from_config;
use crate::traits::StorageBackend;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use stowage_core::config::{RepositoryConfig, StorageBackendConfig, validate_storage_backends};

/// A backend together with the key it is registered under.
#[derive(Clone)]
pub struct ResolvedBackend {
    pub key: String,
    pub backend: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for ResolvedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedBackend")
            .field("key", &self.key)
            .field("backend", &self.backend.backend_name())
            .finish()
    }
}

/// All configured backends, keyed by record key.
///
/// Repositories with an explicit `storage` binding resolve to that record;
/// everything else resolves to the single default.
#[derive(Clone)]
pub struct StorageRegistry {
    backends: HashMap<String, Arc<dyn StorageBackend>>,
    bindings: HashMap<String, String>,
    default_key: String,
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.backends.keys().collect();
        keys.sort();
        f.debug_struct("StorageRegistry")
            .field("backends", &keys)
            .field("default_key", &self.default_key)
            .finish()
    }
}

impl StorageRegistry {
    /// Connect every configured backend and bind repositories to them.
    pub async fn from_config(
        records: &[StorageBackendConfig],
        repositories: &BTreeMap<String, RepositoryConfig>,
    ) -> StorageResult<Self> {
        validate_storage_backends(records).map_err(StorageError::Config)?;

        let mut backends = HashMap::with_capacity(records.len());
        for record in records {
            let backend = from_config(&record.backend).await?;
            tracing::debug!(
                key = %record.key,
                backend = backend.backend_name(),
                default = record.default,
                "Storage backend connected"
            );
            backends.insert(record.key.clone(), backend);
        }

        let default_key = records
            .iter()
            .find(|r| r.default)
            .map(|r| r.key.clone())
            .ok_or_else(|| StorageError::Config("no default storage backend".to_string()))?;

        Self::with_backends(backends, default_key, repositories)
    }

    /// Build a registry from already-constructed backends.
    pub fn with_backends(
        backends: HashMap<String, Arc<dyn StorageBackend>>,
        default_key: String,
        repositories: &BTreeMap<String, RepositoryConfig>,
    ) -> StorageResult<Self> {
        if !backends.contains_key(&default_key) {
            return Err(StorageError::Config(format!(
                "default storage backend '{default_key}' is not registered"
            )));
        }

        let mut bindings = HashMap::new();
        for (repository, config) in repositories {
            if let Some(key) = &config.storage {
                if !backends.contains_key(key) {
                    return Err(StorageError::Config(format!(
                        "repository '{repository}' references unknown storage backend '{key}'"
                    )));
                }
                bindings.insert(repository.clone(), key.clone());
            }
        }

        Ok(Self {
            backends,
            bindings,
            default_key,
        })
    }

    /// A registry holding one backend that serves every repository.
    pub fn single(key: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        let key = key.into();
        let mut backends = HashMap::new();
        backends.insert(key.clone(), backend);
        Self {
            backends,
            bindings: HashMap::new(),
            default_key: key,
        }
    }

    /// Look up a backend by record key.
    pub fn get(&self, key: &str) -> Option<ResolvedBackend> {
        self.backends.get(key).map(|backend| ResolvedBackend {
            key: key.to_string(),
            backend: Arc::clone(backend),
        })
    }

    /// Look up a backend by record key, failing on unknown keys.
    pub fn require(&self, key: &str) -> StorageResult<ResolvedBackend> {
        self.get(key)
            .ok_or_else(|| StorageError::Config(format!("unknown storage backend '{key}'")))
    }

    pub fn default_backend(&self) -> ResolvedBackend {
        ResolvedBackend {
            key: self.default_key.clone(),
            backend: Arc::clone(&self.backends[&self.default_key]),
        }
    }

    /// The backend a repository's objects live in.
    pub fn resolve(&self, repository: &str) -> ResolvedBackend {
        self.bindings
            .get(repository)
            .and_then(|key| self.get(key))
            .unwrap_or_else(|| self.default_backend())
    }

    /// Record keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.backends.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Run every backend's health check, failing on the first error.
    pub async fn health_check_all(&self) -> StorageResult<()> {
        for key in self.keys() {
            let backend = &self.backends[&key];
            backend.health_check().await.inspect_err(|e| {
                tracing::error!(key = %key, backend = backend.backend_name(), error = %e, "Storage health check failed");
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cloud::CloudBackend;
    use stowage_core::config::StorageConfig;

    fn repo(storage: Option<&str>) -> RepositoryConfig {
        RepositoryConfig {
            storage: storage.map(str::to_string),
            upstream: None,
            ttl_secs: None,
        }
    }

    fn two_backends() -> HashMap<String, Arc<dyn StorageBackend>> {
        let mut backends: HashMap<String, Arc<dyn StorageBackend>> = HashMap::new();
        backends.insert("local".into(), Arc::new(CloudBackend::memory("gcs")));
        backends.insert("archive".into(), Arc::new(CloudBackend::memory("azure")));
        backends
    }

    #[test]
    fn test_resolve_uses_binding_then_default() {
        let mut repos = BTreeMap::new();
        repos.insert("npm-proxy".to_string(), repo(Some("archive")));
        repos.insert("maven".to_string(), repo(None));

        let registry =
            StorageRegistry::with_backends(two_backends(), "local".into(), &repos).unwrap();

        assert_eq!(registry.resolve("npm-proxy").key, "archive");
        assert_eq!(registry.resolve("npm-proxy").backend.backend_name(), "azure");
        assert_eq!(registry.resolve("maven").key, "local");
        assert_eq!(registry.resolve("unlisted").key, "local");
        assert_eq!(registry.keys(), vec!["archive", "local"]);
    }

    #[test]
    fn test_unknown_binding_is_rejected() {
        let mut repos = BTreeMap::new();
        repos.insert("pypi".to_string(), repo(Some("nowhere")));

        let err = StorageRegistry::with_backends(two_backends(), "local".into(), &repos)
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(msg) if msg.contains("nowhere")));
        assert!(
            StorageRegistry::with_backends(two_backends(), "missing".into(), &BTreeMap::new())
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_from_config_requires_one_default() {
        let temp = tempfile::tempdir().unwrap();
        let records = vec![
            StorageBackendConfig {
                key: "a".into(),
                default: false,
                backend: StorageConfig::Filesystem {
                    path: temp.path().join("a"),
                },
            },
            StorageBackendConfig {
                key: "b".into(),
                default: false,
                backend: StorageConfig::Filesystem {
                    path: temp.path().join("b"),
                },
            },
        ];
        assert!(
            StorageRegistry::from_config(&records, &BTreeMap::new())
                .await
                .is_err()
        );

        let mut records = records;
        records[1].default = true;
        let registry = StorageRegistry::from_config(&records, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(registry.default_backend().key, "b");
        registry.health_check_all().await.unwrap();
    }
}
