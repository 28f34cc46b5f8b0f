//! # vstore-fetch
//!
//! The backing store consumed by the virtual filesystem.
//!
//! [`BackingStore`] is the facade: four hash-keyed fetch operations plus
//! prefetch and stats, all forwarded to a [`FetchCoordinator`] that owns the
//! local cache, the backend adapters and the in-flight table.

pub mod coordinator;
pub mod popularity;
pub mod stats;

use std::sync::Arc;

use thiserror::Error;

use vstore_backend::adapters_from_config;
use vstore_cache::{CacheError, DiskStore, LocalStore, MemoryStore};
use vstore_config::{log_fetch_info, Config};
use vstore_model::{Blob, CommitId, Hash, Tree};

pub use coordinator::{FetchCoordinator, FetchKey, FetchPolicy};
pub use popularity::PopularityTracker;
pub use stats::FetchStatsSnapshot;
pub use vstore_backend::{
    BackendAdapter, FetchCause, FetchError, FetchObserver, FetchOrigin, FetchPriority,
    FetchResult, ObjectFetchContext, Operation,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to open local cache: {0}")]
    Cache(#[from] CacheError),
}

/// Hash-keyed object access for the filesystem layer.
#[derive(Clone)]
pub struct BackingStore {
    coordinator: FetchCoordinator,
}

impl BackingStore {
    pub fn new(coordinator: FetchCoordinator) -> Self {
        Self { coordinator }
    }

    /// Wire up cache, backends, policy and popularity routing from `config`.
    pub fn from_config(config: &Config) -> Result<Self, BuildError> {
        let cache: Arc<dyn LocalStore> = if config.cache.ephemeral {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(
                DiskStore::open(&config.cache.root)?
                    .with_verify_on_read(config.cache.verify_on_read),
            )
        };
        let backends = adapters_from_config(config);
        let popularity = PopularityTracker::from_config(&config.popularity);

        log_fetch_info!(
            "Backing store ready",
            cache = cache.name(),
            backends = tracing::field::debug(
                backends.iter().map(|b| b.name().to_string()).collect::<Vec<_>>()
            ),
            popularity = popularity.is_some(),
        );

        Ok(Self::new(FetchCoordinator::new(
            cache,
            backends,
            FetchPolicy::from_config(&config.fetch),
            popularity,
        )))
    }

    pub async fn get_blob(&self, hash: &Hash, ctx: &ObjectFetchContext) -> FetchResult<Blob> {
        self.coordinator.fetch_blob(*hash, ctx).await
    }

    pub async fn get_tree(&self, hash: &Hash, ctx: &ObjectFetchContext) -> FetchResult<Tree> {
        self.coordinator.fetch_tree(*hash, ctx).await
    }

    pub async fn get_tree_for_commit(
        &self,
        commit: &CommitId,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Tree> {
        self.coordinator.fetch_tree_for_commit(commit, ctx).await
    }

    pub async fn get_tree_for_manifest(
        &self,
        commit: &CommitId,
        manifest: &Hash,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Tree> {
        self.coordinator
            .fetch_tree_for_manifest(commit, *manifest, ctx)
            .await
    }

    pub async fn prefetch_blobs(
        &self,
        hashes: Vec<Hash>,
        ctx: &ObjectFetchContext,
    ) -> Vec<(Hash, FetchResult<()>)> {
        self.coordinator.prefetch_blobs(hashes, ctx).await
    }

    pub fn stats(&self) -> FetchStatsSnapshot {
        self.coordinator.stats()
    }

    pub fn pending_fetches(&self) -> usize {
        self.coordinator.pending()
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vstore_config::BackendKind;

    #[test]
    fn test_from_config_disk_cache() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.cache.root = temp.path().join("cache");
        config.backends.legacy = Some(vstore_config::EndpointConfig {
            endpoint: "127.0.0.1:1".into(),
            max_frame_bytes: 1024,
        });

        let store = BackingStore::from_config(&config).unwrap();
        assert_eq!(store.coordinator().cache().name(), "disk");
        let kinds: Vec<_> = store.coordinator().backends().iter().map(|b| b.kind()).collect();
        assert_eq!(kinds, vec![BackendKind::Legacy]);
        assert!(temp.path().join("cache").exists());
    }

    #[test]
    fn test_from_config_ephemeral() {
        let mut config = Config::default();
        config.cache.ephemeral = true;
        config.cache.root = "/nonexistent/never/created".into();
        let store = BackingStore::from_config(&config).unwrap();
        assert_eq!(store.coordinator().cache().name(), "memory");
        assert_eq!(store.pending_fetches(), 0);
    }
}
