//! Scripted backends and stores shared by the fetch tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use vstore_backend::BackendStatsSnapshot;
use vstore_cache::{CacheError, KeySpace, LocalStore, MemoryStore};
use vstore_config::{BackendKind, RetryConfig};
use vstore_fetch::{
    BackendAdapter, FetchCoordinator, FetchError, FetchKey, FetchPolicy, FetchResult,
    ObjectFetchContext, Operation, PopularityTracker,
};
use vstore_model::tree::{EntryKind, TreeEntry};
use vstore_model::{CommitId, Hash, Tree};

type Responder = dyn Fn(&FetchKey, usize) -> FetchResult<Bytes> + Send + Sync;

/// Backend answering from a closure of (request, call index).
pub struct MockBackend {
    kind: BackendKind,
    supported: Vec<Operation>,
    delay: Duration,
    calls: AtomicUsize,
    respond: Box<Responder>,
}

impl MockBackend {
    pub fn new<F>(kind: BackendKind, respond: F) -> Self
    where
        F: Fn(&FetchKey, usize) -> FetchResult<Bytes> + Send + Sync + 'static,
    {
        Self {
            kind,
            supported: Operation::ALL.to_vec(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            respond: Box::new(respond),
        }
    }

    /// Serves a single blob; everything else is not found.
    pub fn with_blob(kind: BackendKind, content: &'static [u8]) -> Self {
        let hash = Hash::of(content);
        Self::new(kind, move |key, _| match key {
            FetchKey::Blob(h) if *h == hash => Ok(Bytes::from_static(content)),
            other => Err(FetchError::not_found(other.kind(), other.id())),
        })
    }

    pub fn unavailable(kind: BackendKind) -> Self {
        Self::new(kind, move |_, _| {
            Err(FetchError::unavailable(kind.as_str(), "connection refused"))
        })
    }

    pub fn not_found(kind: BackendKind) -> Self {
        Self::new(kind, |key, _| Err(FetchError::not_found(key.kind(), key.id())))
    }

    pub fn supporting(mut self, ops: &[Operation]) -> Self {
        self.supported = ops.to_vec();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn serve(&self, key: FetchKey) -> FetchResult<Bytes> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(&key, n)
    }
}

#[async_trait]
impl BackendAdapter for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn supports(&self, op: Operation) -> bool {
        self.supported.contains(&op)
    }

    async fn fetch_blob(&self, hash: &Hash, _ctx: &ObjectFetchContext) -> FetchResult<Bytes> {
        self.serve(FetchKey::Blob(*hash)).await
    }

    async fn fetch_tree(&self, hash: &Hash, _ctx: &ObjectFetchContext) -> FetchResult<Bytes> {
        self.serve(FetchKey::Tree(*hash)).await
    }

    async fn fetch_tree_for_commit(
        &self,
        commit: &CommitId,
        _ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        self.serve(FetchKey::CommitTree(commit.clone())).await
    }

    async fn fetch_tree_for_manifest(
        &self,
        commit: &CommitId,
        manifest: &Hash,
        _ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        self.serve(FetchKey::ManifestTree(commit.clone(), *manifest))
            .await
    }

    fn stats(&self) -> BackendStatsSnapshot {
        BackendStatsSnapshot::default()
    }
}

/// Store that never holds anything and rejects writes.
#[derive(Default)]
pub struct FailingStore {
    pub puts: AtomicUsize,
}

#[async_trait]
impl LocalStore for FailingStore {
    async fn get(&self, _space: KeySpace, _hash: &Hash) -> vstore_cache::Result<Option<Bytes>> {
        Ok(None)
    }

    async fn put(&self, _space: KeySpace, _hash: &Hash, _data: Bytes) -> vstore_cache::Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        )))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

pub fn policy() -> FetchPolicy {
    FetchPolicy {
        timeout: Duration::from_secs(5),
        verify_content: false,
        max_concurrent_prefetch: 4,
        retry: RetryConfig::default(),
    }
}

pub fn coordinator(
    cache: Arc<dyn LocalStore>,
    backends: &[Arc<MockBackend>],
    policy: FetchPolicy,
) -> FetchCoordinator {
    coordinator_with_popularity(cache, backends, policy, None)
}

pub fn coordinator_with_popularity(
    cache: Arc<dyn LocalStore>,
    backends: &[Arc<MockBackend>],
    policy: FetchPolicy,
    popularity: Option<PopularityTracker>,
) -> FetchCoordinator {
    let backends = backends
        .iter()
        .map(|b| Arc::clone(b) as Arc<dyn BackendAdapter>)
        .collect();
    FetchCoordinator::new(cache, backends, policy, popularity)
}

pub fn memory() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// Two-entry tree used across tests.
pub fn sample_tree() -> Tree {
    Tree::new(vec![
        TreeEntry::new("README.md", Hash::of(b"readme"), EntryKind::File),
        TreeEntry::new("src", Hash::of(b"src"), EntryKind::Directory),
    ])
    .unwrap()
}

/// Wait for the in-flight table to drain after waiters have been released.
pub async fn wait_for_idle(coordinator: &FetchCoordinator) {
    for _ in 0..100 {
        if coordinator.pending() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("fetches still pending: {}", coordinator.pending());
}
