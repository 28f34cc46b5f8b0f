//! Fetch coordination: cache first, one backend fetch per key, fallback
//! across backends, best-effort write-back.
//!
//! ```text
//! request ──► local cache ──hit──► object
//!                │ miss
//!                ▼
//!         pending: DashMap<FetchKey, SharedFetch>
//!            │ occupied: await the shared outcome
//!            │ vacant:   register, spawn the fetch task
//!            ▼
//!      backends in order (popular keys: pinned backend first)
//!            │ ok
//!            ▼
//!      decode/verify ──► cache put (best effort) ──► all waiters
//! ```
//!
//! The fetch itself runs on a spawned task, so a caller dropping its future
//! neither cancels the fetch nor loses the cache write.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use tokio::sync::oneshot;
use tracing::instrument;

use vstore_backend::{
    BackendAdapter, FetchError, FetchOrigin, FetchResult, ObjectFetchContext, Operation,
};
use vstore_cache::{KeySpace, LocalStore};
use vstore_config::{
    log_cache_warn, log_fetch_debug, log_fetch_warn, BackendKind, FetchConfig, RetryConfig,
};
use vstore_model::{Blob, CommitId, Hash, ObjectKind, Tree};

use crate::popularity::PopularityTracker;
use crate::stats::{FetchStats, FetchStatsSnapshot};

/// Label for errors raised by the coordinator itself rather than a backend.
const COORDINATOR: &str = "coordinator";

/// Identity of one logical fetch; identical keys are coalesced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchKey {
    Blob(Hash),
    Tree(Hash),
    CommitTree(CommitId),
    ManifestTree(CommitId, Hash),
}

impl FetchKey {
    pub fn operation(&self) -> Operation {
        match self {
            FetchKey::Blob(_) => Operation::FetchBlob,
            FetchKey::Tree(_) => Operation::FetchTree,
            FetchKey::CommitTree(_) => Operation::FetchTreeForCommit,
            FetchKey::ManifestTree(..) => Operation::FetchTreeForManifest,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.operation().object_kind()
    }

    /// Identifier reported in `NotFound` errors.
    pub fn id(&self) -> String {
        match self {
            FetchKey::Blob(hash) | FetchKey::Tree(hash) | FetchKey::ManifestTree(_, hash) => {
                hash.to_hex()
            }
            FetchKey::CommitTree(commit) => commit.to_hex(),
        }
    }

    /// Hash the popularity counter is kept under.
    fn popularity_key(&self) -> Hash {
        match self {
            FetchKey::Blob(hash) | FetchKey::Tree(hash) => *hash,
            FetchKey::CommitTree(commit) => commit.cache_key(),
            FetchKey::ManifestTree(_, manifest) => *manifest,
        }
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchKey::Blob(hash) => write!(f, "blob:{}", hash.short()),
            FetchKey::Tree(hash) => write!(f, "tree:{}", hash.short()),
            FetchKey::CommitTree(commit) => write!(f, "commit:{}", commit),
            FetchKey::ManifestTree(commit, manifest) => {
                write!(f, "manifest:{}@{}", manifest.short(), commit)
            }
        }
    }
}

/// Knobs for dispatching to backends.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub verify_content: bool,
    pub max_concurrent_prefetch: usize,
    pub retry: RetryConfig,
}

impl FetchPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            verify_content: config.verify_content,
            max_concurrent_prefetch: config.max_concurrent_prefetch.max(1),
            retry: config.retry.clone(),
        }
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

#[derive(Debug, Clone)]
enum Fetched {
    Blob(Bytes),
    Tree(Tree),
}

type Outcome = Result<Fetched, FetchError>;
type SharedFetch = Shared<BoxFuture<'static, Outcome>>;

impl Fetched {
    fn into_blob(self) -> FetchResult<Bytes> {
        match self {
            Fetched::Blob(data) => Ok(data),
            Fetched::Tree(_) => Err(FetchError::protocol(COORDINATOR, "expected a blob, got a tree")),
        }
    }

    fn into_tree(self) -> FetchResult<Tree> {
        match self {
            Fetched::Tree(tree) => Ok(tree),
            Fetched::Blob(_) => Err(FetchError::protocol(COORDINATOR, "expected a tree, got a blob")),
        }
    }
}

/// Removes the pending entry when the fetch task finishes or unwinds.
struct PendingGuard {
    inner: Arc<Inner>,
    key: FetchKey,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.key);
    }
}

#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    cache: Arc<dyn LocalStore>,
    backends: Vec<Arc<dyn BackendAdapter>>,
    policy: FetchPolicy,
    popularity: Option<PopularityTracker>,
    pending: DashMap<FetchKey, SharedFetch>,
    stats: FetchStats,
}

impl FetchCoordinator {
    /// `backends` is the fallback order.
    pub fn new(
        cache: Arc<dyn LocalStore>,
        backends: Vec<Arc<dyn BackendAdapter>>,
        policy: FetchPolicy,
        popularity: Option<PopularityTracker>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                backends,
                policy,
                popularity,
                pending: DashMap::new(),
                stats: FetchStats::default(),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<dyn LocalStore> {
        &self.inner.cache
    }

    pub fn backends(&self) -> &[Arc<dyn BackendAdapter>] {
        &self.inner.backends
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.inner.policy
    }

    pub fn stats(&self) -> FetchStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Fetches currently in flight.
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    #[instrument(skip_all, fields(hash = %hash.short()), level = "debug")]
    pub async fn fetch_blob(&self, hash: Hash, ctx: &ObjectFetchContext) -> FetchResult<Blob> {
        let key = FetchKey::Blob(hash);
        self.inner.note_request(&key);

        if let Some(data) = self.inner.cached_blob(&hash).await {
            self.inner.hit(ObjectKind::Blob, &hash, ctx);
            return Ok(Blob::new(hash, data));
        }
        FetchStats::bump(&self.inner.stats.cache_misses);

        let data = self.inner.coalesce(key, ctx).await?.into_blob()?;
        ctx.did_fetch(ObjectKind::Blob, &hash, FetchOrigin::Backend);
        Ok(Blob::new(hash, data))
    }

    #[instrument(skip_all, fields(hash = %hash.short()), level = "debug")]
    pub async fn fetch_tree(&self, hash: Hash, ctx: &ObjectFetchContext) -> FetchResult<Tree> {
        self.inner.note_request(&FetchKey::Tree(hash));
        self.tree_by_hash(hash, ctx).await
    }

    /// Tree lookup without counting toward popularity; callers have already
    /// counted the request under their own key.
    async fn tree_by_hash(&self, hash: Hash, ctx: &ObjectFetchContext) -> FetchResult<Tree> {
        let key = FetchKey::Tree(hash);
        if let Some(tree) = self.inner.cached_tree(&hash).await {
            self.inner.hit(ObjectKind::Tree, &hash, ctx);
            return Ok(tree);
        }
        FetchStats::bump(&self.inner.stats.cache_misses);

        let tree = self.inner.coalesce(key, ctx).await?.into_tree()?;
        ctx.did_fetch(ObjectKind::Tree, &hash, FetchOrigin::Backend);
        Ok(tree)
    }

    /// Root tree of `commit`. A cached commit→tree mapping routes through
    /// the ordinary tree path; the request still counts once, under the
    /// commit.
    #[instrument(skip_all, fields(commit = %commit), level = "debug")]
    pub async fn fetch_tree_for_commit(
        &self,
        commit: &CommitId,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Tree> {
        let key = FetchKey::CommitTree(commit.clone());
        self.inner.note_request(&key);

        if let Some(tree_hash) = self.inner.cached_commit_tree(commit).await {
            match self.tree_by_hash(tree_hash, ctx).await {
                Ok(tree) => return Ok(tree),
                // The mapping outlived the tree everywhere; ask by commit.
                Err(e) if e.is_not_found() => {
                    log_fetch_debug!(
                        "Mapped tree gone, refetching by commit",
                        commit = tracing::field::display(commit),
                        tree = tracing::field::display(tree_hash.short()),
                    );
                }
                Err(e) => return Err(e),
            }
        } else {
            FetchStats::bump(&self.inner.stats.cache_misses);
        }

        let tree = self.inner.coalesce(key, ctx).await?.into_tree()?;
        ctx.did_fetch(ObjectKind::CommitTree, tree.hash(), FetchOrigin::Backend);
        Ok(tree)
    }

    /// Root tree named by `manifest` within `commit`.
    #[instrument(skip_all, fields(commit = %commit, manifest = %manifest.short()), level = "debug")]
    pub async fn fetch_tree_for_manifest(
        &self,
        commit: &CommitId,
        manifest: Hash,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Tree> {
        let key = FetchKey::ManifestTree(commit.clone(), manifest);
        self.inner.note_request(&key);

        if let Some(tree) = self.inner.cached_tree(&manifest).await {
            self.inner.hit(ObjectKind::ManifestTree, &manifest, ctx);
            return Ok(tree);
        }
        FetchStats::bump(&self.inner.stats.cache_misses);

        let tree = self.inner.coalesce(key, ctx).await?.into_tree()?;
        ctx.did_fetch(ObjectKind::ManifestTree, &manifest, FetchOrigin::Backend);
        Ok(tree)
    }

    /// Fetch `hashes` concurrently, bounded by the policy. Results are in
    /// input order.
    pub async fn prefetch_blobs(
        &self,
        hashes: Vec<Hash>,
        ctx: &ObjectFetchContext,
    ) -> Vec<(Hash, FetchResult<()>)> {
        let limit = self.inner.policy.max_concurrent_prefetch;
        log_fetch_debug!("Prefetching blobs", count = hashes.len(), limit = limit);

        stream::iter(hashes)
            .map(|hash| async move {
                let result = self.fetch_blob(hash, ctx).await.map(|_| ());
                (hash, result)
            })
            .buffered(limit)
            .collect()
            .await
    }
}

impl Inner {
    fn note_request(&self, key: &FetchKey) {
        if let Some(tracker) = &self.popularity {
            tracker.record(key.popularity_key());
        }
    }

    fn hit(&self, kind: ObjectKind, hash: &Hash, ctx: &ObjectFetchContext) {
        FetchStats::bump(&self.stats.cache_hits);
        ctx.did_fetch(kind, hash, FetchOrigin::LocalCache);
    }

    /// Cache read; any failure is a miss.
    async fn cache_get(&self, space: KeySpace, hash: &Hash) -> Option<Bytes> {
        match self.cache.get(space, hash).await {
            Ok(found) => found,
            Err(e) => {
                log_cache_warn!(
                    "Cache read failed, treating as miss",
                    space = space.dir_name(),
                    hash = tracing::field::display(hash.short()),
                    error = tracing::field::display(&e),
                );
                None
            }
        }
    }

    async fn cached_blob(&self, hash: &Hash) -> Option<Bytes> {
        let data = self.cache_get(KeySpace::Blob, hash).await?;
        if self.policy.verify_content && !hash.matches(&data) {
            log_cache_warn!(
                "Cached blob fails verification",
                hash = tracing::field::display(hash.short()),
            );
            return None;
        }
        Some(data)
    }

    async fn cached_tree(&self, hash: &Hash) -> Option<Tree> {
        let data = self.cache_get(KeySpace::Tree, hash).await?;
        let decoded = if self.policy.verify_content {
            Tree::decode(&data)
        } else {
            Tree::decode_trusted(*hash, &data)
        };
        match decoded {
            Ok(tree) if tree.hash() == hash => Some(tree),
            Ok(tree) => {
                log_cache_warn!(
                    "Cached tree fails verification",
                    hash = tracing::field::display(hash.short()),
                    actual = tracing::field::display(tree.hash().short()),
                );
                None
            }
            Err(e) => {
                log_cache_warn!(
                    "Cached tree unusable",
                    hash = tracing::field::display(hash.short()),
                    error = tracing::field::display(&e),
                );
                None
            }
        }
    }

    async fn cached_commit_tree(&self, commit: &CommitId) -> Option<Hash> {
        let data = self.cache_get(KeySpace::CommitTree, &commit.cache_key()).await?;
        match <[u8; vstore_model::HASH_LEN]>::try_from(&data[..]) {
            Ok(bytes) => Some(Hash::from_bytes(bytes)),
            Err(_) => {
                log_cache_warn!(
                    "Malformed commit mapping",
                    commit = tracing::field::display(commit),
                    len = data.len(),
                );
                None
            }
        }
    }

    /// Best-effort cache write.
    async fn cache_put(&self, space: KeySpace, hash: &Hash, data: Bytes) {
        if let Err(e) = self.cache.put(space, hash, data).await {
            FetchStats::bump(&self.stats.cache_write_failures);
            log_cache_warn!(
                "Cache write failed",
                space = space.dir_name(),
                hash = tracing::field::display(hash.short()),
                error = tracing::field::display(&e),
            );
        }
    }

    /// Join the in-flight fetch for `key`, or start one.
    async fn coalesce(self: &Arc<Self>, key: FetchKey, ctx: &ObjectFetchContext) -> Outcome {
        let shared = match self.pending.entry(key.clone()) {
            Entry::Occupied(entry) => {
                FetchStats::bump(&self.stats.coalesced);
                log_fetch_debug!(
                    "Joining in-flight fetch",
                    key = tracing::field::display(&key),
                );
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel::<Outcome>();
                let shared: SharedFetch = async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(FetchError::unavailable(
                            COORDINATOR,
                            "fetch task ended without a result",
                        ))
                    })
                }
                .boxed()
                .shared();
                entry.insert(shared.clone());

                FetchStats::bump(&self.stats.backend_fetches);
                let inner = Arc::clone(self);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let guard = PendingGuard {
                        inner: Arc::clone(&inner),
                        key: key.clone(),
                    };
                    let outcome = inner.run(&key, &ctx).await;
                    if outcome.is_err() {
                        FetchStats::bump(&inner.stats.fetch_failures);
                    }
                    let _ = tx.send(outcome);
                    drop(guard);
                });
                shared
            }
        };
        shared.await
    }

    /// Body of one fetch task.
    async fn run(&self, key: &FetchKey, ctx: &ObjectFetchContext) -> Outcome {
        let (data, source) = self.fetch_from_backends(key, ctx).await?;
        match key {
            FetchKey::Blob(hash) => {
                if self.policy.verify_content && !hash.matches(&data) {
                    return Err(FetchError::protocol(
                        source.as_str(),
                        format!("blob content does not hash to {}", hash),
                    ));
                }
                self.cache_put(KeySpace::Blob, hash, data.clone()).await;
                Ok(Fetched::Blob(data))
            }
            FetchKey::Tree(hash) => {
                let tree = if self.policy.verify_content {
                    decode_tree(source, &data, Some(hash))?
                } else {
                    Tree::decode_trusted(*hash, &data)
                        .map_err(|e| FetchError::protocol(source.as_str(), e))?
                };
                self.cache_put(KeySpace::Tree, hash, data).await;
                Ok(Fetched::Tree(tree))
            }
            FetchKey::CommitTree(commit) => {
                let tree = decode_tree(source, &data, None)?;
                self.cache_put(KeySpace::Tree, tree.hash(), data).await;
                self.cache_put(
                    KeySpace::CommitTree,
                    &commit.cache_key(),
                    Bytes::copy_from_slice(tree.hash().as_bytes()),
                )
                .await;
                Ok(Fetched::Tree(tree))
            }
            FetchKey::ManifestTree(_, manifest) => {
                let tree = decode_tree(source, &data, Some(manifest))?;
                self.cache_put(KeySpace::Tree, manifest, data).await;
                Ok(Fetched::Tree(tree))
            }
        }
    }

    /// Backends that can serve `key`, popular keys' pinned backend first.
    fn backend_order(&self, key: &FetchKey) -> Vec<&Arc<dyn BackendAdapter>> {
        let op = key.operation();
        let mut order: Vec<_> = self.backends.iter().filter(|b| b.supports(op)).collect();

        if let Some(tracker) = &self.popularity {
            if tracker.is_popular(&key.popularity_key()) {
                let pinned = tracker.pinned_backend();
                if let Some(pos) = order.iter().position(|b| b.kind() == pinned) {
                    if pos > 0 {
                        let backend = order.remove(pos);
                        order.insert(0, backend);
                        log_fetch_debug!(
                            "Routing popular key to pinned backend",
                            key = tracing::field::display(key),
                            backend = pinned.as_str(),
                        );
                    }
                }
            }
        }
        order
    }

    /// Try backends in order until one produces the object.
    ///
    /// `NotFound` and `Unavailable` move on to the next backend, a protocol
    /// error stops immediately. When every backend fails the result is
    /// `Unavailable` if any backend was unreachable, else `NotFound`.
    async fn fetch_from_backends(
        &self,
        key: &FetchKey,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<(Bytes, BackendKind)> {
        let op = key.operation();
        let order = self.backend_order(key);
        if order.is_empty() {
            return Err(FetchError::unsupported("all backends", op));
        }

        let mut not_found = false;
        let mut unavailable = None;
        for (i, backend) in order.iter().enumerate() {
            if i > 0 {
                FetchStats::bump(&self.stats.fallbacks);
            }
            match self.attempt(backend.as_ref(), key, ctx).await {
                Ok(data) => {
                    log_fetch_debug!(
                        "Fetched from backend",
                        key = tracing::field::display(key),
                        backend = backend.name(),
                        bytes = data.len(),
                    );
                    return Ok((data, backend.kind()));
                }
                Err(FetchError::NotFound { .. }) => {
                    log_fetch_debug!(
                        "Backend does not have object",
                        key = tracing::field::display(key),
                        backend = backend.name(),
                    );
                    not_found = true;
                }
                Err(e @ FetchError::Unavailable { .. }) => {
                    log_fetch_warn!(
                        "Backend unavailable, falling back",
                        key = tracing::field::display(key),
                        backend = backend.name(),
                        error = tracing::field::display(&e),
                    );
                    unavailable = Some(e);
                }
                Err(FetchError::Unsupported { .. }) => continue,
                Err(e @ FetchError::Protocol { .. }) => {
                    log_fetch_warn!(
                        "Protocol error, not falling back",
                        key = tracing::field::display(key),
                        backend = backend.name(),
                        error = tracing::field::display(&e),
                    );
                    return Err(e);
                }
            }
        }

        match (unavailable, not_found) {
            (Some(e), _) => Err(e),
            (None, true) => Err(FetchError::not_found(key.kind(), key.id())),
            (None, false) => Err(FetchError::unsupported("all backends", op)),
        }
    }

    /// One backend, with timeout per attempt and backoff between retries.
    async fn attempt(
        &self,
        backend: &dyn BackendAdapter,
        key: &FetchKey,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        let retry = &self.policy.retry;
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(retry.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(retry.max_backoff_ms))
            .with_multiplier(retry.backoff_multiplier)
            .with_max_elapsed_time(None)
            .build();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = match tokio::time::timeout(self.policy.timeout, call(backend, key, ctx)).await
            {
                Ok(result) => result,
                Err(_) => Err(FetchError::unavailable(
                    backend.name(),
                    format!("timed out after {:?}", self.policy.timeout),
                )),
            };

            match result {
                Err(e) if e.is_retryable() && attempts < retry.max_attempts => {
                    let Some(delay) = backoff.next_backoff() else {
                        return Err(e);
                    };
                    log_fetch_warn!(
                        "Backend attempt failed, retrying",
                        backend = backend.name(),
                        attempts = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = tracing::field::display(&e),
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

async fn call(
    backend: &dyn BackendAdapter,
    key: &FetchKey,
    ctx: &ObjectFetchContext,
) -> FetchResult<Bytes> {
    match key {
        FetchKey::Blob(hash) => backend.fetch_blob(hash, ctx).await,
        FetchKey::Tree(hash) => backend.fetch_tree(hash, ctx).await,
        FetchKey::CommitTree(commit) => backend.fetch_tree_for_commit(commit, ctx).await,
        FetchKey::ManifestTree(commit, manifest) => {
            backend.fetch_tree_for_manifest(commit, manifest, ctx).await
        }
    }
}

/// Decode tree bytes from `source`, optionally requiring a specific hash.
fn decode_tree(source: BackendKind, data: &[u8], expected: Option<&Hash>) -> FetchResult<Tree> {
    let tree = Tree::decode(data).map_err(|e| FetchError::protocol(source.as_str(), e))?;
    if let Some(expected) = expected {
        if tree.hash() != expected {
            return Err(FetchError::protocol(
                source.as_str(),
                format!("tree hashes to {}, expected {}", tree.hash(), expected),
            ));
        }
    }
    Ok(tree)
}
