//! # vstore-backend
//!
//! Adapters that fetch objects from remote sources.
//!
//! Each adapter speaks one remote protocol and exposes the subset of
//! [`Operation`]s it can serve through [`BackendAdapter`]. Operations an
//! adapter cannot serve report [`FetchError::Unsupported`] without touching
//! the network, so the fetch coordinator can skip to the next backend.
//!
//! Adapters return raw bytes; decoding, verification and caching happen in
//! the coordinator.

pub mod context;
pub mod distributed;
pub mod error;
pub mod legacy;
pub mod recas;
pub mod stats;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use vstore_config::{BackendKind, Config};
use vstore_model::{CommitId, Hash, ObjectKind};

pub use context::{FetchCause, FetchObserver, FetchOrigin, FetchPriority, ObjectFetchContext};
pub use distributed::DistributedAdapter;
pub use error::FetchError;
pub use legacy::LegacyServerAdapter;
pub use recas::RemoteCacheAdapter;
pub use stats::{BackendStats, BackendStatsSnapshot};
pub use transport::{TcpTransport, Transport, TransportError};

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Fetch operations a backend may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchBlob,
    FetchTree,
    FetchTreeForCommit,
    FetchTreeForManifest,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::FetchBlob,
        Operation::FetchTree,
        Operation::FetchTreeForCommit,
        Operation::FetchTreeForManifest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::FetchBlob => "fetch_blob",
            Operation::FetchTree => "fetch_tree",
            Operation::FetchTreeForCommit => "fetch_tree_for_commit",
            Operation::FetchTreeForManifest => "fetch_tree_for_manifest",
        }
    }

    /// Kind of object the operation delivers.
    pub fn object_kind(&self) -> ObjectKind {
        match self {
            Operation::FetchBlob => ObjectKind::Blob,
            Operation::FetchTree => ObjectKind::Tree,
            Operation::FetchTreeForCommit => ObjectKind::CommitTree,
            Operation::FetchTreeForManifest => ObjectKind::ManifestTree,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote object source.
///
/// Implementations must be safe to call concurrently. Every method returns
/// the raw encoded object: blob content, or the canonical tree encoding for
/// the three tree operations.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Label used in errors and logs.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    fn supports(&self, op: Operation) -> bool;

    async fn fetch_blob(&self, hash: &Hash, ctx: &ObjectFetchContext) -> FetchResult<Bytes> {
        let _ = (hash, ctx);
        Err(FetchError::unsupported(self.name(), Operation::FetchBlob))
    }

    async fn fetch_tree(&self, hash: &Hash, ctx: &ObjectFetchContext) -> FetchResult<Bytes> {
        let _ = (hash, ctx);
        Err(FetchError::unsupported(self.name(), Operation::FetchTree))
    }

    async fn fetch_tree_for_commit(
        &self,
        commit: &CommitId,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        let _ = (commit, ctx);
        Err(FetchError::unsupported(self.name(), Operation::FetchTreeForCommit))
    }

    async fn fetch_tree_for_manifest(
        &self,
        commit: &CommitId,
        manifest: &Hash,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        let _ = (commit, manifest, ctx);
        Err(FetchError::unsupported(self.name(), Operation::FetchTreeForManifest))
    }

    fn stats(&self) -> BackendStatsSnapshot;
}

/// Build adapters for every configured backend, in fallback order.
pub fn adapters_from_config(config: &Config) -> Vec<Arc<dyn BackendAdapter>> {
    config
        .active_backends()
        .into_iter()
        .filter_map(|kind| -> Option<Arc<dyn BackendAdapter>> {
            match kind {
                BackendKind::Legacy => {
                    let endpoint = config.backends.legacy.as_ref()?;
                    let transport =
                        TcpTransport::new(endpoint.endpoint.clone(), endpoint.max_frame_bytes);
                    Some(Arc::new(LegacyServerAdapter::new(Arc::new(transport))))
                }
                BackendKind::Distributed => {
                    let endpoint = config.backends.distributed.as_ref()?;
                    let transport =
                        TcpTransport::new(endpoint.endpoint.clone(), endpoint.max_frame_bytes);
                    Some(Arc::new(DistributedAdapter::new(Arc::new(transport))))
                }
                BackendKind::Recas => {
                    let recas = config.backends.recas.as_ref()?;
                    let transport = TcpTransport::new(recas.endpoint.clone(), recas.max_frame_bytes);
                    Some(Arc::new(RemoteCacheAdapter::new(
                        Arc::new(transport),
                        recas.instance_name.clone(),
                    )))
                }
            }
        })
        .collect()
}
