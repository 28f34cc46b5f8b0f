//! Per-request advisory metadata.
//!
//! An [`ObjectFetchContext`] travels with every fetch from the filesystem
//! layer down to the adapters. Nothing in the cache or coordinator depends on
//! it for correctness: adapters forward its fields for prioritisation and
//! telemetry, and an optional [`FetchObserver`] is told where each object
//! came from.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use vstore_model::{Hash, ObjectKind};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// What triggered the fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchCause {
    #[default]
    Unknown,
    /// A filesystem operation (lookup, readdir, read).
    Fs,
    Prefetch,
    Cli,
}

/// Where a delivered object came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchOrigin {
    LocalCache,
    Backend,
}

/// Receives a callback for each object delivered to the request.
pub trait FetchObserver: Send + Sync {
    fn did_fetch(&self, kind: ObjectKind, hash: &Hash, origin: FetchOrigin);
}

#[derive(Clone)]
pub struct ObjectFetchContext {
    request_id: u64,
    priority: FetchPriority,
    cause: FetchCause,
    client_pid: Option<u32>,
    observer: Option<Arc<dyn FetchObserver>>,
}

impl ObjectFetchContext {
    pub fn new(cause: FetchCause) -> Self {
        Self {
            request_id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            priority: FetchPriority::default(),
            cause,
            client_pid: None,
            observer: None,
        }
    }

    /// Context for callers with nothing to say about the request.
    pub fn null() -> Self {
        Self::new(FetchCause::Unknown)
    }

    pub fn with_priority(mut self, priority: FetchPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_client_pid(mut self, pid: u32) -> Self {
        self.client_pid = Some(pid);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn FetchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn priority(&self) -> FetchPriority {
        self.priority
    }

    pub fn cause(&self) -> FetchCause {
        self.cause
    }

    pub fn client_pid(&self) -> Option<u32> {
        self.client_pid
    }

    pub fn did_fetch(&self, kind: ObjectKind, hash: &Hash, origin: FetchOrigin) {
        if let Some(observer) = &self.observer {
            observer.did_fetch(kind, hash, origin);
        }
    }
}

impl Default for ObjectFetchContext {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for ObjectFetchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectFetchContext")
            .field("request_id", &self.request_id)
            .field("priority", &self.priority)
            .field("cause", &self.cause)
            .field("client_pid", &self.client_pid)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
