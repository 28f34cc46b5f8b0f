//! # vstore-cache
//!
//! Local object cache for vstore. A [`LocalStore`] is a key-value store keyed
//! by `(KeySpace, Hash)`; it knows nothing about backends or fetch logic.
//!
//! ## Implementations
//!
//! - [`DiskStore`]: persistent, sharded `<root>/<space>/ab/cd/<hex>` layout
//!   with checksummed records, so a torn write reads back as a miss.
//! - [`MemoryStore`]: concurrent in-memory map.
//!
//! `put` is idempotent: content addressing guarantees that a second write for
//! the same key carries the same bytes, so stores may skip it.

mod disk;
mod memory;

pub use disk::{DiskStore, PruneReport, StoreStats};
pub use memory::MemoryStore;

use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use vstore_model::Hash;

/// Errors from local cache I/O. Always recoverable for the caller: a failed
/// read is a miss, a failed write forfeits caching.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cache task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Partition of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySpace {
    Blob,
    Tree,
    /// Commit cache key -> root tree hash (32 raw bytes).
    CommitTree,
}

impl KeySpace {
    pub const ALL: [KeySpace; 3] = [KeySpace::Blob, KeySpace::Tree, KeySpace::CommitTree];

    /// Directory name under the store root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            KeySpace::Blob => "blob",
            KeySpace::Tree => "tree",
            KeySpace::CommitTree => "commit2tree",
        }
    }

    /// Whether records in this space are content-addressed by their key.
    pub fn is_content_addressed(&self) -> bool {
        !matches!(self, KeySpace::CommitTree)
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Key-value contract consumed by the fetch coordinator.
///
/// Both operations must be safe to call concurrently, and must not block the
/// calling async runtime thread.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Look up a record. `Ok(None)` is a miss; a corrupt record is also a miss.
    async fn get(&self, space: KeySpace, hash: &Hash) -> Result<Option<Bytes>>;

    /// Store a record. A no-op if the key is already present.
    async fn put(&self, space: KeySpace, hash: &Hash, data: Bytes) -> Result<()>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_space_dirs_unique() {
        let mut names: Vec<_> = KeySpace::ALL.iter().map(|s| s.dir_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), KeySpace::ALL.len());
    }

    #[test]
    fn test_commit_space_not_content_addressed() {
        assert!(KeySpace::Blob.is_content_addressed());
        assert!(KeySpace::Tree.is_content_addressed());
        assert!(!KeySpace::CommitTree.is_content_addressed());
    }
}
