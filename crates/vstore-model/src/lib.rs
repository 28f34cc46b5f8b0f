//! # vstore-model
//!
//! Immutable object model shared by every vstore crate.
//!
//! Objects are content-addressed by a 256-bit BLAKE3 [`Hash`]:
//! - [`Blob`]: raw file content
//! - [`Tree`]: sorted directory listing of `name -> (Hash, EntryKind)`
//! - [`CommitId`]: opaque commit reference, only used to find a root tree

pub mod tree;

pub use tree::{EntryKind, Tree, TreeDecodeError, TreeEntry};

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length in bytes of a [`Hash`].
pub const HASH_LEN: usize = 32;

/// Errors produced when parsing identifiers from text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashParseError {
    #[error("expected {expected} hex characters, got {actual}")]
    BadLength { expected: usize, actual: usize },

    #[error("invalid hex: {0}")]
    BadHex(String),

    #[error("commit id must not be empty")]
    EmptyCommitId,
}

/// BLAKE3 content hash identifying an object's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary bytes.
    #[inline]
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
        if s.len() != HASH_LEN * 2 {
            return Err(HashParseError::BadLength {
                expected: HASH_LEN * 2,
                actual: s.len(),
            });
        }
        let mut out = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut out).map_err(|e| HashParseError::BadHex(e.to_string()))?;
        Ok(Self(out))
    }

    /// Check `data` against this hash by recomputing it.
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Opaque commit reference. Backends interpret the bytes; vstore only
/// forwards them and derives a cache key from them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CommitId(Bytes);

impl CommitId {
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, HashParseError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(HashParseError::EmptyCommitId);
        }
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
        let bytes = hex::decode(s).map_err(|e| HashParseError::BadHex(e.to_string()))?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Key under which the commit's root tree hash is cached locally.
    pub fn cache_key(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"vstore-commit:");
        hasher.update(&self.0);
        Hash(*hasher.finalize().as_bytes())
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", self.to_hex())
    }
}

impl FromStr for CommitId {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// The kind of object a fetch produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Blob,
    Tree,
    /// Root tree of a commit.
    CommitTree,
    /// Root tree named by an explicit manifest hash.
    ManifestTree,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::CommitTree => "commit_tree",
            ObjectKind::ManifestTree => "manifest_tree",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File content plus its hash. Cloning shares the underlying buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Blob {
    hash: Hash,
    data: Bytes,
}

impl Blob {
    /// Wrap bytes already known to hash to `hash`.
    pub fn new(hash: Hash, data: impl Into<Bytes>) -> Self {
        Self {
            hash,
            data: data.into(),
        }
    }

    /// Build a blob by hashing its content.
    pub fn from_content(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            hash: Hash::of(&data),
            data,
        }
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("hash", &self.hash)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_parse() {
        let hash = Hash::of(b"hello");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<Hash>().unwrap(), hash);
    }

    #[test]
    fn test_hash_rejects_bad_input() {
        assert!(matches!(
            Hash::from_hex("abc123"),
            Err(HashParseError::BadLength { actual: 6, .. })
        ));
        let not_hex = "zz".repeat(32);
        assert!(matches!(
            Hash::from_hex(&not_hex),
            Err(HashParseError::BadHex(_))
        ));
    }

    #[test]
    fn test_hash_matches() {
        let hash = Hash::of(b"content");
        assert!(hash.matches(b"content"));
        assert!(!hash.matches(b"other"));
    }

    #[test]
    fn test_hash_serde_as_hex_string() {
        let hash = Hash::of(b"x");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_commit_id() {
        let commit = CommitId::from_hex("deadbeef").unwrap();
        assert_eq!(commit.as_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(commit.to_string(), "deadbeef");
        assert!(CommitId::new(Vec::new()).is_err());

        // Distinct from hashing the raw bytes, so it never collides with a blob key.
        assert_ne!(commit.cache_key(), Hash::of(commit.as_bytes()));
        assert_eq!(commit.cache_key(), CommitId::from_hex("deadbeef").unwrap().cache_key());
    }

    #[test]
    fn test_blob_from_content() {
        let blob = Blob::from_content(&b"hello"[..]);
        assert_eq!(blob.hash(), &Hash::of(b"hello"));
        assert_eq!(blob.len(), 5);
        assert_eq!(&blob.data()[..], b"hello");
    }
}
