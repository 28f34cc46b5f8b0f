//! Directory trees and their canonical byte encoding.
//!
//! ```text
//! "VTR1" | count: u32 LE | entry*
//! entry = kind: u8 | hash: [u8; 32] | name_len: u16 LE | name (UTF-8)
//! ```
//!
//! Entries are always written in ascending name order, so a tree has exactly
//! one encoding and its [`Hash`] is the BLAKE3 of that encoding.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Hash, HASH_LEN};

const TREE_MAGIC: &[u8; 4] = b"VTR1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeDecodeError {
    #[error("bad tree magic")]
    BadMagic,

    #[error("tree truncated at offset {0}")]
    Truncated(usize),

    #[error("unknown entry kind {0}")]
    UnknownKind(u8),

    #[error("invalid entry name: {0}")]
    InvalidName(String),

    #[error("entries out of order or duplicated at {0:?}")]
    Unsorted(String),

    #[error("{0} trailing bytes after last entry")]
    TrailingBytes(usize),
}

/// Type of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum EntryKind {
    #[default]
    File = 0,
    Executable = 1,
    Symlink = 2,
    Directory = 3,
}

impl EntryKind {
    fn from_u8(v: u8) -> Result<Self, TreeDecodeError> {
        match v {
            0 => Ok(EntryKind::File),
            1 => Ok(EntryKind::Executable),
            2 => Ok(EntryKind::Symlink),
            3 => Ok(EntryKind::Directory),
            other => Err(TreeDecodeError::UnknownKind(other)),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }

    /// Single-character tag, as printed by `ls-tree`.
    pub fn tag(&self) -> char {
        match self {
            EntryKind::File => 'f',
            EntryKind::Executable => 'x',
            EntryKind::Symlink => 'l',
            EntryKind::Directory => 'd',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub hash: Hash,
    pub kind: EntryKind,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, hash: Hash, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            hash,
            kind,
        }
    }
}

fn validate_name(name: &str) -> Result<(), TreeDecodeError> {
    if name.is_empty() || name.contains('/') || name.contains('\0') || name.len() > u16::MAX as usize {
        return Err(TreeDecodeError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Immutable directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    hash: Hash,
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree from entries in any order; computes its hash.
    pub fn new(mut entries: Vec<TreeEntry>) -> Result<Self, TreeDecodeError> {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for pair in entries.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(TreeDecodeError::Unsorted(pair[1].name.clone()));
            }
        }
        for entry in &entries {
            validate_name(&entry.name)?;
        }
        let hash = Hash::of(&encode_entries(&entries));
        Ok(Self { hash, entries })
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary search by name.
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn encode(&self) -> Bytes {
        encode_entries(&self.entries)
    }

    /// Decode the canonical encoding. The hash is computed from `data`.
    pub fn decode(data: &[u8]) -> Result<Self, TreeDecodeError> {
        let entries = decode_entries(data)?;
        Ok(Self {
            hash: Hash::of(data),
            entries,
        })
    }

    /// Decode bytes already known to hash to `hash` (e.g. a local cache
    /// record), skipping the rehash.
    pub fn decode_trusted(hash: Hash, data: &[u8]) -> Result<Self, TreeDecodeError> {
        let entries = decode_entries(data)?;
        Ok(Self { hash, entries })
    }
}

fn encode_entries(entries: &[TreeEntry]) -> Bytes {
    let size = 8 + entries
        .iter()
        .map(|e| 1 + HASH_LEN + 2 + e.name.len())
        .sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_slice(TREE_MAGIC);
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        buf.put_u8(entry.kind as u8);
        buf.put_slice(entry.hash.as_bytes());
        buf.put_u16_le(entry.name.len() as u16);
        buf.put_slice(entry.name.as_bytes());
    }
    buf.freeze()
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TreeDecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(TreeDecodeError::Truncated(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

fn decode_entries(data: &[u8]) -> Result<Vec<TreeEntry>, TreeDecodeError> {
    let mut cur = Cursor { data, pos: 0 };
    if cur.take(4).map_err(|_| TreeDecodeError::BadMagic)? != TREE_MAGIC {
        return Err(TreeDecodeError::BadMagic);
    }
    let count = u32::from_le_bytes(cur.take(4)?.try_into().map_err(|_| TreeDecodeError::Truncated(4))?);

    // Each entry is at least 35 bytes; don't trust `count` for the allocation.
    let mut entries = Vec::with_capacity((count as usize).min(data.len() / 35));
    for _ in 0..count {
        let kind = EntryKind::from_u8(cur.take(1)?[0])?;
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(cur.take(HASH_LEN)?);
        let len_bytes = cur.take(2)?;
        let name_len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let name_start = cur.pos;
        let name = std::str::from_utf8(cur.take(name_len)?)
            .map_err(|_| TreeDecodeError::InvalidName(format!("non-utf8 name at {}", name_start)))?;
        validate_name(name)?;
        if let Some(prev) = entries.last().map(|e: &TreeEntry| e.name.as_str()) {
            if prev >= name {
                return Err(TreeDecodeError::Unsorted(name.to_string()));
            }
        }
        entries.push(TreeEntry::new(name, Hash::from_bytes(hash), kind));
    }

    let rest = data.len() - cur.pos;
    if rest != 0 {
        return Err(TreeDecodeError::TrailingBytes(rest));
    }
    Ok(entries)
}
