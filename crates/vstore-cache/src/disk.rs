//! Persistent on-disk store.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//! ├── blob/ab/cd/abcd1234...     # one record per object
//! ├── tree/..
//! └── commit2tree/..
//! ```
//!
//! Each record is `"VSC1" | payload_len: u64 LE | blake3(payload) | payload`.
//! Records are written to a unique temp file, fsynced, then renamed into
//! place, so readers see either nothing or a complete record.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::field::display;
use tracing::instrument;

use vstore_config::{log_cache_debug, log_cache_warn};
use vstore_model::Hash;

use crate::{CacheError, KeySpace, LocalStore, Result};

const RECORD_MAGIC: &[u8; 4] = b"VSC1";
const HEADER_LEN: usize = 4 + 8 + 32;

/// On-disk [`LocalStore`]. Cloning shares the same root and temp-name
/// sequence.
#[derive(Debug, Clone)]
pub struct DiskStore {
    inner: Arc<DiskInner>,
    verify_on_read: bool,
}

#[derive(Debug)]
struct DiskInner {
    root: PathBuf,
    tmp_seq: AtomicU64,
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for space in KeySpace::ALL {
            fs::create_dir_all(root.join(space.dir_name()))?;
        }
        Ok(Self {
            inner: Arc::new(DiskInner {
                root,
                tmp_seq: AtomicU64::new(0),
            }),
            verify_on_read: false,
        })
    }

    /// Also recompute content hashes of blob and tree records on read.
    pub fn with_verify_on_read(mut self, verify: bool) -> Self {
        self.verify_on_read = verify;
        self
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Path where a record for `(space, hash)` lives.
    pub fn record_path(&self, space: KeySpace, hash: &Hash) -> PathBuf {
        self.inner.record_path(space, hash)
    }

    /// Blocking read, for callers outside an async runtime.
    pub fn get_blocking(&self, space: KeySpace, hash: &Hash) -> Result<Option<Bytes>> {
        Ok(self.inner.read_record(space, hash, self.verify_on_read)?)
    }

    /// Blocking write, for callers outside an async runtime.
    pub fn put_blocking(&self, space: KeySpace, hash: &Hash, data: &[u8]) -> Result<()> {
        Ok(self.inner.write_record(space, hash, data)?)
    }

    /// Count records and bytes per key space.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for record in self.inner.records()? {
            let entry = stats.spaces.entry(record.space).or_default();
            entry.records += 1;
            entry.bytes += record.size;
        }
        Ok(stats)
    }

    /// Evict the least recently written records until the store holds at most
    /// `max_bytes`.
    #[instrument(skip(self), level = "debug")]
    pub fn prune(&self, max_bytes: u64) -> Result<PruneReport> {
        let mut records = self.inner.records()?;
        let total: u64 = records.iter().map(|r| r.size).sum();
        let mut report = PruneReport {
            bytes_before: total,
            bytes_after: total,
            ..Default::default()
        };
        if total <= max_bytes {
            return Ok(report);
        }

        records.sort_by_key(|r| r.modified);
        for record in records {
            if report.bytes_after <= max_bytes {
                break;
            }
            match fs::remove_file(&record.path) {
                Ok(()) => {
                    report.removed += 1;
                    report.bytes_after -= record.size;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    report.bytes_after -= record.size;
                }
                Err(e) => return Err(CacheError::Io(e)),
            }
        }
        log_cache_debug!(
            "Pruned local store",
            removed = report.removed,
            bytes_after = report.bytes_after,
        );
        Ok(report)
    }
}

impl DiskInner {
    fn record_path(&self, space: KeySpace, hash: &Hash) -> PathBuf {
        let hex = hash.to_hex();
        self.root
            .join(space.dir_name())
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(&hex)
    }

    #[instrument(skip(self), level = "debug")]
    fn read_record(&self, space: KeySpace, hash: &Hash, verify: bool) -> io::Result<Option<Bytes>> {
        let path = self.record_path(space, hash);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        match check_record(&raw) {
            Ok(()) => {}
            Err(reason) => {
                log_cache_warn!(
                    "Discarding corrupt cache record",
                    space = display(space),
                    hash = display(hash),
                    reason = reason,
                );
                let _ = fs::remove_file(&path);
                return Ok(None);
            }
        }

        let payload = Bytes::from(raw).slice(HEADER_LEN..);
        if verify && space.is_content_addressed() && !hash.matches(&payload) {
            log_cache_warn!(
                "Cache record does not match its hash",
                space = display(space),
                hash = display(hash),
            );
            let _ = fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(payload))
    }

    #[instrument(skip(self, data), level = "debug")]
    fn write_record(&self, space: KeySpace, hash: &Hash, data: &[u8]) -> io::Result<()> {
        let path = self.record_path(space, hash);

        // Same key, same bytes.
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_name = format!(
            "{}.{}.{}.tmp",
            hash.to_hex(),
            std::process::id(),
            self.tmp_seq.fetch_add(1, Ordering::Relaxed)
        );
        let temp_path = path.with_file_name(temp_name);
        let result = (|| {
            let mut file = File::create(&temp_path)?;
            file.write_all(RECORD_MAGIC)?;
            file.write_all(&(data.len() as u64).to_le_bytes())?;
            file.write_all(blake3::hash(data).as_bytes())?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            // Lost a race with a concurrent writer of the same record.
            if path.exists() {
                return Ok(());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Walk `<space>/ab/cd/<record>` for every key space.
    fn records(&self) -> io::Result<Vec<RecordInfo>> {
        let mut out = Vec::new();
        for space in KeySpace::ALL {
            let space_dir = self.root.join(space.dir_name());
            if !space_dir.exists() {
                continue;
            }
            for l1 in fs::read_dir(&space_dir)? {
                let l1 = l1?;
                if !l1.file_type()?.is_dir() {
                    continue;
                }
                for l2 in fs::read_dir(l1.path())? {
                    let l2 = l2?;
                    if !l2.file_type()?.is_dir() {
                        continue;
                    }
                    for record in fs::read_dir(l2.path())? {
                        let record = record?;
                        let path = record.path();
                        if path.extension().is_some_and(|ext| ext == "tmp") {
                            continue;
                        }
                        let meta = record.metadata()?;
                        if !meta.is_file() {
                            continue;
                        }
                        out.push(RecordInfo {
                            space,
                            size: meta.len(),
                            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                            path,
                        });
                    }
                }
            }
        }
        Ok(out)
    }
}

fn check_record(raw: &[u8]) -> std::result::Result<(), &'static str> {
    if raw.len() < HEADER_LEN {
        return Err("short header");
    }
    if &raw[..4] != RECORD_MAGIC {
        return Err("bad magic");
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&raw[4..12]);
    let len = u64::from_le_bytes(len_bytes);
    if len != (raw.len() - HEADER_LEN) as u64 {
        return Err("length mismatch");
    }
    if blake3::hash(&raw[HEADER_LEN..]).as_bytes()[..] != raw[12..HEADER_LEN] {
        return Err("checksum mismatch");
    }
    Ok(())
}

struct RecordInfo {
    space: KeySpace,
    size: u64,
    modified: SystemTime,
    path: PathBuf,
}

#[async_trait]
impl LocalStore for DiskStore {
    async fn get(&self, space: KeySpace, hash: &Hash) -> Result<Option<Bytes>> {
        let inner = self.inner.clone();
        let hash = *hash;
        let verify = self.verify_on_read;
        let read = tokio::task::spawn_blocking(move || inner.read_record(space, &hash, verify))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?;
        Ok(read?)
    }

    async fn put(&self, space: KeySpace, hash: &Hash, data: Bytes) -> Result<()> {
        let inner = self.inner.clone();
        let hash = *hash;
        let written = tokio::task::spawn_blocking(move || inner.write_record(space, &hash, &data))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?;
        Ok(written?)
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}

/// Per-space record counts (sizes include record headers).
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub spaces: BTreeMap<KeySpace, SpaceStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceStats {
    pub records: u64,
    pub bytes: u64,
}

impl StoreStats {
    pub fn space(&self, space: KeySpace) -> SpaceStats {
        self.spaces.get(&space).copied().unwrap_or_default()
    }

    pub fn total_records(&self) -> u64 {
        self.spaces.values().map(|s| s.records).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.spaces.values().map(|s| s.bytes).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_retrieve() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap();

        let hash = Hash::of(b"Hello, vstore!");
        store.put_blocking(KeySpace::Blob, &hash, b"Hello, vstore!").unwrap();

        let got = store.get_blocking(KeySpace::Blob, &hash).unwrap().unwrap();
        assert_eq!(&got[..], b"Hello, vstore!");

        // Same hash in another space is a different key.
        assert!(store.get_blocking(KeySpace::Tree, &hash).unwrap().is_none());
    }

    #[test]
    fn test_sharded_path_format() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap();
        let hash = Hash::of(b"sharding");
        let hex = hash.to_hex();

        let path = store.record_path(KeySpace::Tree, &hash);
        let expected = temp
            .path()
            .join("tree")
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(&hex);
        assert_eq!(path, expected);
    }

    #[test]
    fn test_put_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap();
        let hash = Hash::of(b"dup");

        store.put_blocking(KeySpace::Blob, &hash, b"dup").unwrap();
        let before = fs::read(store.record_path(KeySpace::Blob, &hash)).unwrap();
        store.put_blocking(KeySpace::Blob, &hash, b"dup").unwrap();
        let after = fs::read(store.record_path(KeySpace::Blob, &hash)).unwrap();

        assert_eq!(before, after);
        assert_eq!(store.stats().unwrap().space(KeySpace::Blob).records, 1);
    }

    #[test]
    fn test_torn_record_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap();
        let hash = Hash::of(b"0123456789abcdef");
        store.put_blocking(KeySpace::Blob, &hash, b"0123456789abcdef").unwrap();

        // Chop the record in half, as a crash mid-write without rename would.
        let path = store.record_path(KeySpace::Blob, &hash);
        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() / 2]).unwrap();

        assert!(store.get_blocking(KeySpace::Blob, &hash).unwrap().is_none());
        assert!(!path.exists(), "corrupt record should be removed");
    }

    #[test]
    fn test_flipped_byte_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap();
        let hash = Hash::of(b"payload");
        store.put_blocking(KeySpace::Blob, &hash, b"payload").unwrap();

        let path = store.record_path(KeySpace::Blob, &hash);
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, &raw).unwrap();

        assert!(store.get_blocking(KeySpace::Blob, &hash).unwrap().is_none());
    }

    #[test]
    fn test_verify_on_read_rejects_wrong_content() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap().with_verify_on_read(true);
        let hash = Hash::of(b"expected");

        // A well-formed record whose payload is not what the key names.
        store.put_blocking(KeySpace::Blob, &hash, b"something else").unwrap();
        assert!(store.get_blocking(KeySpace::Blob, &hash).unwrap().is_none());

        // Commit mappings are not content-addressed and are not rehashed.
        let key = Hash::of(b"commit");
        store.put_blocking(KeySpace::CommitTree, &key, b"tree-hash").unwrap();
        assert!(store.get_blocking(KeySpace::CommitTree, &key).unwrap().is_some());
    }

    #[test]
    fn test_empty_payload() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap();
        let hash = Hash::of(b"");
        store.put_blocking(KeySpace::Blob, &hash, b"").unwrap();
        let got = store.get_blocking(KeySpace::Blob, &hash).unwrap().unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn test_stats_per_space() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap();
        for data in [&b"b1"[..], b"b2", b"b3"] {
            store.put_blocking(KeySpace::Blob, &Hash::of(data), data).unwrap();
        }
        store.put_blocking(KeySpace::Tree, &Hash::of(b"t"), b"t").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.space(KeySpace::Blob).records, 3);
        assert_eq!(stats.space(KeySpace::Tree).records, 1);
        assert_eq!(stats.space(KeySpace::CommitTree).records, 0);
        assert_eq!(stats.total_records(), 4);
        assert_eq!(stats.total_bytes(), 4 * (HEADER_LEN as u64 + 2) - 1);
    }

    #[test]
    fn test_prune_to_budget() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap();
        let payload = vec![7u8; 100];
        for i in 0..5u8 {
            let mut data = payload.clone();
            data[0] = i;
            store.put_blocking(KeySpace::Blob, &Hash::of(&data), &data).unwrap();
        }
        let record_size = (HEADER_LEN + 100) as u64;
        assert_eq!(store.stats().unwrap().total_bytes(), 5 * record_size);

        let report = store.prune(2 * record_size).unwrap();
        assert_eq!(report.removed, 3);
        assert_eq!(report.bytes_after, 2 * record_size);
        assert_eq!(store.stats().unwrap().total_records(), 2);

        // Already within budget.
        let noop = store.prune(10 * record_size).unwrap();
        assert_eq!(noop.removed, 0);
    }

    #[tokio::test]
    async fn test_async_contract() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap();
        let hash = Hash::of(b"async");

        assert!(store.get(KeySpace::Blob, &hash).await.unwrap().is_none());
        store
            .put(KeySpace::Blob, &hash, Bytes::from_static(b"async"))
            .await
            .unwrap();
        let got = store.get(KeySpace::Blob, &hash).await.unwrap().unwrap();
        assert_eq!(&got[..], b"async");
    }

    #[test]
    fn test_verify_setting_keeps_temp_sequence() {
        let temp = TempDir::new().unwrap();
        let plain = DiskStore::open(temp.path()).unwrap();
        let verifying = plain.clone().with_verify_on_read(true);

        plain
            .put_blocking(KeySpace::Blob, &Hash::of(b"one"), b"one")
            .unwrap();
        verifying
            .put_blocking(KeySpace::Blob, &Hash::of(b"two"), b"two")
            .unwrap();

        // Both handles draw temp names from one counter.
        assert!(Arc::ptr_eq(&plain.inner, &verifying.inner));
        assert_eq!(plain.inner.tmp_seq.load(Ordering::Relaxed), 2);
        assert!(verifying.verify_on_read);
        assert!(!plain.verify_on_read);
    }

    #[test]
    fn test_corrupt_record_warning_is_component_tagged() {
        use std::sync::Mutex;

        #[derive(Clone, Default)]
        struct Captured(Arc<Mutex<Vec<u8>>>);

        impl Write for Captured {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap();
        let hash = Hash::of(b"tagged");
        store.put_blocking(KeySpace::Blob, &hash, b"tagged").unwrap();
        fs::write(store.record_path(KeySpace::Blob, &hash), b"VSC1").unwrap();

        tracing::subscriber::with_default(subscriber, || {
            assert!(store.get_blocking(KeySpace::Blob, &hash).unwrap().is_none());
        });

        let out = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("Discarding corrupt cache record"), "{}", out);
        assert!(out.contains("component=\"CACHE\""), "{}", out);
    }
}
