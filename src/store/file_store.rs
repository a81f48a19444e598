//! Single-file node store with content-addressed records
//!
//! File format:
//! ```text
//! [HEADER: 64 bytes]
//!   - magic: 8 bytes ("STATETRE")
//!   - version: 4 bytes (u32 LE)
//!   - flags: 4 bytes
//!   - record_count: 8 bytes (u64 LE)
//!   - index_offset: 8 bytes (u64 LE)
//!   - refs_offset: 8 bytes (u64 LE)
//!   - refs_count: 8 bytes (u64 LE)
//!   - reserved: 16 bytes
//!
//! [RECORDS: variable]
//!   - packed records, concatenated
//!
//! [INDEX: variable]
//!   - sorted array of (hash, offset, size) entries
//!
//! [REFS: variable]
//!   - root names → root hashes
//! ```
//!
//! Everything after the header is append-only. Each sync appends a fresh
//! index and refs block and only then points the header at them, so a crash
//! between syncs leaves the file as of the last completed sync. Deleting a
//! node drops its index entry; the bytes stay in the file.

use super::blob::Record;
use super::NodeStore;
use crate::model::Hash;
use crate::{Error, Result, MAGIC, VERSION};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const HEADER_SIZE: u64 = 64;
/// 32 (hash) + 8 (offset) + 4 (size)
const INDEX_ENTRY_SIZE: usize = 44;

/// Index entry for a record
#[derive(Clone, Debug)]
struct IndexEntry {
    offset: u64,
    size: u32,
}

/// A content-addressed node store backed by a single file
pub struct ObjectStore {
    /// Path to the store file
    path: std::path::PathBuf,
    /// The file handle
    file: RwLock<File>,
    /// In-memory index
    index: RwLock<HashMap<Hash, IndexEntry>>,
    /// Named roots (ref name → root hash)
    refs: RwLock<HashMap<String, Hash>>,
    /// Current append position
    write_offset: RwLock<u64>,
    /// Index or refs changed since the last sync
    dirty: AtomicBool,
    /// zstd level for large records, `None` stores everything raw
    compression_level: Option<i32>,
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

impl ObjectStore {
    /// Create a new store file, truncating any existing one
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(MAGIC);
        header[8..12].copy_from_slice(&VERSION.to_le_bytes());
        file.write_all(&header)?;
        file.sync_all()?;

        debug!(path = %path.display(), "created object store");

        Ok(ObjectStore {
            path,
            file: RwLock::new(file),
            index: RwLock::new(HashMap::new()),
            refs: RwLock::new(HashMap::new()),
            write_offset: RwLock::new(HEADER_SIZE),
            dirty: AtomicBool::new(false),
            compression_level: None,
        })
    }

    /// Open an existing store file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;

        if &header[0..8] != MAGIC {
            return Err(Error::InvalidFile("Invalid magic bytes".into()));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&header[8..12]);
        let version = u32::from_le_bytes(version);
        if version != VERSION {
            return Err(Error::VersionMismatch {
                expected: VERSION,
                found: version,
            });
        }

        let record_count = read_u64(&header, 16);
        let index_offset = read_u64(&header, 24);
        let refs_offset = read_u64(&header, 32);
        let refs_count = read_u64(&header, 40);

        let mut index = HashMap::new();
        if index_offset > 0 && record_count > 0 {
            file.seek(SeekFrom::Start(index_offset))?;
            for _ in 0..record_count {
                let mut entry_buf = [0u8; INDEX_ENTRY_SIZE];
                file.read_exact(&mut entry_buf)?;

                let hash = Hash::from_slice(&entry_buf[0..32])
                    .ok_or_else(|| Error::Corruption("Bad index entry".into()))?;
                let offset = read_u64(&entry_buf, 32);
                let mut size = [0u8; 4];
                size.copy_from_slice(&entry_buf[40..44]);
                let size = u32::from_le_bytes(size);

                index.insert(hash, IndexEntry { offset, size });
            }
        }

        let mut refs = HashMap::new();
        if refs_offset > 0 && refs_count > 0 {
            file.seek(SeekFrom::Start(refs_offset))?;
            for _ in 0..refs_count {
                let mut len_buf = [0u8; 2];
                file.read_exact(&mut len_buf)?;
                let name_len = u16::from_le_bytes(len_buf) as usize;

                let mut name_buf = vec![0u8; name_len];
                file.read_exact(&mut name_buf)?;
                let name = String::from_utf8_lossy(&name_buf).to_string();

                let mut hash_buf = [0u8; 32];
                file.read_exact(&mut hash_buf)?;
                refs.insert(name, Hash::from_bytes(hash_buf));
            }
        }

        // Append after whatever the last sync left, the header may point there
        let write_offset = file.seek(SeekFrom::End(0))?;

        debug!(
            path = %path.display(),
            records = index.len(),
            refs = refs.len(),
            "opened object store"
        );

        Ok(ObjectStore {
            path,
            file: RwLock::new(file),
            index: RwLock::new(index),
            refs: RwLock::new(refs),
            write_offset: RwLock::new(write_offset),
            dirty: AtomicBool::new(false),
            compression_level: None,
        })
    }

    /// Open or create a store file
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Compress large records with zstd at the given level
    pub fn with_compression(mut self, level: Option<i32>) -> Self {
        self.compression_level = level;
        self
    }

    /// Check if a hash exists
    pub fn contains(&self, hash: &Hash) -> bool {
        self.index.read().contains_key(hash)
    }

    // === Ref Management ===

    /// Get the root hash stored under a name
    pub fn get_ref(&self, name: &str) -> Option<Hash> {
        self.refs.read().get(name).copied()
    }

    /// Point a name at a root hash
    pub fn set_ref(&self, name: &str, root: Hash) {
        self.refs.write().insert(name.to_string(), root);
        self.mark_dirty();
    }

    /// Remove a named root
    pub fn delete_ref(&self, name: &str) -> Result<()> {
        self.refs
            .write()
            .remove(name)
            .ok_or_else(|| Error::RefNotFound(name.to_string()))?;
        self.mark_dirty();
        Ok(())
    }

    /// List all named roots, sorted by name
    pub fn list_refs(&self) -> Vec<(String, Hash)> {
        let mut refs: Vec<_> = self
            .refs
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        refs.sort();
        refs
    }

    /// Get the number of live records in the store
    pub fn object_count(&self) -> usize {
        self.index.read().len()
    }

    /// Drop every record whose hash is not in `live`, returning how many
    /// were dropped
    pub fn retain(&self, live: &HashSet<Hash>) -> usize {
        let mut index = self.index.write();
        let before = index.len();
        index.retain(|hash, _| live.contains(hash));
        let dropped = before - index.len();
        if dropped > 0 {
            self.mark_dirty();
        }
        dropped
    }

    /// Flush changes and write index and refs to disk
    ///
    /// The new index and refs are appended and flushed before the header is
    /// pointed at them. Nothing is written when nothing changed.
    pub fn sync(&self) -> Result<()> {
        let index = self.index.read();
        let refs = self.refs.read();
        let mut write_offset = self.write_offset.write();
        let mut file = self.file.write();

        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let index_offset = *write_offset;
        let result = write_tables(&mut file, &index, &refs, index_offset);
        match result {
            Ok(end) => {
                *write_offset = end;
                debug!(records = index.len(), refs = refs.len(), "synced object store");
                Ok(())
            }
            Err(err) => {
                self.mark_dirty();
                Err(err)
            }
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append index and refs at `index_offset`, then point the header at them.
/// Returns the end of the appended tables.
fn write_tables(
    file: &mut File,
    index: &HashMap<Hash, IndexEntry>,
    refs: &HashMap<String, Hash>,
    index_offset: u64,
) -> Result<u64> {
    let refs_offset = index_offset + (index.len() * INDEX_ENTRY_SIZE) as u64;

    // Index, sorted by hash for determinism
    file.seek(SeekFrom::Start(index_offset))?;
    let mut entries: Vec<_> = index.iter().collect();
    entries.sort_by_key(|(h, _)| **h);

    for (hash, entry) in entries {
        file.write_all(hash.as_bytes())?;
        file.write_all(&entry.offset.to_le_bytes())?;
        file.write_all(&entry.size.to_le_bytes())?;
    }

    // Refs: name_len (u16) + name + hash (32 bytes)
    let mut ref_list: Vec<_> = refs.iter().collect();
    ref_list.sort_by_key(|(name, _)| *name);

    for (name, hash) in ref_list {
        let name_bytes = name.as_bytes();
        file.write_all(&(name_bytes.len() as u16).to_le_bytes())?;
        file.write_all(name_bytes)?;
        file.write_all(hash.as_bytes())?;
    }
    let end = file.stream_position()?;
    file.sync_data()?;

    // Header last
    file.seek(SeekFrom::Start(16))?;
    file.write_all(&(index.len() as u64).to_le_bytes())?;
    file.write_all(&index_offset.to_le_bytes())?;
    file.write_all(&refs_offset.to_le_bytes())?;
    file.write_all(&(refs.len() as u64).to_le_bytes())?;
    file.sync_all()?;
    Ok(end)
}

impl NodeStore for ObjectStore {
    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        let entry = self.index.read().get(hash).cloned();
        let Some(entry) = entry else {
            return Ok(None);
        };

        let mut data = vec![0u8; entry.size as usize];
        {
            let mut file = self.file.write();
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut data)?;
        }

        Ok(Some(Record::unpack(&data)?.data))
    }

    fn set(&self, hash: &Hash, data: &[u8]) -> Result<()> {
        if self.contains(hash) {
            return Ok(());
        }

        let (record, level) = Record::for_payload(data.to_vec(), self.compression_level);
        let packed = record.pack(level)?;
        let size = packed.len() as u32;

        let offset = {
            let mut write_offset = self.write_offset.write();
            let offset = *write_offset;

            let mut file = self.file.write();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&packed)?;

            *write_offset = offset + size as u64;
            offset
        };

        self.index.write().insert(*hash, IndexEntry { offset, size });
        self.mark_dirty();
        Ok(())
    }

    fn del(&self, hash: &Hash) -> Result<()> {
        if self.index.write().remove(hash).is_some() {
            self.mark_dirty();
        }
        Ok(())
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.smt");

        {
            let store = ObjectStore::create(&path).unwrap();
            assert_eq!(store.object_count(), 0);
        }

        {
            let store = ObjectStore::open(&path).unwrap();
            assert_eq!(store.object_count(), 0);
        }
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, vec![1u8; 64]).unwrap();
        assert!(matches!(
            ObjectStore::open(&path),
            Err(Error::InvalidFile(_))
        ));
    }

    #[test]
    fn test_set_get_del() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::create(dir.path().join("test.smt")).unwrap();

        let hash = Hash::digest(b"node");
        store.set(&hash, b"node").unwrap();
        assert_eq!(store.get(&hash).unwrap(), Some(b"node".to_vec()));

        // Same hash, same content: written once
        store.set(&hash, b"node").unwrap();
        assert_eq!(store.object_count(), 1);

        store.del(&hash).unwrap();
        assert_eq!(store.get(&hash).unwrap(), None);
        assert_eq!(store.object_count(), 0);
    }

    #[test]
    fn test_persistence_with_compression() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.smt");

        let big = vec![5u8; 4096];
        let big_hash = Hash::digest(&big);
        let gone = Hash::digest(b"gone");
        {
            let store = ObjectStore::create(&path)
                .unwrap()
                .with_compression(Some(3));
            store.set(&big_hash, &big).unwrap();
            store.set(&gone, b"gone").unwrap();
            store.del(&gone).unwrap();
            store.sync().unwrap();
        }

        {
            let store = ObjectStore::open(&path).unwrap();
            assert_eq!(store.get(&big_hash).unwrap(), Some(big));
            assert_eq!(store.get(&gone).unwrap(), None);
            assert_eq!(store.object_count(), 1);
        }
    }

    #[test]
    fn test_refs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.smt");
        let root = Hash::digest(b"root");

        {
            let store = ObjectStore::create(&path).unwrap();
            assert_eq!(store.get_ref("main"), None);

            store.set_ref("main", root);
            store.set_ref("snapshot", Hash::EMPTY);
            assert_eq!(store.get_ref("main"), Some(root));

            store.delete_ref("snapshot").unwrap();
            assert!(matches!(
                store.delete_ref("snapshot"),
                Err(Error::RefNotFound(_))
            ));
            store.sync().unwrap();
        }

        let store = ObjectStore::open(&path).unwrap();
        assert_eq!(store.list_refs(), vec![("main".to_string(), root)]);
    }

    #[test]
    fn test_unsynced_writes_after_reopen_keep_last_sync() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.smt");
        let kept = Hash::digest(b"kept");
        let lost = Hash::digest(b"lost");

        {
            let store = ObjectStore::create(&path).unwrap();
            store.set(&kept, b"kept").unwrap();
            store.set_ref("main", kept);
            store.sync().unwrap();
        }

        {
            // Crash before sync: no Drop, so the header is never rewritten
            let store = ObjectStore::open(&path).unwrap();
            store.set(&lost, &[7u8; 256]).unwrap();
            std::mem::forget(store);
        }

        let store = ObjectStore::open(&path).unwrap();
        assert_eq!(store.get(&kept).unwrap(), Some(b"kept".to_vec()));
        assert_eq!(store.get(&lost).unwrap(), None);
        assert_eq!(store.get_ref("main"), Some(kept));

        // Appending after the stray record still round-trips
        store.set(&lost, b"lost").unwrap();
        store.sync().unwrap();
        drop(store);
        let store = ObjectStore::open(&path).unwrap();
        assert_eq!(store.get(&lost).unwrap(), Some(b"lost".to_vec()));
        assert_eq!(store.object_count(), 2);
    }

    #[test]
    fn test_sync_without_changes_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.smt");
        let store = ObjectStore::create(&path).unwrap();
        store.set(&Hash::digest(b"a"), b"a").unwrap();
        store.sync().unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        store.sync().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
    }

    #[test]
    fn test_retain_drops_unlisted_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.smt");
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");

        {
            let store = ObjectStore::create(&path).unwrap();
            store.set(&a, b"a").unwrap();
            store.set(&b, b"b").unwrap();
            let live: HashSet<Hash> = [a].into_iter().collect();
            assert_eq!(store.retain(&live), 1);
            assert_eq!(store.retain(&live), 0);
            store.sync().unwrap();
        }

        let store = ObjectStore::open(&path).unwrap();
        assert_eq!(store.get(&a).unwrap(), Some(b"a".to_vec()));
        assert!(!store.contains(&b));
    }
}
