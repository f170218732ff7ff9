// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Durable key-value blob storage
//!
//! Nodes persist their sequence counters and preferred gateway here; the
//! gateway persists its offline queue. Two implementations are provided:
//! [`MemoryStore`] (shared in-process map with write-failure injection) and
//! [`FileStore`] (one file per key, replaced atomically).

use crate::error::StorageError;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Named byte blobs that survive power loss
pub trait BlobStore: Send {
    /// Read a blob, `None` if the key was never written
    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a blob; once this returns `Ok` the value is durable
    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a blob; deleting a key that was never written is not an error
    fn remove_blob(&mut self, key: &str) -> Result<(), StorageError>;

    /// Read a little-endian u32 blob
    fn get_u32(&self, key: &str) -> Result<Option<u32>, StorageError> {
        match self.get_blob(key)? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| StorageError::Corrupt {
                    key: key.to_string(),
                    reason: format!("expected 4 bytes, found {}", bytes.len()),
                })?;
                Ok(Some(u32::from_le_bytes(raw)))
            }
        }
    }

    /// Write a little-endian u32 blob
    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        self.set_blob(key, &value.to_le_bytes())
    }

    /// Read a single-byte blob
    fn get_u8(&self, key: &str) -> Result<Option<u8>, StorageError> {
        match self.get_blob(key)? {
            None => Ok(None),
            Some(bytes) if bytes.len() == 1 => Ok(Some(bytes[0])),
            Some(bytes) => Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("expected 1 byte, found {}", bytes.len()),
            }),
        }
    }

    /// Write a single-byte blob
    fn set_u8(&mut self, key: &str, value: u8) -> Result<(), StorageError> {
        self.set_blob(key, &[value])
    }
}

impl<S: BlobStore + ?Sized> BlobStore for Box<S> {
    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).get_blob(key)
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        (**self).set_blob(key, value)
    }

    fn remove_blob(&mut self, key: &str) -> Result<(), StorageError> {
        (**self).remove_blob(key)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    blobs: HashMap<String, Vec<u8>>,
    failing_keys: HashSet<String>,
    fail_all: bool,
    writes: u64,
}

/// In-memory blob store.
///
/// Clones share the same contents, so a test can hand one clone to a
/// component, drop the component ("power loss") and build a new one over
/// another clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every write to `key` fail until cleared
    pub fn fail_key(&self, key: &str, fail: bool) {
        let mut inner = self.lock();
        if fail {
            inner.failing_keys.insert(key.to_string());
        } else {
            inner.failing_keys.remove(key);
        }
    }

    /// Make every write fail until cleared
    pub fn fail_all_writes(&self, fail: bool) {
        self.lock().fail_all = fail;
    }

    /// Number of successful writes
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    /// Whether `key` holds a value
    pub fn contains(&self, key: &str) -> bool {
        self.lock().blobs.contains_key(key)
    }

    /// Overwrite a blob bypassing failure injection
    pub fn corrupt(&self, key: &str, value: &[u8]) {
        self.lock().blobs.insert(key.to_string(), value.to_vec());
    }
}

impl BlobStore for MemoryStore {
    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().blobs.get(key).cloned())
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if inner.fail_all || inner.failing_keys.contains(key) {
            return Err(StorageError::Io {
                key: key.to_string(),
                reason: "injected write failure".to_string(),
            });
        }
        inner.blobs.insert(key.to_string(), value.to_vec());
        inner.writes += 1;
        Ok(())
    }

    fn remove_blob(&mut self, key: &str) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if inner.fail_all || inner.failing_keys.contains(key) {
            return Err(StorageError::Io {
                key: key.to_string(),
                reason: "injected write failure".to_string(),
            });
        }
        inner.blobs.remove(key);
        Ok(())
    }
}

/// File-backed blob store: one file per key inside a directory.
///
/// Writes go to a temporary file in the same directory which is synced and
/// then renamed over the target, so a reader sees either the old or the new
/// blob. The directory itself is synced after the rename so the new entry
/// survives power loss.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::Io {
            key: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { dir })
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/'));
        if !valid {
            return Err(StorageError::Io {
                key: key.to_string(),
                reason: "key must be non-empty [A-Za-z0-9_-/]".to_string(),
            });
        }
        Ok(self.dir.join(format!("{}.blob", key.replace('/', "."))))
    }

    /// Flush directory entries (renames, unlinks) to disk
    #[cfg(unix)]
    fn sync_dir(&self) -> std::io::Result<()> {
        fs::File::open(&self.dir)?.sync_all()
    }

    // Directories cannot be opened for syncing here; NTFS journals renames
    #[cfg(not(unix))]
    fn sync_dir(&self) -> std::io::Result<()> {
        Ok(())
    }
}

impl BlobStore for FileStore {
    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let io_err = |e: std::io::Error| StorageError::Io {
            key: key.to_string(),
            reason: e.to_string(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(value).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        self.sync_dir().map_err(io_err)
    }

    fn remove_blob(&mut self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let io_err = |e: std::io::Error| StorageError::Io {
            key: key.to_string(),
            reason: e.to_string(),
        };
        match fs::remove_file(&path) {
            Ok(()) => self.sync_dir().map_err(io_err),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryStore::new();
        assert_eq!(store.get_blob("seq").unwrap(), None);

        store.set_u32("seq", 42).unwrap();
        assert_eq!(store.get_u32("seq").unwrap(), Some(42));
        assert_eq!(store.write_count(), 1);

        store.set_u8("last_gw", 2).unwrap();
        assert_eq!(store.get_u8("last_gw").unwrap(), Some(2));
    }

    #[test]
    fn test_memory_store_clones_share_contents() {
        let mut a = MemoryStore::new();
        let b = a.clone();
        a.set_blob("k", b"v").unwrap();
        assert_eq!(b.get_blob("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let mut store = MemoryStore::new();
        store.fail_key("oq/meta", true);
        assert!(store.set_blob("oq/meta", b"x").is_err());
        assert!(store.set_blob("oq/slot/0", b"x").is_ok());
        assert!(!store.contains("oq/meta"));

        store.fail_key("oq/meta", false);
        store.fail_all_writes(true);
        assert!(matches!(
            store.set_blob("anything", b"x"),
            Err(StorageError::Io { .. })
        ));
    }

    #[test]
    fn test_typed_reads_reject_wrong_size() {
        let mut store = MemoryStore::new();
        store.set_blob("seq", &[1, 2, 3]).unwrap();
        assert!(matches!(
            store.get_u32("seq"),
            Err(StorageError::Corrupt { .. })
        ));
        store.set_blob("last_gw", &[1, 2]).unwrap();
        assert!(store.get_u8("last_gw").is_err());
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.set_u32("seq1", 7).unwrap();
            store.set_blob("oq/slot/3", b"payload").unwrap();
            store.set_blob("oq/slot/3", b"replaced").unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get_u32("seq1").unwrap(), Some(7));
        assert_eq!(
            store.get_blob("oq/slot/3").unwrap(),
            Some(b"replaced".to_vec())
        );
        assert_eq!(store.get_blob("missing").unwrap(), None);
    }

    #[test]
    fn test_file_store_write_lands_in_synced_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        store.set_blob("oq/meta", b"meta").unwrap();

        // Only the target file remains; the temporary was renamed away
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["oq.meta.blob".to_string()]);
        assert!(store.sync_dir().is_ok());
    }

    #[test]
    fn test_remove_blob() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = FileStore::open(dir.path()).unwrap();
        file.set_blob("oq/slot/1", b"x").unwrap();
        file.remove_blob("oq/slot/1").unwrap();
        assert_eq!(file.get_blob("oq/slot/1").unwrap(), None);
        file.remove_blob("oq/slot/1").unwrap();

        let mut memory = MemoryStore::new();
        memory.set_blob("k", b"v").unwrap();
        memory.fail_key("k", true);
        assert!(memory.remove_blob("k").is_err());
        assert!(memory.contains("k"));
        memory.fail_key("k", false);
        memory.remove_blob("k").unwrap();
        assert!(!memory.contains("k"));
    }

    #[test]
    fn test_file_store_rejects_bad_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        assert!(store.set_blob("../escape", b"x").is_err());
        assert!(store.set_blob("", b"x").is_err());
    }
}
