//! Cache backends keyed by [`CacheKey`].

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::key::CacheKey;

/// Get/put store for framed search index blobs.
pub trait CacheStore: Send + Sync {
    /// `Ok(None)` on a miss.
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<()>;
}

/// In-process store.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, Arc<[u8]>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.entries.read().keys().copied().collect();
        keys.sort();
        keys
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).map(|blob| blob.to_vec()))
    }

    fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
        self.entries.write().insert(*key, Arc::from(bytes));
        Ok(())
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One file per key under a directory.
///
/// Writes go to a temporary sibling that is renamed into place, so readers
/// never observe a partial blob.
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    const EXTENSION: &'static str = "psidx";

    /// Opens (and creates) the cache directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::IoError(format!("failed to create cache dir: {}", e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key.to_hex(), Self::EXTENSION))
    }
}

impl CacheStore for FileCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::IoError(format!("open cache entry failed: {}", e))),
        };
        let len = file
            .metadata()
            .map_err(|e| Error::IoError(format!("metadata failed: {}", e)))?
            .len();
        if len == 0 {
            return Ok(Some(Vec::new()));
        }
        // SAFETY: entries are only ever replaced by rename, never written in
        // place, so the mapped file does not change underneath us.
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::IoError(format!("mmap cache entry failed: {}", e)))?;
        Ok(Some(map.to_vec()))
    }

    fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let temp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            key.to_hex(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let result = write_synced(&temp, bytes).and_then(|()| {
            fs::rename(&temp, &path).map_err(|e| Error::IoError(format!("rename entry failed: {}", e)))
        });
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file =
        File::create(path).map_err(|e| Error::IoError(format!("create temp entry failed: {}", e)))?;
    file.write_all(bytes)
        .map_err(|e| Error::IoError(format!("write entry failed: {}", e)))?;
    file.sync_all()
        .map_err(|e| Error::IoError(format!("sync entry failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir()
            .join("posesearch_test_cache")
            .join(format!("{}_{}", std::process::id(), id))
    }

    fn key(byte: u8) -> CacheKey {
        CacheKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryCache::new();
        assert!(cache.get(&key(1)).unwrap().is_none());
        cache.put(&key(1), b"blob").unwrap();
        assert_eq!(cache.get(&key(1)).unwrap().as_deref(), Some(&b"blob"[..]));
        assert_eq!(cache.len(), 1);
        assert!(cache.remove(&key(1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failed_put_removes_temp_file() {
        let dir = temp_dir();
        let cache = FileCache::open(&dir).unwrap();
        // a non-empty directory at the entry path makes the final rename fail
        let blocker = cache.path_for(&key(3));
        fs::create_dir_all(blocker.join("occupied")).unwrap();

        assert!(cache.put(&key(3), b"blob").is_err());
        let leftovers = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_cache_put_get_overwrite() {
        let dir = temp_dir();
        let cache = FileCache::open(&dir).unwrap();
        assert!(cache.get(&key(2)).unwrap().is_none());

        cache.put(&key(2), b"first").unwrap();
        assert_eq!(cache.get(&key(2)).unwrap().unwrap(), b"first");
        cache.put(&key(2), b"second blob").unwrap();
        assert_eq!(cache.get(&key(2)).unwrap().unwrap(), b"second blob");

        // no temp files are left behind
        let names: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![format!("{}.psidx", key(2).to_hex())]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_cache_empty_entry() {
        let dir = temp_dir();
        let cache = FileCache::open(&dir).unwrap();
        cache.put(&key(3), b"").unwrap();
        assert_eq!(cache.get(&key(3)).unwrap(), Some(Vec::new()));
        fs::remove_dir_all(&dir).unwrap();
    }
}
