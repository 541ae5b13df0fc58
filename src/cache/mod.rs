//! Content-addressed cache of downloaded snap blobs.
//!
//! Entries are regular files named by their SHA3-384, hard-linked in and out
//! to avoid copies. Recency is tracked through file modification times, so
//! eviction survives process restarts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

/// Cache of already-downloaded artifacts keyed by content hash.
pub trait DownloadCache: Send + Sync {
    /// Deliver the cached file for `sha3_384` to `target`. A miss is
    /// `io::ErrorKind::NotFound`.
    fn get(&self, sha3_384: &str, target: &Path) -> io::Result<()>;

    /// Insert the file at `path` under `sha3_384`, evicting the least
    /// recently used entries down to the configured bound.
    fn put(&self, sha3_384: &str, path: &Path) -> io::Result<()>;

    /// Path of the cached file, or `None` when absent.
    fn path(&self, sha3_384: &str) -> Option<PathBuf>;
}

/// Bounded on-disk cache.
pub struct CacheManager {
    dir: PathBuf,
    max_items: usize,
}

impl CacheManager {
    pub fn new(dir: impl Into<PathBuf>, max_items: usize) -> Self {
        CacheManager {
            dir: dir.into(),
            max_items,
        }
    }

    pub fn count(&self) -> usize {
        match fs::read_dir(&self.dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).count(),
            Err(_) => 0,
        }
    }

    fn entry_path(&self, sha3_384: &str) -> PathBuf {
        self.dir.join(sha3_384)
    }

    /// Drop the oldest entries until the cache is within its bound. Entries
    /// with equal mtimes are evicted in lexicographic filename order.
    fn cleanup(&self) -> io::Result<()> {
        let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                entries.push((mtime, entry.path()));
            }
        }
        if entries.len() <= self.max_items {
            return Ok(());
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let excess = entries.len() - self.max_items;
        for (_, path) in entries.into_iter().take(excess) {
            if let Err(err) = fs::remove_file(&path) {
                debug!("cannot remove cache entry {}: {err}", path.display());
            }
        }
        Ok(())
    }
}

/// Hard-link `src` to `dst`, replacing `dst`; falls back to a copy when the
/// link fails (e.g. across filesystems).
fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::remove_file(dst) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).map(|_| ())
}

impl DownloadCache for CacheManager {
    fn get(&self, sha3_384: &str, target: &Path) -> io::Result<()> {
        let cached = self.entry_path(sha3_384);
        if !cached.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not cached"));
        }
        link_or_copy(&cached, target)?;
        // refresh recency for the LRU
        let now = fs::File::open(&cached)?;
        let _ = now.set_modified(SystemTime::now());
        Ok(())
    }

    fn put(&self, sha3_384: &str, path: &Path) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        link_or_copy(path, &self.entry_path(sha3_384))?;
        self.cleanup()
    }

    fn path(&self, sha3_384: &str) -> Option<PathBuf> {
        let cached = self.entry_path(sha3_384);
        cached.is_file().then_some(cached)
    }
}

/// Used when caching is disabled; all operations no-op.
pub struct NullCache;

impl DownloadCache for NullCache {
    fn get(&self, _sha3_384: &str, _target: &Path) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::NotFound, "cache disabled"))
    }

    fn put(&self, _sha3_384: &str, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn path(&self, _sha3_384: &str) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn seed(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, content).unwrap();
        p
    }

    #[test]
    fn put_then_get() {
        let work = tempdir().unwrap();
        let cache = CacheManager::new(work.path().join("cache"), 5);
        let src = seed(work.path(), "blob", b"data");

        cache.put("aabb", &src).unwrap();
        let target = work.path().join("restored");
        cache.get("aabb", &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"data");
        assert!(cache.path("aabb").is_some());
    }

    #[test]
    fn miss_is_not_found() {
        let work = tempdir().unwrap();
        let cache = CacheManager::new(work.path().join("cache"), 5);
        let err = cache.get("absent", &work.path().join("out")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(cache.path("absent").is_none());
    }

    #[test]
    fn put_evicts_least_recently_used() {
        let work = tempdir().unwrap();
        let cache = CacheManager::new(work.path().join("cache"), 2);

        for (i, hash) in ["one", "two", "three"].iter().enumerate() {
            let src = seed(work.path(), hash, hash.as_bytes());
            cache.put(hash, &src).unwrap();
            // age entries into the past, oldest first, so a fresh insert is
            // always the newest entry
            let t = SystemTime::UNIX_EPOCH + Duration::from_secs(i as u64 + 1);
            fs::File::open(cache.path(hash).unwrap())
                .unwrap()
                .set_modified(t)
                .unwrap();
        }
        let src = seed(work.path(), "four", b"four");
        cache.put("four", &src).unwrap();

        assert_eq!(cache.count(), 2);
        assert!(cache.path("one").is_none());
        assert!(cache.path("two").is_none());
        assert!(cache.path("three").is_some());
        assert!(cache.path("four").is_some());
    }

    #[test]
    fn eviction_tie_breaks_lexicographically() {
        let work = tempdir().unwrap();
        let cache = CacheManager::new(work.path().join("cache"), 2);
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        for hash in ["bbb", "aaa"] {
            let src = seed(work.path(), hash, hash.as_bytes());
            cache.put(hash, &src).unwrap();
            fs::File::open(cache.path(hash).unwrap())
                .unwrap()
                .set_modified(t)
                .unwrap();
        }
        // same mtime: "aaa" sorts first and is the one evicted
        let src = seed(work.path(), "ccc", b"ccc");
        cache.put("ccc", &src).unwrap();

        assert_eq!(cache.count(), 2);
        assert!(cache.path("aaa").is_none());
        assert!(cache.path("bbb").is_some());
        assert!(cache.path("ccc").is_some());
    }

    #[test]
    fn get_refreshes_recency() {
        let work = tempdir().unwrap();
        let cache = CacheManager::new(work.path().join("cache"), 2);
        let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1);

        for hash in ["first", "second"] {
            let src = seed(work.path(), hash, hash.as_bytes());
            cache.put(hash, &src).unwrap();
            fs::File::open(cache.path(hash).unwrap())
                .unwrap()
                .set_modified(old)
                .unwrap();
        }
        // touch "first" through a get; "second" is now the LRU entry
        cache.get("first", &work.path().join("out")).unwrap();
        let src = seed(work.path(), "third", b"third");
        cache.put("third", &src).unwrap();

        assert!(cache.path("first").is_some());
        assert!(cache.path("second").is_none());
    }

    #[test]
    fn null_cache_noops() {
        let work = tempdir().unwrap();
        let cache = NullCache;
        assert!(cache.get("x", &work.path().join("out")).is_err());
        let src = seed(work.path(), "blob", b"data");
        cache.put("x", &src).unwrap();
        assert!(cache.path("x").is_none());
    }
}
