use std::path::{Path, PathBuf};

use dashmap::DashMap;
use digest::Digest;
use md5::Md5;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::error::{BackupError, Result};
use crate::logger::Logger;

/// Stable file name for the persisted mapping (spec.md §3/§6.3).
pub const CACHE_FILE_NAME: &str = "webdav-backup-hash-cache";

/// `std::env::temp_dir()/webdav-backup-hash-cache`, the fixed location
/// spec.md §6.3 specifies. Flagged in DESIGN.md/SPEC_FULL.md as fragile
/// across reboots on some platforms — preserved verbatim per spec.md §9's
/// open question, not "fixed".
pub fn default_cache_path() -> PathBuf {
    std::env::temp_dir().join(CACHE_FILE_NAME)
}

const HASH_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Default, Serialize, Deserialize)]
struct OnDiskCache {
    hashes: std::collections::BTreeMap<String, String>,
}

/// Persistent mapping absolute path → content hash, answering "has this
/// file changed since we last uploaded it?" (spec.md §4.1).
///
/// Per-entry synchronization is provided by `DashMap`'s internal sharded
/// locking: concurrent upload tasks may update distinct keys without
/// contending on a single global lock, while updates to the *same* key are
/// serialized by the shard lock that key hashes into.
pub struct HashCache {
    entries: DashMap<String, String>,
}

impl HashCache {
    pub fn empty() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Read the persisted mapping if it exists; otherwise start empty. A
    /// malformed or unreadable cache is treated as empty — never fatal
    /// (spec.md §4.1, §7 "Cache I/O error").
    pub fn load<P: AsRef<Path>>(path: P, logger: &Logger) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::empty();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<OnDiskCache>(&content) {
                Ok(on_disk) => {
                    let entries = DashMap::new();
                    for (k, v) in on_disk.hashes {
                        entries.insert(k, v);
                    }
                    Self { entries }
                }
                Err(e) => {
                    logger.verbose(format!("hash cache at {} is malformed, starting empty: {e}", path.display()));
                    Self::empty()
                }
            },
            Err(e) => {
                logger.verbose(format!("could not read hash cache at {}, starting empty: {e}", path.display()));
                Self::empty()
            }
        }
    }

    /// Compute the MD5 digest of a file's contents, streaming in chunks
    /// (spec.md §4.1). MD5 is chosen for change detection against benign
    /// drift, not adversarial integrity — see spec.md §4.1's rationale.
    pub async fn compute_hash<P: AsRef<Path>>(path: P) -> Result<String> {
        let path = path.as_ref();
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| BackupError::FileRead { path: path.to_path_buf(), source: e })?;

        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| BackupError::FileRead { path: path.to_path_buf(), source: e })?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Platform-normalized key: system separator collapsed, no trailing
    /// separator (spec.md §3 HashCacheEntry).
    pub fn normalize_key<P: AsRef<Path>>(path: P) -> String {
        let path = path.as_ref();
        let mut s = path.to_string_lossy().into_owned();
        while s.len() > 1 && s.ends_with(std::path::MAIN_SEPARATOR) {
            s.pop();
        }
        s
    }

    /// `true` if no entry exists for `path`, or the freshly computed hash
    /// differs from the stored one. On `true` the stored entry is replaced
    /// with the new hash (spec.md §4.1).
    pub async fn has_changed<P: AsRef<Path>>(&self, path: P) -> Result<bool> {
        let key = Self::normalize_key(&path);
        let fresh = Self::compute_hash(&path).await?;
        let changed = match self.entries.get(&key) {
            Some(existing) => *existing != fresh,
            None => true,
        };
        if changed {
            self.entries.insert(key, fresh);
        }
        Ok(changed)
    }

    /// Unconditionally sets the stored hash for `path`.
    pub fn update<P: AsRef<Path>>(&self, path: P, hash: String) {
        self.entries.insert(Self::normalize_key(path), hash);
    }

    pub fn get<P: AsRef<Path>>(&self, path: P) -> Option<String> {
        self.entries.get(&Self::normalize_key(path)).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Atomically persist the mapping via write-temp-then-rename so the
    /// file is never left truncated by a crash mid-write (spec.md §4.1).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let on_disk = OnDiskCache {
            hashes: self
                .entries
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        };
        let content = serde_yaml::to_string(&on_disk).map_err(|e| BackupError::CacheIo(e.to_string()))?;

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| BackupError::CacheIo(e.to_string()))?;
        use std::io::Write;
        tmp.write_all(content.as_bytes()).map_err(|e| BackupError::CacheIo(e.to_string()))?;
        tmp.flush().map_err(|e| BackupError::CacheIo(e.to_string()))?;
        tmp.persist(path).map_err(|e| BackupError::CacheIo(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn quiet_logger() -> Logger {
        Logger::new(crate::session::Verbosity::Quiet)
    }

    #[test]
    fn load_missing_file_is_empty() {
        let cache = HashCache::load("/nonexistent/path/for/test", &quiet_logger());
        assert!(cache.is_empty());
    }

    #[test]
    fn load_malformed_file_is_empty_not_fatal() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b": not valid : yaml : at : all :").unwrap();
        let cache = HashCache::load(tmp.path(), &quiet_logger());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn compute_hash_is_stable_and_32_hex_chars() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello").unwrap();
        let h1 = HashCache::compute_hash(tmp.path()).await.unwrap();
        let h2 = HashCache::compute_hash(tmp.path()).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn has_changed_true_on_first_sight_then_false() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello").unwrap();
        let cache = HashCache::empty();
        assert!(cache.has_changed(tmp.path()).await.unwrap());
        assert!(!cache.has_changed(tmp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn has_changed_true_after_content_modified() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello").unwrap();
        let cache = HashCache::empty();
        assert!(cache.has_changed(tmp.path()).await.unwrap());

        tmp.as_file().set_len(0).unwrap();
        use std::io::Seek;
        tmp.as_file_mut().seek(std::io::SeekFrom::Start(0)).unwrap();
        tmp.write_all(b"HELLO").unwrap();
        assert!(cache.has_changed(tmp.path()).await.unwrap());
    }

    #[test]
    fn save_then_load_round_trips() {
        let cache = HashCache::empty();
        cache.update("/a/b.txt", "deadbeef".to_string());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.yaml");
        cache.save(&path).unwrap();

        let loaded = HashCache::load(&path, &quiet_logger());
        assert_eq!(loaded.get("/a/b.txt").as_deref(), Some("deadbeef"));
    }
}
