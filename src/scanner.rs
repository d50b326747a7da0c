use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::hash_cache::HashCache;
use crate::logger::Logger;

/// spec.md §3 FileRecord.change_state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Unknown,
    Unchanged,
    Changed,
}

/// spec.md §3 FileRecord. `relative_path` is always forward-slash
/// normalized for remote use and never contains `..` or a leading `/`.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub absolute_path: PathBuf,
    pub relative_path: String,
    pub size: u64,
    pub checksum: Option<String>,
    pub change_state: ChangeState,
}

/// `{all_files, files_to_upload, total_bytes}` (spec.md §4.4).
pub struct ScanResult {
    pub all_files: Vec<FileRecord>,
    pub files_to_upload: Vec<FileRecord>,
    pub total_bytes: u64,
}

/// Walks the source tree and classifies every regular file found
/// (spec.md §4.4). `WalkDir` does not follow symlinks by default, which is
/// exactly what avoids symlinked cycles here; non-regular entries (sockets,
/// devices, FIFOs, symlinks themselves) are excluded by the `is_file()`
/// filter.
pub struct FileScanner<'a> {
    hash_cache: &'a HashCache,
    logger: &'a Logger,
    force: bool,
}

fn to_relative_forward_slash(root: &Path, absolute: &Path) -> Option<String> {
    let relative = absolute.strip_prefix(root).ok()?;
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() || joined.contains("..") {
        None
    } else {
        Some(joined)
    }
}

impl<'a> FileScanner<'a> {
    pub fn new(hash_cache: &'a HashCache, logger: &'a Logger, force: bool) -> Self {
        Self { hash_cache, logger, force }
    }

    /// Produces a complete, finite list of `FileRecord`s for `source_root`.
    pub async fn scan(&self, source_root: &Path) -> ScanResult {
        let mut all_files = Vec::new();
        let mut files_to_upload = Vec::new();
        let mut total_bytes = 0u64;

        let entries: Vec<_> = WalkDir::new(source_root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();

        for entry in entries {
            let absolute_path = entry.path().to_path_buf();
            let Some(relative_path) = to_relative_forward_slash(source_root, &absolute_path) else {
                self.logger.verbose(format!("skipping unreadable relative path for {}", absolute_path.display()));
                continue;
            };

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    self.logger.verbose(format!("could not stat {}: {e}", absolute_path.display()));
                    all_files.push(FileRecord {
                        absolute_path,
                        relative_path,
                        size: 0,
                        checksum: None,
                        change_state: ChangeState::Unknown,
                    });
                    continue;
                }
            };
            let size = metadata.len();

            let record = if self.force {
                FileRecord {
                    absolute_path,
                    relative_path,
                    size,
                    checksum: None,
                    change_state: ChangeState::Changed,
                }
            } else {
                match HashCache::compute_hash(&absolute_path).await {
                    Ok(checksum) => {
                        let unchanged = self.hash_cache.get(&absolute_path).as_deref() == Some(checksum.as_str());
                        FileRecord {
                            absolute_path,
                            relative_path,
                            size,
                            checksum: Some(checksum),
                            change_state: if unchanged { ChangeState::Unchanged } else { ChangeState::Changed },
                        }
                    }
                    Err(e) => {
                        self.logger.verbose(format!("could not read {}: {e}", absolute_path.display()));
                        FileRecord {
                            absolute_path,
                            relative_path,
                            size,
                            checksum: None,
                            change_state: ChangeState::Unknown,
                        }
                    }
                }
            };

            total_bytes += record.size;
            if !matches!(record.change_state, ChangeState::Unchanged) {
                files_to_upload.push(record.clone());
            }
            all_files.push(record);
        }

        ScanResult { all_files, files_to_upload, total_bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Verbosity;

    fn quiet_logger() -> Logger {
        Logger::new(Verbosity::Quiet)
    }

    #[tokio::test]
    async fn scans_nested_files_and_normalizes_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("d/b.txt"), b"world").unwrap();

        let cache = HashCache::empty();
        let logger = quiet_logger();
        let scanner = FileScanner::new(&cache, &logger, false);
        let result = scanner.scan(dir.path()).await;

        assert_eq!(result.all_files.len(), 2);
        assert_eq!(result.files_to_upload.len(), 2);
        let mut relatives: Vec<_> = result.all_files.iter().map(|f| f.relative_path.clone()).collect();
        relatives.sort();
        assert_eq!(relatives, vec!["a.txt".to_string(), "d/b.txt".to_string()]);
    }

    #[tokio::test]
    async fn unchanged_file_excluded_from_files_to_upload() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();

        let cache = HashCache::empty();
        let hash = HashCache::compute_hash(&file_path).await.unwrap();
        cache.update(&file_path, hash);

        let logger = quiet_logger();
        let scanner = FileScanner::new(&cache, &logger, false);
        let result = scanner.scan(dir.path()).await;

        assert_eq!(result.files_to_upload.len(), 0);
        assert_eq!(result.all_files[0].change_state, ChangeState::Unchanged);
    }

    #[tokio::test]
    async fn force_treats_every_file_as_changed() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();

        let cache = HashCache::empty();
        let hash = HashCache::compute_hash(&file_path).await.unwrap();
        cache.update(&file_path, hash);

        let logger = quiet_logger();
        let scanner = FileScanner::new(&cache, &logger, true);
        let result = scanner.scan(dir.path()).await;

        assert_eq!(result.files_to_upload.len(), 1);
        assert_eq!(result.files_to_upload[0].change_state, ChangeState::Changed);
    }

    #[test]
    fn to_relative_forward_slash_rejects_parent_escapes() {
        let root = Path::new("/a/b");
        let absolute = Path::new("/a/c/x.txt");
        assert_eq!(to_relative_forward_slash(root, absolute), None);
    }
}
