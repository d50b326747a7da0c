use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide error type. Variants line up with the error kinds spec.md §7
/// enumerates, since each kind has a different propagation policy: some are
/// fatal before any work starts, others are logged and counted per file.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("WebDAV server unreachable: {0}")]
    Connectivity(String),

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to upload {remote_path}: {message}")]
    Upload { remote_path: String, message: String },

    #[error("failed to create remote directory {path}: {message}")]
    DirectoryCreate { path: String, message: String },

    #[error("hash cache I/O error: {0}")]
    CacheIo(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;
