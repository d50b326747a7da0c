use std::path::PathBuf;

use clap::Parser;

use crate::error::{BackupError, Result};
use crate::session::{default_max_concurrency, normalize_target_dir, Session, Stats, Verbosity};

/// `<program> <source-dir> [options]` (spec.md §6.1). Help/version are
/// handled manually in `main` so their exit code (0) and "no arguments"
/// behavior match the spec exactly rather than clap's defaults.
#[derive(Parser, Debug)]
#[command(
    name = "webdav-backup",
    about = "Mirror a local directory tree to a WebDAV server",
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct Cli {
    /// Local directory to back up.
    pub source_dir: Option<PathBuf>,

    /// WebDAV server base URL (required).
    #[arg(long = "webdav-url")]
    pub webdav_url: Option<String>,

    /// Remote base directory; defaults to server root.
    #[arg(long = "target", default_value = "")]
    pub target: String,

    /// Overrides the default concurrency cap.
    #[arg(long = "cores")]
    pub cores: Option<String>,

    #[arg(long = "quiet")]
    pub quiet: bool,

    #[arg(long = "verbose")]
    pub verbose: bool,

    #[arg(long = "force")]
    pub force: bool,

    #[arg(short = 'h', long = "help")]
    pub help: bool,

    #[arg(short = 'v', long = "version")]
    pub version: bool,
}

impl Cli {
    /// Validate and convert parsed CLI arguments into a `Session`
    /// (spec.md §4.7 step 1, §3). Configuration errors are surfaced here,
    /// before any I/O is attempted.
    pub fn into_session(self) -> Result<Session> {
        let webdav_url = self
            .webdav_url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| BackupError::Configuration("--webdav-url is required".into()))?;

        let source_dir = self
            .source_dir
            .ok_or_else(|| BackupError::Configuration("source directory is required".into()))?;

        if !source_dir.exists() {
            return Err(BackupError::Configuration(format!(
                "source directory {} does not exist",
                source_dir.display()
            )));
        }

        // Canonicalize so `FileRecord::absolute_path` is actually canonical
        // (spec.md §3) — two invocations pointing at the same tree via
        // differently-spelled but equivalent paths (`data` vs `./data`, a
        // different cwd, a trailing slash) must produce identical
        // `HashCache` keys, or change detection spuriously misses on every
        // run (spec.md §8 invariant 2, idempotence).
        let source_dir = source_dir.canonicalize().map_err(|e| {
            BackupError::Configuration(format!("could not canonicalize source directory {}: {e}", source_dir.display()))
        })?;

        let max_concurrency = match self.cores {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    BackupError::Configuration(format!("--cores must be a positive integer, got {raw:?}"))
                })?,
            None => default_max_concurrency(),
        };

        let verbosity = match (self.quiet, self.verbose) {
            (true, true) => {
                return Err(BackupError::Configuration(
                    "--quiet and --verbose are mutually exclusive".into(),
                ))
            }
            (true, false) => Verbosity::Quiet,
            (false, true) => Verbosity::Verbose,
            (false, false) => Verbosity::Normal,
        };

        Ok(Session {
            source_dir,
            webdav_url,
            target_dir: normalize_target_dir(&self.target),
            max_concurrency,
            force: self.force,
            verbosity,
            stats: Stats::default(),
        })
    }
}

pub const HELP_TEXT: &str = "\
webdav-backup — mirror a local directory tree to a WebDAV server

USAGE:
    webdav-backup <source-dir> --webdav-url=<url> [options]

OPTIONS:
    --webdav-url=<url>   WebDAV server base URL (required)
    --target=<path>      Remote base directory (default: server root)
    --cores=<n>           Max in-flight uploads (default: based on CPU count)
    --force               Treat every file as changed
    --quiet               Suppress non-error logs
    --verbose             Emit per-file log events
    -h, --help            Print this help and exit
    -v, --version         Print version and exit
";

pub const VERSION_TEXT: &str = concat!("webdav-backup ", env!("CARGO_PKG_VERSION"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_webdav_url_is_configuration_error() {
        let cli = Cli {
            source_dir: Some(PathBuf::from(".")),
            webdav_url: None,
            target: String::new(),
            cores: None,
            quiet: false,
            verbose: false,
            force: false,
            help: false,
            version: false,
        };
        let err = cli.into_session().unwrap_err();
        assert!(matches!(err, BackupError::Configuration(_)));
    }

    #[test]
    fn missing_source_dir_is_configuration_error() {
        let cli = Cli {
            source_dir: None,
            webdav_url: Some("http://example.com".into()),
            target: String::new(),
            cores: None,
            quiet: false,
            verbose: false,
            force: false,
            help: false,
            version: false,
        };
        let err = cli.into_session().unwrap_err();
        assert!(matches!(err, BackupError::Configuration(_)));
    }

    #[test]
    fn invalid_cores_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            source_dir: Some(dir.path().to_path_buf()),
            webdav_url: Some("http://example.com".into()),
            target: String::new(),
            cores: Some("0".into()),
            quiet: false,
            verbose: false,
            force: false,
            help: false,
            version: false,
        };
        let err = cli.into_session().unwrap_err();
        assert!(matches!(err, BackupError::Configuration(_)));
    }

    #[test]
    fn quiet_and_verbose_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            source_dir: Some(dir.path().to_path_buf()),
            webdav_url: Some("http://example.com".into()),
            target: String::new(),
            cores: None,
            quiet: true,
            verbose: true,
            force: false,
            help: false,
            version: false,
        };
        assert!(cli.into_session().is_err());
    }

    #[test]
    fn valid_cli_builds_session() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            source_dir: Some(dir.path().to_path_buf()),
            webdav_url: Some("http://example.com/webdav".into()),
            target: "/backup/".into(),
            cores: Some("4".into()),
            quiet: false,
            verbose: false,
            force: true,
            help: false,
            version: false,
        };
        let session = cli.into_session().unwrap();
        assert_eq!(session.target_dir, "backup");
        assert_eq!(session.max_concurrency, 4);
        assert!(session.force);
    }
}
