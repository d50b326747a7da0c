use std::sync::atomic::{AtomicU64, Ordering};

/// How chatty the `Logger` should be. Orthogonal to `RUST_LOG` filtering —
/// this gates what the core itself decides is worth saying, `RUST_LOG`
/// gates what `env_logger` forwards from the `log` facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

/// Running totals, updated exclusively through the Progress Tracker (spec.md
/// §3 "mutated only by the orchestrator thread ... stats are updated by
/// tasks through the Progress Tracker which is the sole mutator").
#[derive(Debug, Default)]
pub struct Stats {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Stats {
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn record_success(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Bulk-sets the completed/failed totals, used by the orchestrator to
    /// fold the Progress Tracker's final counters into the session once the
    /// scheduler has drained (spec.md §3 "stats are updated by tasks
    /// through the Progress Tracker which is the sole mutator").
    pub fn set_counts(&self, completed: u64, failed: u64) {
        self.completed.store(completed, Ordering::SeqCst);
        self.failed.store(failed, Ordering::SeqCst);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

/// One invocation of the tool, from argument parse to final summary
/// (spec.md §3, GLOSSARY "Session").
pub struct Session {
    pub source_dir: std::path::PathBuf,
    pub webdav_url: String,
    /// Normalized: trimmed of leading/trailing `/`. May be empty.
    pub target_dir: String,
    pub max_concurrency: usize,
    pub force: bool,
    pub verbosity: Verbosity,
    pub stats: Stats,
}

/// `⌊2 · cpu_count / 3⌋` clamped to ≥ 1 (spec.md §3).
pub fn default_max_concurrency() -> usize {
    let cpus = num_cpus::get();
    ((2 * cpus) / 3).max(1)
}

/// Strip leading/trailing `/` from a target directory.
pub fn normalize_target_dir(raw: &str) -> String {
    raw.trim_matches('/').to_string()
}
