use std::sync::Mutex;

use indicatif::ProgressBar;

use crate::session::Verbosity;

/// Verbosity-gated diagnostic sink that coordinates with the progress bar
/// so a log line never tears a progress line in half (spec.md §4.5).
///
/// The `ProgressBar` handle is installed by the Progress Tracker once
/// `start()` is called; while installed, every log call routes through
/// `ProgressBar::println`, which clears the line, prints, and redraws —
/// exactly the interposition spec.md describes, without hand-rolled
/// carriage-return/clear-to-EOL sequences.
pub struct Logger {
    verbosity: Verbosity,
    bar: Mutex<Option<ProgressBar>>,
}

impl Logger {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            bar: Mutex::new(None),
        }
    }

    pub fn attach_progress_bar(&self, bar: ProgressBar) {
        *self.bar.lock().unwrap() = Some(bar);
    }

    pub fn detach_progress_bar(&self) {
        *self.bar.lock().unwrap() = None;
    }

    fn emit(&self, line: String) {
        let guard = self.bar.lock().unwrap();
        match guard.as_ref() {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }

    /// Verbose-only diagnostic (e.g. cache load failures, directory-create
    /// retries).
    pub fn verbose(&self, line: impl AsRef<str>) {
        log::debug!("{}", line.as_ref());
        if self.verbosity == Verbosity::Verbose {
            self.emit(line.as_ref().to_string());
        }
    }

    /// Normal-and-above informational line (per-file events in Verbose
    /// mode, summaries in Normal mode).
    pub fn info(&self, line: impl AsRef<str>) {
        log::info!("{}", line.as_ref());
        if self.verbosity != Verbosity::Quiet {
            self.emit(line.as_ref().to_string());
        }
    }

    /// Always shown, even in Quiet mode (spec.md §4.5 "Quiet mode
    /// suppresses all non-error logs").
    pub fn error(&self, line: impl AsRef<str>) {
        log::error!("{}", line.as_ref());
        self.emit(line.as_ref().to_string());
    }
}
