use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashSet;

use crate::directory_manager::DirectoryManager;
use crate::error::{BackupError, Result};
use crate::hash_cache::HashCache;
use crate::logger::Logger;
use crate::progress::ProgressTracker;
use crate::scanner::{ChangeState, FileScanner};
use crate::scheduler::{UploadScheduler, UploadTask};
use crate::session::{Session, Verbosity};
use crate::webdav_client::WebDavClient;

/// Final counts reported to `main` for exit-code mapping and the summary
/// line (spec.md §4.7 step 12, §7 "User-visible final summary").
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub up_to_date: bool,
}

impl RunSummary {
    /// `"0 failed"`/`">0 failed"` message per spec.md §7. Color is applied
    /// by the caller (out of scope for the core per spec.md §1).
    pub fn message(&self) -> String {
        if self.up_to_date {
            "all files are up to date".to_string()
        } else if self.failed == 0 {
            format!("all {} files uploaded", self.succeeded)
        } else {
            format!("{} succeeded, {} failed", self.succeeded, self.failed)
        }
    }
}

/// Shared, read-only/internally-synchronized handles threaded into every
/// upload task (spec.md §3 "Ownership summary").
struct UploadContext {
    client: Arc<dyn WebDavClient>,
    hash_cache: Arc<HashCache>,
    directory_manager: Arc<DirectoryManager>,
    progress: Arc<ProgressTracker>,
    logger: Arc<Logger>,
    /// Deduplication invariant (spec.md §4.7 "for any relative_path, the
    /// orchestrator uploads its bytes at most once per session").
    uploaded: DashSet<String>,
    verbose_per_file: bool,
}

/// End-to-end coordinator: scan → pre-create directories → schedule
/// uploads → persist state (spec.md §4.7).
pub struct Uploader;

impl Uploader {
    /// Runs the full 12-step flow described in spec.md §4.7. `session` has
    /// already passed CLI validation (step 1); this function begins at
    /// step 2.
    pub async fn run(session: Session, client: Arc<dyn WebDavClient>, cache_path: PathBuf) -> Result<RunSummary> {
        let logger = Arc::new(Logger::new(session.verbosity));

        // Step 2: load the persisted hash cache. Load failures are
        // swallowed internally (spec.md §7 "Cache I/O error ... load
        // failures are silent").
        let hash_cache = Arc::new(HashCache::load(&cache_path, &logger));

        // Step 3: probe the server. On failure, abort before touching the
        // cache on disk (spec.md §4.7 step 3, §7 "Connectivity error").
        client
            .list("/")
            .await
            .map_err(|e| BackupError::Connectivity(format!("initial PROPFIND failed: {e}")))?;

        let directory_manager = Arc::new(DirectoryManager::new(client.clone(), logger.clone()));

        // Step 4: ensure the remote target directory exists.
        if !session.target_dir.is_empty() {
            directory_manager.ensure(&session.target_dir).await;
        }

        // Step 5: scan the source tree.
        let scan_result = {
            let scanner = FileScanner::new(&hash_cache, &logger, session.force);
            scanner.scan(&session.source_dir).await
        };

        // Step 6: nothing to do. The human-facing summary line is printed
        // exactly once, by `main` (spec.md's ambient logging section: the
        // final summary is the one line allowed to bypass the `Logger`).
        if scan_result.files_to_upload.is_empty() {
            let total = scan_result.all_files.len() as u64;
            session.stats.set_total(total);
            return Ok(RunSummary { total, succeeded: total, failed: 0, up_to_date: true });
        }

        // Build the UploadTask for every file-to-upload up front so the
        // parent-directory set and the scheduler queue see the same remote
        // paths (spec.md §3 UploadTask).
        let tasks: Vec<UploadTask> =
            scan_result.files_to_upload.iter().map(|r| UploadTask::new(r.clone(), &session.target_dir)).collect();

        // Step 7: pre-create the unique set of parent directories, in
        // caller insertion order for predictable logs (spec.md §4.3
        // pre_create).
        let mut seen_dirs = HashSet::new();
        let mut unique_dirs = Vec::new();
        for task in &tasks {
            if seen_dirs.insert(task.parent_remote_dir.clone()) {
                unique_dirs.push(task.parent_remote_dir.clone());
            }
        }
        directory_manager.pre_create(&unique_dirs).await;

        // Step 8: start the progress bar.
        let total = tasks.len() as u64;
        session.stats.set_total(total);
        let mut progress = ProgressTracker::new(logger.clone());
        progress.start(total);
        let progress = Arc::new(progress);

        let verbose_per_file = matches!(session.verbosity, Verbosity::Verbose);
        let ctx = Arc::new(UploadContext {
            client: client.clone(),
            hash_cache: hash_cache.clone(),
            directory_manager: directory_manager.clone(),
            progress: progress.clone(),
            logger: logger.clone(),
            uploaded: DashSet::new(),
            verbose_per_file,
        });

        // Step 9/10: schedule and await completion.
        let scheduler = UploadScheduler::new(session.max_concurrency);
        scheduler.enqueue(tasks);
        scheduler
            .start(
                move |task| {
                    let ctx = ctx.clone();
                    async move { upload_one(task, ctx).await }
                },
                || {},
            )
            .await;

        // Step 11: persist the cache (best-effort — save failures are
        // logged but not fatal, spec.md §7 "Cache I/O error").
        if let Err(e) = hash_cache.save(&cache_path) {
            logger.error(format!("failed to persist hash cache: {e}"));
        }

        // Step 12: stop the bar, report the summary.
        let succeeded = progress.completed() - progress.failed();
        let failed = progress.failed();
        session.stats.set_counts(progress.completed(), failed);
        let summary = RunSummary { total, succeeded, failed, up_to_date: false };

        // Every clone of `progress` handed to upload tasks was dropped when
        // the scheduler drained, so exactly one strong reference (this one)
        // remains.
        match Arc::try_unwrap(progress) {
            Ok(mut progress) => progress.stop(),
            Err(_) => logger.verbose("progress tracker had lingering references at shutdown"),
        }

        // The human-facing summary line itself is printed exactly once, by
        // `main`, so it always appears — even in Quiet mode (spec.md §4.5,
        // §7) — rather than twice in Normal/Verbose mode.
        Ok(summary)
    }
}

/// Per-upload procedure (spec.md §4.7.1). Any error is caught at this
/// boundary and converted into a recorded failure — it must never
/// propagate out and tear down the scheduler (step 5).
async fn upload_one(task: UploadTask, ctx: Arc<UploadContext>) {
    // Dedup invariant: the first task to claim a relative_path proceeds
    // normally; any later duplicate is an immediate success.
    if !ctx.uploaded.insert(task.record.relative_path.clone()) {
        ctx.progress.record_success();
        return;
    }

    match task.record.change_state {
        ChangeState::Unchanged => {
            ctx.progress.record_success();
            return;
        }
        ChangeState::Unknown => match ctx.hash_cache.has_changed(&task.record.absolute_path).await {
            Ok(false) => {
                ctx.progress.record_success();
                return;
            }
            Ok(true) => {}
            Err(e) => {
                ctx.logger.error(format!("failed to read {}: {e}", task.record.absolute_path.display()));
                ctx.progress.record_failure();
                return;
            }
        },
        ChangeState::Changed => {}
    }

    // Safe even if pre-creation was skipped or partial — `ensure` is
    // idempotent and checks the session-scoped set first.
    ctx.directory_manager.ensure(&task.parent_remote_dir).await;

    let bytes = match tokio::fs::read(&task.record.absolute_path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            ctx.logger.error(format!("failed to read {}: {e}", task.record.absolute_path.display()));
            ctx.progress.record_failure();
            return;
        }
    };

    match ctx.client.put_file(&task.remote_path, bytes).await {
        Ok(()) => {
            let hash = match task.record.checksum.clone() {
                Some(hash) => Some(hash),
                None => HashCache::compute_hash(&task.record.absolute_path).await.ok(),
            };
            if let Some(hash) = hash {
                ctx.hash_cache.update(&task.record.absolute_path, hash);
            }
            if ctx.verbose_per_file {
                ctx.logger.verbose(format!("uploaded {}", task.remote_path));
            }
            ctx.progress.record_success();
        }
        Err(e) => {
            // Hash cache is deliberately not updated here so the next run
            // retries this file (spec.md §7 "Per-file upload error").
            ctx.logger.error(format!("failed to upload {}: {e}", task.remote_path));
            ctx.progress.record_failure();
        }
    }
}
