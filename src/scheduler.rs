use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;

use crate::scanner::FileRecord;

/// A unit of work encompassing "hash-check, ensure directory, PUT, update
/// cache" for one file (spec.md §3, GLOSSARY "Upload task").
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub record: FileRecord,
    pub remote_path: String,
    pub parent_remote_dir: String,
}

impl UploadTask {
    /// `target_dir + "/" + record.relative_path` with duplicate slashes
    /// collapsed and leading/trailing slashes trimmed from `target_dir`
    /// (spec.md §3 UploadTask).
    pub fn new(record: FileRecord, target_dir: &str) -> Self {
        let target_dir = target_dir.trim_matches('/');
        let remote_path = if target_dir.is_empty() {
            record.relative_path.clone()
        } else {
            format!("{target_dir}/{}", record.relative_path)
        };
        let remote_path = collapse_slashes(&remote_path);

        let parent_remote_dir = match remote_path.rfind('/') {
            Some(idx) => remote_path[..idx].to_string(),
            None => String::new(),
        };

        Self { record, remote_path, parent_remote_dir }
    }
}

fn collapse_slashes(path: &str) -> String {
    path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("/")
}

/// Executes a queue of upload tasks with a bounded number in flight
/// (spec.md §4.6). Implemented as a fixed-size worker pool draining a
/// shared pending queue — this is the "counted-down signal" spec.md §9
/// prescribes in place of a `setInterval` completion poll: `start()`
/// returns only once every worker has observed an empty queue, which is
/// exactly `pending == 0 ∧ active == 0`.
pub struct UploadScheduler {
    max_concurrency: usize,
    pending: Arc<Mutex<VecDeque<UploadTask>>>,
    active: Arc<AtomicUsize>,
}

impl UploadScheduler {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sets the pending queue.
    pub fn enqueue(&self, tasks: Vec<UploadTask>) {
        self.pending.lock().unwrap().extend(tasks);
    }

    /// Empties the pending queue; in-flight tasks continue to completion
    /// but no new tasks start.
    pub fn cancel_all(&self) {
        self.pending.lock().unwrap().clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Launches up to `max_concurrency` tasks; invokes `on_done` once
    /// `pending == 0 ∧ active == 0`. `task_fn` is invoked once per task and
    /// must not panic across the task boundary — the per-upload procedure
    /// (spec.md §4.7.1 step 5) is responsible for catching its own errors.
    pub async fn start<F, Fut>(&self, task_fn: F, on_done: impl FnOnce())
    where
        F: Fn(UploadTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_fn = Arc::new(task_fn);
        let mut workers = JoinSet::new();

        for _ in 0..self.max_concurrency {
            let pending = self.pending.clone();
            let active = self.active.clone();
            let task_fn = task_fn.clone();
            workers.spawn(async move {
                loop {
                    let next = pending.lock().unwrap().pop_front();
                    match next {
                        Some(task) => {
                            active.fetch_add(1, Ordering::SeqCst);
                            task_fn(task).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        }
                        None => break,
                    }
                }
            });
        }

        while workers.join_next().await.is_some() {}
        on_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ChangeState;
    use std::sync::atomic::AtomicU64;

    fn dummy_record(name: &str) -> FileRecord {
        FileRecord {
            absolute_path: std::path::PathBuf::from(name),
            relative_path: name.to_string(),
            size: 0,
            checksum: None,
            change_state: ChangeState::Changed,
        }
    }

    #[test]
    fn upload_task_builds_remote_path_and_parent() {
        let task = UploadTask::new(dummy_record("d/b.txt"), "/backup/");
        assert_eq!(task.remote_path, "backup/d/b.txt");
        assert_eq!(task.parent_remote_dir, "backup/d");
    }

    #[test]
    fn upload_task_with_empty_target_dir_has_no_collapse_surprises() {
        let task = UploadTask::new(dummy_record("a.txt"), "");
        assert_eq!(task.remote_path, "a.txt");
        assert_eq!(task.parent_remote_dir, "");
    }

    #[tokio::test]
    async fn scheduler_bounds_concurrency() {
        let scheduler = UploadScheduler::new(2);
        let tasks: Vec<_> = (0..10).map(|i| UploadTask::new(dummy_record(&format!("f{i}.txt")), "")).collect();
        scheduler.enqueue(tasks);

        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(AtomicU64::new(0));

        let current2 = current.clone();
        let max_seen2 = max_seen.clone();
        let completions2 = completions.clone();

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let done2 = done.clone();

        scheduler
            .start(
                move |_task| {
                    let current = current2.clone();
                    let max_seen = max_seen2.clone();
                    let completions = completions2.clone();
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        completions.fetch_add(1, Ordering::SeqCst);
                    }
                },
                move || done2.store(true, Ordering::SeqCst),
            )
            .await;

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(completions.load(Ordering::SeqCst), 10);
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_all_empties_pending_queue() {
        let scheduler = UploadScheduler::new(1);
        scheduler.enqueue(vec![UploadTask::new(dummy_record("a.txt"), "")]);
        scheduler.cancel_all();
        assert_eq!(scheduler.pending_len(), 0);
    }
}
