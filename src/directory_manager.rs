use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::logger::Logger;
use crate::webdav_client::{MkcolOutcome, WebDavClient};

const MAX_RETRIES: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Guarantees that for every upload, the parent directory chain exists
/// remotely, while never issuing a redundant `mkcol` (spec.md §4.3).
///
/// The `CreatedDirectorySet` is session-scoped and purely in-memory. Each
/// prefix maps to a `OnceCell` that resolves to "created or confirmed
/// exists" exactly once: concurrent `ensure()` calls racing on the same
/// unconfirmed prefix share one in-flight `mkcol` attempt (via
/// `OnceCell::get_or_init`, which awaits an already-running initializer
/// instead of starting a second one) rather than each independently
/// retrying `mkcol` for the same path (spec.md §8 invariant 5).
pub struct DirectoryManager {
    attempts: DashMap<String, Arc<OnceCell<bool>>>,
    client: Arc<dyn WebDavClient>,
    logger: Arc<Logger>,
}

/// Replaces `\` with `/`, collapses duplicate `/`, strips leading/trailing
/// `/` (spec.md §4.3 step 2).
pub fn normalize_dir_path(raw: &str) -> String {
    let replaced = raw.replace('\\', "/");
    let collapsed = replaced.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("/");
    collapsed
}

impl DirectoryManager {
    pub fn new(client: Arc<dyn WebDavClient>, logger: Arc<Logger>) -> Self {
        Self {
            attempts: DashMap::new(),
            client,
            logger,
        }
    }

    /// Returns the shared `OnceCell` for `prefix`, inserting a fresh one
    /// only if none exists yet. `DashMap::entry` holds the shard lock for
    /// the duration of the call, so two concurrent callers can never both
    /// observe "missing" and each insert their own cell.
    fn cell_for(&self, prefix: &str) -> Arc<OnceCell<bool>> {
        self.attempts.entry(prefix.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
    }

    /// Ensures every prefix of `path` exists remotely. Returns `true` iff
    /// every segment was either created or confirmed-exist; otherwise logs
    /// and returns `false` (non-fatal — the upload may still succeed if the
    /// leaf directory happens to exist, spec.md §4.3 step 5).
    pub async fn ensure(&self, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }

        let normalized = normalize_dir_path(path);
        if normalized.is_empty() {
            return true;
        }

        let segments: Vec<&str> = normalized.split('/').collect();
        let mut all_ok = true;

        let mut prefix = String::new();
        for segment in segments {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);

            let cell = self.cell_for(&prefix);
            let ok = *cell.get_or_init(|| self.ensure_one(&prefix)).await;
            if !ok {
                all_ok = false;
                // Continue attempting remaining prefixes (spec.md §4.3 step 4).
            }
        }

        all_ok
    }

    async fn ensure_one(&self, prefix: &str) -> bool {
        let mut attempt = 0;
        loop {
            match self.client.mkcol(prefix).await {
                Ok(MkcolOutcome::Created) | Ok(MkcolOutcome::AlreadyExists) => return true,
                Ok(MkcolOutcome::Failed(reason)) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        self.logger.verbose(format!(
                            "failed to create remote directory {prefix} after {attempt} attempts: {reason}"
                        ));
                        return false;
                    }
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        self.logger.verbose(format!(
                            "failed to create remote directory {prefix} after {attempt} attempts: {e}"
                        ));
                        return false;
                    }
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
            }
        }
    }

    /// Bulk operation: computes the union of parent chains for a set of
    /// files and calls `ensure` on each, in the caller's insertion order
    /// for predictable logs (spec.md §4.3).
    pub async fn pre_create(&self, unique_dirs: &[String]) {
        for dir in unique_dirs {
            self.ensure(dir).await;
        }
    }

    pub fn is_created(&self, path: &str) -> bool {
        let normalized = normalize_dir_path(path);
        match self.attempts.get(&normalized) {
            Some(cell) => cell.get().copied().unwrap_or(false),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Verbosity;
    use crate::webdav_client::test_client::TestWebDavClient;

    fn manager(client: Arc<TestWebDavClient>) -> DirectoryManager {
        DirectoryManager::new(client, Arc::new(Logger::new(Verbosity::Quiet)))
    }

    #[tokio::test]
    async fn empty_path_is_trivially_ok() {
        let client = Arc::new(TestWebDavClient::new());
        let mgr = manager(client);
        assert!(mgr.ensure("").await);
    }

    #[tokio::test]
    async fn ensure_creates_each_segment_exactly_once() {
        let client = Arc::new(TestWebDavClient::new());
        let mgr = manager(client.clone());
        assert!(mgr.ensure("backup/d").await);
        assert_eq!(client.mkcol_call_count("backup"), 1);
        assert_eq!(client.mkcol_call_count("backup/d"), 1);
    }

    #[tokio::test]
    async fn repeated_ensure_does_not_recreate() {
        let client = Arc::new(TestWebDavClient::new());
        let mgr = manager(client.clone());
        assert!(mgr.ensure("backup/d").await);
        assert!(mgr.ensure("backup/d").await);
        assert!(mgr.ensure("backup/d/e").await);
        // "backup" and "backup/d" are shared prefixes — at most one mkcol each.
        assert_eq!(client.mkcol_call_count("backup"), 1);
        assert_eq!(client.mkcol_call_count("backup/d"), 1);
        assert_eq!(client.mkcol_call_count("backup/d/e"), 1);
    }

    #[tokio::test]
    async fn pre_create_dedupes_shared_parent_across_files() {
        let client = Arc::new(TestWebDavClient::new());
        let mgr = manager(client.clone());
        mgr.pre_create(&["backup/d".to_string(), "backup/d".to_string(), "backup".to_string()]).await;
        assert_eq!(client.mkcol_call_count("backup"), 1);
        assert_eq!(client.mkcol_call_count("backup/d"), 1);
    }

    #[tokio::test]
    async fn normalize_collapses_slashes_and_backslashes() {
        assert_eq!(normalize_dir_path("/backup//d\\e/"), "backup/d/e");
    }

    /// Regression test for the check-then-act race: many tasks racing
    /// `ensure()` on the same shared parent must single-flight down to
    /// exactly one `mkcol` per prefix, even when `mkcol` is slow enough
    /// that every caller's "is this prefix already created?" check would
    /// otherwise observe "not yet" before the first attempt lands.
    #[tokio::test]
    async fn concurrent_ensure_on_shared_prefix_single_flights_mkcol() {
        let client = Arc::new(TestWebDavClient::new());
        client.set_mkcol_delay(Duration::from_millis(20));
        let mgr = Arc::new(manager(client.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move { mgr.ensure("backup/d/e").await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(client.mkcol_call_count("backup"), 1);
        assert_eq!(client.mkcol_call_count("backup/d"), 1);
        assert_eq!(client.mkcol_call_count("backup/d/e"), 1);
    }
}
