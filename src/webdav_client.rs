use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::StatusCode;

use crate::error::{BackupError, Result};

/// Default Basic-auth credentials (spec.md §6.2), overridable via
/// `HttpWebDavClient::with_credentials`.
pub const DEFAULT_USERNAME: &str = "webdav";
pub const DEFAULT_PASSWORD: &str = "password";

/// Outcome of a single `MKCOL` call. Replaces the teacher's pattern of
/// matching raw status codes inline at every call site (spec.md §9
/// REDESIGN FLAG: "exception-for-control-flow around MKCOL's 405/409
/// becomes an enumerated result").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MkcolOutcome {
    Created,
    /// 400/405/409 — the directory collection already exists.
    AlreadyExists,
    Failed(String),
}

/// Minimal polymorphic surface over the WebDAV transport (spec.md §4.2,
/// §6.2). The real implementation speaks HTTP via `reqwest`; tests use an
/// in-memory double instead of runtime-patching a shared client (spec.md
/// §9 REDESIGN FLAG).
#[async_trait]
pub trait WebDavClient: Send + Sync {
    /// `PROPFIND` with depth 1. Returns the set of member names found
    /// (opaque beyond that — spec.md never requires richer listing
    /// semantics since change detection is hash-based only).
    async fn list(&self, path: &str) -> Result<Vec<String>>;

    /// `MKCOL`. 400/405/409 are treated as already-exists; other status
    /// codes and connectivity errors are `Failed`.
    async fn mkcol(&self, path: &str) -> Result<MkcolOutcome>;

    /// `PUT` the given bytes at `path`.
    async fn put_file(&self, path: &str, bytes: Vec<u8>) -> Result<()>;

    /// Existence check (`HEAD`). Part of the adapter contract (spec.md §2
    /// component table) though the orchestrator's default flow relies on
    /// the hash cache rather than a remote existence check for change
    /// detection.
    async fn check(&self, path: &str) -> Result<bool>;
}

const ENCODE_SET: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'#').add(b'%').add(b'<').add(b'>').add(b'?').add(b'`');

/// Percent-encodes each path segment, preserving `/` (spec.md §4.2/§6.2).
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, ENCODE_SET).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

pub struct HttpWebDavClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpWebDavClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackupError::Configuration(format!("could not build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
        })
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    fn url_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, encode_path(path))
        }
    }
}

#[async_trait]
impl WebDavClient for HttpWebDavClient {
    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let url = self.url_for(path);
        let response = self
            .client
            .request(reqwest::Method::from_bytes(b"PROPFIND").unwrap(), &url)
            .header("Depth", "1")
            .header("Content-Type", "application/xml")
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| BackupError::Connectivity(e.to_string()))?;

        if !(response.status() == StatusCode::MULTI_STATUS || response.status().is_success()) {
            return Err(BackupError::Connectivity(format!(
                "PROPFIND {path} failed: HTTP {}",
                response.status()
            )));
        }

        let body = response.text().await.map_err(|e| BackupError::Connectivity(e.to_string()))?;
        Ok(parse_propfind_member_names(&body))
    }

    async fn mkcol(&self, path: &str) -> Result<MkcolOutcome> {
        let url = self.url_for(path);
        let response = self
            .client
            .request(reqwest::Method::from_bytes(b"MKCOL").unwrap(), &url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| BackupError::DirectoryCreate { path: path.to_string(), message: e.to_string() })?;

        match response.status() {
            StatusCode::CREATED => Ok(MkcolOutcome::Created),
            StatusCode::BAD_REQUEST | StatusCode::METHOD_NOT_ALLOWED | StatusCode::CONFLICT => {
                Ok(MkcolOutcome::AlreadyExists)
            }
            other => Ok(MkcolOutcome::Failed(format!("HTTP {other}"))),
        }
    }

    async fn put_file(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.url_for(path);
        let response = self
            .client
            .put(&url)
            .basic_auth(&self.username, Some(&self.password))
            .body(bytes)
            .send()
            .await
            .map_err(|e| BackupError::Upload { remote_path: path.to_string(), message: e.to_string() })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackupError::Upload {
                remote_path: path.to_string(),
                message: format!("HTTP {}", response.status()),
            })
        }
    }

    async fn check(&self, path: &str) -> Result<bool> {
        let url = self.url_for(path);
        let response = self
            .client
            .head(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| BackupError::Connectivity(e.to_string()))?;
        Ok(response.status().is_success())
    }
}

/// Minimal PROPFIND multistatus parse, grounded on
/// `bastion-targets::parse_propfind_multistatus`, simplified to just the
/// member `href` basenames since this crate never needs size/mtime.
fn parse_propfind_member_names(xml: &str) -> Vec<String> {
    let Ok(doc) = roxmltree::Document::parse(xml) else {
        return Vec::new();
    };
    doc.descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "href")
        .filter_map(|n| n.text())
        .map(|href| {
            let trimmed = href.trim().trim_end_matches('/');
            trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// In-memory double used by tests in place of the real HTTP adapter
/// (spec.md §9 REDESIGN FLAG: dependency injection instead of duck-typed
/// mocks).
pub mod test_client {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct TestWebDavClient {
        pub files: Mutex<std::collections::HashMap<String, Vec<u8>>>,
        pub collections: Mutex<HashSet<String>>,
        pub put_calls: Mutex<Vec<String>>,
        pub mkcol_calls: Mutex<Vec<String>>,
        pub reachable: Mutex<bool>,
        pub fail_put_paths: Mutex<HashSet<String>>,
        pub in_flight_puts: std::sync::atomic::AtomicUsize,
        pub max_observed_in_flight_puts: std::sync::atomic::AtomicUsize,
        /// Artificial delay before a `mkcol` resolves, used by tests to
        /// widen the window in which concurrent `ensure()` calls on the
        /// same prefix would race if not single-flighted.
        pub mkcol_delay: Mutex<Duration>,
    }

    impl TestWebDavClient {
        pub fn new() -> Self {
            Self {
                reachable: Mutex::new(true),
                ..Default::default()
            }
        }

        pub fn unreachable() -> Self {
            Self {
                reachable: Mutex::new(false),
                ..Default::default()
            }
        }

        pub fn set_fail_put(&self, path: &str) {
            self.fail_put_paths.lock().unwrap().insert(path.to_string());
        }

        pub fn set_mkcol_delay(&self, delay: Duration) {
            *self.mkcol_delay.lock().unwrap() = delay;
        }

        pub fn put_call_count(&self, path: &str) -> usize {
            self.put_calls.lock().unwrap().iter().filter(|p| *p == path).count()
        }

        pub fn mkcol_call_count(&self, path: &str) -> usize {
            self.mkcol_calls.lock().unwrap().iter().filter(|p| *p == path).count()
        }
    }

    #[async_trait]
    impl WebDavClient for TestWebDavClient {
        async fn list(&self, _path: &str) -> Result<Vec<String>> {
            if !*self.reachable.lock().unwrap() {
                return Err(BackupError::Connectivity("test client marked unreachable".into()));
            }
            Ok(self.collections.lock().unwrap().iter().cloned().collect())
        }

        async fn mkcol(&self, path: &str) -> Result<MkcolOutcome> {
            self.mkcol_calls.lock().unwrap().push(path.to_string());

            let delay = *self.mkcol_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut collections = self.collections.lock().unwrap();
            if collections.contains(path) {
                Ok(MkcolOutcome::AlreadyExists)
            } else {
                collections.insert(path.to_string());
                Ok(MkcolOutcome::Created)
            }
        }

        async fn put_file(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
            use std::sync::atomic::Ordering;
            self.put_calls.lock().unwrap().push(path.to_string());

            if self.fail_put_paths.lock().unwrap().contains(path) {
                return Err(BackupError::Upload { remote_path: path.to_string(), message: "simulated failure".into() });
            }

            let current = self.in_flight_puts.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed_in_flight_puts.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight_puts.fetch_sub(1, Ordering::SeqCst);

            self.files.lock().unwrap().insert(path.to_string(), bytes);
            Ok(())
        }

        async fn check(&self, path: &str) -> Result<bool> {
            Ok(self.files.lock().unwrap().contains_key(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_path_preserves_slashes() {
        assert_eq!(encode_path("a/b c/d"), "a/b%20c/d");
    }

    #[test]
    fn encode_path_is_idempotent_on_safe_segments() {
        assert_eq!(encode_path("backup/sub/file.txt"), "backup/sub/file.txt");
    }
}
