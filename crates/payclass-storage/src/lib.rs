//! Blob storage, local fallback cache and retry utilities for payclass.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "payclass-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing cache entry {key}: {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            context: context.into(),
            source,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Rejects absolute keys and any key that would escape the store root.
fn validated_relative(key: &str) -> Result<PathBuf, StorageError> {
    let trimmed = key.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    let path = PathBuf::from(trimmed);
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(path)
}

/// Writes bytes through a temp file in the destination directory and renames
/// it into place, so readers never observe a partial file.
async fn write_atomic(absolute_path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = absolute_path
        .parent()
        .ok_or_else(|| StorageError::InvalidKey(absolute_path.display().to_string()))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StorageError::io(format!("creating directory {}", parent.display()), e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StorageError::io(format!("opening temp file {}", temp_path.display()), e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StorageError::io(format!("writing temp file {}", temp_path.display()), e))?;
    file.flush()
        .await
        .map_err(|e| StorageError::io(format!("flushing temp file {}", temp_path.display()), e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, absolute_path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(
            format!(
                "renaming {} -> {}",
                temp_path.display(),
                absolute_path.display()
            ),
            err,
        ));
    }
    Ok(())
}

/// Object storage used for generated download files.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<String, StorageError>;

    fn public_url(&self, key: &str) -> Result<String, StorageError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(validated_relative(key)?))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let absolute_path = self.absolute_path(key)?;
        write_atomic(&absolute_path, bytes).await?;
        debug!(key, bytes = bytes.len(), "blob uploaded");
        self.public_url(key)
    }

    fn public_url(&self, key: &str) -> Result<String, StorageError> {
        let relative = validated_relative(key)?;
        let joined = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!("{}/{}", self.base_url, joined))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let absolute_path = self.absolute_path(key)?;
        match fs::remove_file(&absolute_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(
                format!("removing blob {}", absolute_path.display()),
                err,
            )),
        }
    }
}

/// Persistent key/value fallback, namespaced by job id.
///
/// Layout: `<root>/<namespace>/<key>.json`.
#[derive(Debug, Clone)]
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StorageError> {
        let ns = validated_relative(namespace)?;
        if ns.components().count() != 1 {
            return Err(StorageError::InvalidKey(namespace.to_string()));
        }
        let file = validated_relative(&format!("{key}.json"))?;
        Ok(self.root.join(ns).join(file))
    }

    pub async fn put<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value).map_err(|source| StorageError::Serde {
            key: format!("{namespace}/{key}"),
            source,
        })?;
        write_atomic(&self.entry_path(namespace, key)?, &bytes).await
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let path = self.entry_path(namespace, key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StorageError::io(
                    format!("reading cache entry {}", path.display()),
                    err,
                ))
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Serde {
                key: format!("{namespace}/{key}"),
                source,
            })
    }

    pub async fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let path = self.entry_path(namespace, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(
                format!("removing cache entry {}", path.display()),
                err,
            )),
        }
    }

    pub async fn remove_namespace(&self, namespace: &str) -> Result<(), StorageError> {
        let dir = self.root.join(validated_relative(namespace)?);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(
                format!("removing cache namespace {}", dir.display()),
                err,
            )),
        }
    }

    async fn list_dir(dir: &Path, want_dirs: bool) -> Result<Vec<String>, StorageError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StorageError::io(format!("listing {}", dir.display()), err))
            }
        };
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(format!("listing {}", dir.display()), e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|ft| ft.is_dir())
                .unwrap_or(false);
            if is_dir != want_dirs {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if want_dirs {
                out.push(name);
            } else if let Some(stem) = name.strip_suffix(".json") {
                out.push(stem.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    pub async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        Self::list_dir(&self.root, true).await
    }

    pub async fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.root.join(validated_relative(namespace)?);
        Self::list_dir(&dir, false).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn with_retries(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with an error `is_retryable` rejects, or
/// the policy's retries are exhausted. The last error is returned unchanged.
pub async fn retry_when<T, E, F, Fut, P>(
    policy: &BackoffPolicy,
    label: &str,
    is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && is_retryable(&err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    retry_when(
        policy,
        label,
        |err: &E| err.disposition() == RetryDisposition::Retryable,
        op,
    )
    .await
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Debug)]
    struct Flaky(RetryDisposition);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky: {:?}", self.0)
        }
    }

    impl Retryable for Flaky {
        fn disposition(&self) -> RetryDisposition {
            self.0
        }
    }

    fn fast_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn blob_upload_overwrites_atomically_and_remove_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path(), "https://files.example/");

        let url = store
            .upload("exports/batch_1/results.csv", b"first")
            .await
            .expect("first upload");
        assert_eq!(url, "https://files.example/exports/batch_1/results.csv");
        store
            .upload("exports/batch_1/results.csv", b"second")
            .await
            .expect("second upload");

        let path = store.absolute_path("exports/batch_1/results.csv").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        store.remove("exports/batch_1/results.csv").await.expect("remove");
        store.remove("exports/batch_1/results.csv").await.expect("remove again");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn blob_keys_cannot_escape_root() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path(), "http://localhost");
        let err = store.upload("../outside.csv", b"x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn cache_round_trips_and_lists_namespaces() {
        let dir = tempdir().expect("tempdir");
        let cache = LocalCache::new(dir.path());

        cache
            .put("batch_a", "job", &serde_json::json!({"id": "batch_a"}))
            .await
            .expect("put");
        cache
            .put("batch_b", "classifications", &vec![1, 2, 3])
            .await
            .expect("put");

        let value: Option<serde_json::Value> = cache.get("batch_a", "job").await.expect("get");
        assert_eq!(value, Some(serde_json::json!({"id": "batch_a"})));
        let missing: Option<Vec<u8>> = cache.get("batch_a", "nope").await.expect("get");
        assert!(missing.is_none());

        assert_eq!(cache.namespaces().await.unwrap(), vec!["batch_a", "batch_b"]);
        assert_eq!(cache.keys("batch_b").await.unwrap(), vec!["classifications"]);

        cache.remove_namespace("batch_a").await.expect("remove ns");
        assert_eq!(cache.namespaces().await.unwrap(), vec!["batch_b"]);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retry_stops_after_budget_on_transient_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), Flaky> = retry_with_backoff(&fast_policy(2), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Flaky(RetryDisposition::Retryable)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_non_retryable_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), Flaky> = retry_with_backoff(&fast_policy(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Flaky(RetryDisposition::NonRetryable)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<usize, Flaky> = retry_with_backoff(&fast_policy(3), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Flaky(RetryDisposition::Retryable))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
