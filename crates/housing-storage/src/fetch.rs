//! Bounded, retrying downloads of source datasets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// A dataset file saved on local disk, addressed by its content hash.
#[derive(Debug, Clone)]
pub struct DownloadedSource {
    pub source_id: String,
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct SourceFileStore {
    root: PathBuf,
}

impl SourceFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn path_for(&self, downloaded_on: NaiveDate, source_id: &str, content_hash: &str) -> PathBuf {
        self.root
            .join(downloaded_on.format("%Y-%m-%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.csv"))
    }

    /// Save `bytes` via temp file + rename. Identical content downloaded the
    /// same day resolves to the existing file.
    pub async fn save(
        &self,
        downloaded_on: NaiveDate,
        source_id: &str,
        bytes: &[u8],
    ) -> anyhow::Result<DownloadedSource> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self.path_for(downloaded_on, source_id, &content_hash);
        let existing = |path: PathBuf, reused: bool| DownloadedSource {
            source_id: source_id.to_string(),
            content_hash: content_hash.clone(),
            path,
            byte_size: bytes.len(),
            reused,
        };

        let Some(dir) = path.parent().map(Path::to_path_buf) else {
            anyhow::bail!("download path {} has no parent directory", path.display());
        };
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating download directory {}", dir.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking download path {}", path.display()))?
        {
            return Ok(existing(path, true));
        }

        let partial = dir.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&partial)
            .await
            .with_context(|| format!("opening {}", partial.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", partial.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(existing(path, true));
            }
            return Err(err).with_context(|| {
                format!("renaming {} -> {}", partial.display(), path.display())
            });
        }
        Ok(existing(path, false))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    pub fn for_status(status: StatusCode) -> Self {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }

    pub fn for_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on concurrent downloads across all sources.
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: None,
            global_concurrency: 4,
            per_source_concurrency: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for {source_id} failed: {error}")]
    Request {
        source_id: String,
        #[source]
        error: reqwest::Error,
    },
    #[error("http status {status} for {source_id} ({url})")]
    HttpStatus {
        source_id: String,
        status: u16,
        url: String,
    },
    #[error("download limiter closed")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building http client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn source_limit(&self, source_id: &str) -> Arc<Semaphore> {
        self.per_source
            .lock()
            .await
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let per_source = self.source_limit(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("download", %run_id, source_id, url);
        self.fetch_with_retries(source_id, url).instrument(span).await
    }

    async fn fetch_with_retries(&self, source_id: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0usize;
        loop {
            let disposition = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.bytes().await.map_err(|error| FetchError::Request {
                        source_id: source_id.to_string(),
                        error,
                    })?;
                    info!(bytes = body.len(), attempt, "download complete");
                    return Ok(body.to_vec());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::HttpStatus {
                        source_id: source_id.to_string(),
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (RetryDisposition::for_status(status), err)
                }
                Err(error) => (
                    RetryDisposition::for_error(&error),
                    FetchError::Request {
                        source_id: source_id.to_string(),
                        error,
                    },
                ),
            };

            let (disposition, err) = disposition;
            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(%err, attempt, ?delay, "retrying download");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(
            SourceFileStore::sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn same_day_identical_downloads_are_reused() {
        let dir = tempdir().expect("tempdir");
        let store = SourceFileStore::new(dir.path());
        let day = NaiveDate::from_ymd_opt(2020, 2, 18).expect("date");

        let first = store.save(day, "pts", b"Record ID,Permit Number\n1,P1\n").await.expect("first");
        let second = store.save(day, "pts", b"Record ID,Permit Number\n1,P1\n").await.expect("second");
        let changed = store.save(day, "pts", b"Record ID,Permit Number\n2,P2\n").await.expect("changed");

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.path, second.path);
        assert_ne!(first.path, changed.path);
        assert!(first.path.starts_with(dir.path().join("2020-02-18").join("pts")));
        assert!(first.path.exists());
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(900),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(900));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(900));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(RetryDisposition::for_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(RetryDisposition::for_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(RetryDisposition::for_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }
}
