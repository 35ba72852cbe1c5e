//! Normalized-batch cache + HTTP fetch utilities for the CORDIS harvester.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cordis-storage";

const BATCH_FILE: &str = "normalized.json";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub records: usize,
    pub sha256: String,
    pub bytes: usize,
}

#[derive(Debug, Clone)]
pub struct StoredBatch {
    pub manifest: CacheManifest,
    pub batch_dir: PathBuf,
    pub batch_path: PathBuf,
}

/// On-disk cache of normalized record batches, one directory per run.
#[derive(Debug, Clone)]
pub struct BatchCache {
    root: PathBuf,
}

impl BatchCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn batch_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Persist a normalized batch and its manifest for later upload retries.
    pub async fn store_batch<T: Serialize>(
        &self,
        run_id: Uuid,
        created_at: DateTime<Utc>,
        records: &[T],
    ) -> anyhow::Result<StoredBatch> {
        let batch_dir = self.batch_dir(run_id);
        fs::create_dir_all(&batch_dir)
            .await
            .with_context(|| format!("creating cache directory {}", batch_dir.display()))?;

        let bytes = serde_json::to_vec(records).context("serializing normalized batch")?;
        let manifest = CacheManifest {
            run_id,
            created_at,
            records: records.len(),
            sha256: Self::sha256_hex(&bytes),
            bytes: bytes.len(),
        };

        let batch_path = batch_dir.join(BATCH_FILE);
        write_atomic(&batch_path, &bytes).await?;
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).context("serializing cache manifest")?;
        write_atomic(&batch_dir.join(MANIFEST_FILE), &manifest_bytes).await?;

        Ok(StoredBatch {
            manifest,
            batch_dir,
            batch_path,
        })
    }

    /// Load a cached batch, refusing it when the content hash no longer matches.
    pub async fn load_batch<T: DeserializeOwned>(
        &self,
        batch_dir: &Path,
    ) -> anyhow::Result<(CacheManifest, Vec<T>)> {
        let manifest = read_manifest(batch_dir).await?;
        let batch_path = batch_dir.join(BATCH_FILE);
        let bytes = fs::read(&batch_path)
            .await
            .with_context(|| format!("reading {}", batch_path.display()))?;
        let actual = Self::sha256_hex(&bytes);
        if actual != manifest.sha256 {
            bail!(
                "cached batch {} is corrupt: expected sha256 {}, found {}",
                batch_path.display(),
                manifest.sha256,
                actual
            );
        }
        let records = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", batch_path.display()))?;
        Ok((manifest, records))
    }

    /// Most recently created batch directory, if any run has been cached.
    pub async fn latest_batch(&self) -> anyhow::Result<Option<PathBuf>> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking cache root {}", self.root.display()))?
        {
            return Ok(None);
        }

        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading {}", self.root.display()))?;
        let mut latest: Option<(DateTime<Utc>, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let path = entry.path();
            if !path.join(MANIFEST_FILE).exists() {
                continue;
            }
            let manifest = match read_manifest(&path).await {
                Ok(m) => m,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable cache manifest");
                    continue;
                }
            };
            let newer = match &latest {
                Some((at, seen)) => (manifest.created_at, &path) > (*at, seen),
                None => true,
            };
            if newer {
                latest = Some((manifest.created_at, path));
            }
        }
        Ok(latest.map(|(_, path)| path))
    }
}

async fn read_manifest(batch_dir: &Path) -> anyhow::Result<CacheManifest> {
    let path = batch_dir.join(MANIFEST_FILE);
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Write via a temp file in the same directory, then rename into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp cache file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
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
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt + 1`: the base delay doubled per
    /// prior attempt, never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(2u32.saturating_pow(doublings))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Shared client so other HTTP collaborators reuse one connection pool.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_label: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_label, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let (disposition, err) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    debug!(bytes = body.len(), attempt, "archive downloaded");
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    (
                        classify_status(status),
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        },
                    )
                }
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };

            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            attempt += 1;
            warn!(
                error = %err,
                attempt,
                max_retries = self.backoff.max_retries,
                delay_ms = delay.as_millis() as u64,
                "download failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
