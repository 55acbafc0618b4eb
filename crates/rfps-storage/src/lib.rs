//! Output artifact storage + authenticated HTTP session for the search API.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use rfps_core::{parse_opportunities, Opportunity};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rfps-storage";

#[derive(Debug, Clone)]
pub struct WrittenArtifact {
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub records: usize,
}

/// Writes one JSON artifact per scrape run under a fixed output directory.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    root: PathBuf,
}

impl OutputWriter {
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

    /// `{start date}__{start epoch secs}__{end epoch secs}.json`
    pub fn artifact_file_name(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> String {
        format!(
            "{}__{}__{}.json",
            start_time.format("%Y-%m-%d"),
            start_time.timestamp(),
            end_time.timestamp()
        )
    }

    pub fn artifact_path(&self, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> PathBuf {
        self.root.join(Self::artifact_file_name(start_time, end_time))
    }

    /// Serialize the full opportunity list and replace any artifact for the same
    /// timestamps via temp-file + rename.
    pub async fn write_scraping_outputs(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        opportunities: &[Opportunity],
    ) -> anyhow::Result<WrittenArtifact> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating output directory {}", self.root.display()))?;

        let bytes = serde_json::to_vec_pretty(opportunities).context("serializing opportunities")?;
        let content_hash = Self::sha256_hex(&bytes);
        let file_name = Self::artifact_file_name(start_time, end_time);
        let absolute_path = self.root.join(&file_name);
        let temp_path = self.root.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        if let Err(err) = write_new_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp output {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        info!(
            path = %absolute_path.display(),
            records = opportunities.len(),
            bytes = bytes.len(),
            "wrote scrape output"
        );

        Ok(WrittenArtifact {
            file_name,
            absolute_path,
            content_hash,
            byte_size: bytes.len(),
            records: opportunities.len(),
        })
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening temp output file {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp output file {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp output file {}", path.display()))?;
    Ok(())
}

/// Re-read an artifact produced by [`OutputWriter::write_scraping_outputs`].
pub async fn read_scraping_output(path: impl AsRef<Path>) -> anyhow::Result<Vec<Opportunity>> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_opportunities(&bytes).with_context(|| format!("parsing {}", path.display()))
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
    if err.is_timeout() || err.is_connect() {
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    /// Sent on every request, e.g. the `api_key` credential.
    pub default_query: Vec<(String, String)>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl HttpClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_query: Vec::new(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl fmt::Debug for HttpClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientConfig")
            .field("base_url", &self.base_url)
            .field("default_query", &query_keys(&self.default_query))
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("max_in_flight", &self.max_in_flight)
            .field("backoff", &self.backoff)
            .finish()
    }
}

fn query_keys(query: &[(String, String)]) -> Vec<&str> {
    query.iter().map(|(k, _)| k.as_str()).collect()
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
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
}

/// Query parameters that never leave the process in logs or errors.
const REDACTED_PARAMS: &[&str] = &["api_key"];

pub fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !REDACTED_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    redacted.set_query(None);
    if !kept.is_empty() {
        redacted.query_pairs_mut().extend_pairs(kept);
    }
    redacted.to_string()
}

/// Authenticated session bound to one API base URL. Dropping it releases the
/// underlying connection pool.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    default_query: Vec<(String, String)>,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("base_url", &self.base_url)
            .field("default_query", &query_keys(&self.default_query))
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
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
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_query: config.default_query,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `{base_url}{path}` with the default query plus `query`, retrying
    /// transient failures per the backoff policy.
    pub async fn get(&self, path: &str, query: &[(String, String)]) -> Result<FetchedResponse, FetchError> {
        let _permit = self.in_flight.acquire().await.expect("semaphore not closed");

        let url = format!("{}{}", self.base_url, path);
        let span = info_span!("http_fetch", path);
        self.get_with_retries(&url, query).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str, query: &[(String, String)]) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let resp_result = self
                .client
                .get(url)
                .query(&self.default_query)
                .query(query)
                .send()
                .await;
            let can_retry = attempt < self.backoff.max_retries;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = redact_url(resp.url());
                    debug!(status = status.as_u16(), url = %final_url, attempt, "response received");

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|err| FetchError::Request(err.without_url()))?
                            .to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "retryable status, backing off");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err.without_url(), attempt, ?delay, "request failed, backing off");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err.without_url()));
                }
            }
        }
    }
}
