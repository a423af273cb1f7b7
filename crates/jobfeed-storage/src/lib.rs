//! Feed acquisition: HTTP downloads with backoff, ZIP extraction, and
//! per-worker scratch directories.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub mod acquire;
pub mod workspace;

pub use acquire::{sha256_hex, AcquiredFeed, AcquisitionError, AcquisitionSource, FeedAcquirer};
pub use workspace::{ScratchDir, WorkspaceAllocator};

/// Whether a failed download is worth another attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Exponential backoff, shared by feed downloads and the task retry wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Attempts after the first one.
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
    /// Delay before retry number `attempt_index + 1`: `base * 2^attempt_index`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Downloads in flight across all sources.
    pub max_in_flight: usize,
    pub max_in_flight_per_source: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            max_in_flight: 8,
            max_in_flight_per_source: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedFeed {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    /// Attempts it took, starting at 1.
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server answered {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => is_transient_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(is_transient_status)
                .unwrap_or(false),
        }
    }
}

/// Feed downloader. In-flight downloads are capped overall and per source.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    overall: Arc<Semaphore>,
    per_source_cap: usize,
    source_gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }

        Ok(Self {
            client: builder.build().context("building feed http client")?,
            overall: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_source_cap: config.max_in_flight_per_source.max(1),
            source_gates: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    fn gate_for(&self, source_id: &str) -> Arc<Semaphore> {
        let mut gates = self
            .source_gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            gates
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_cap))),
        )
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<DownloadedFeed, FetchError> {
        let gate = self.gate_for(source_id);
        // Neither semaphore is ever closed; a failed acquire only happens
        // while the runtime shuts down, and then the download just proceeds.
        let _overall = self.overall.acquire().await.ok();
        let _source = gate.acquire().await.ok();

        self.download(url)
            .instrument(info_span!("feed_download", %run_id, source_id, url))
            .await
    }

    async fn download(&self, url: &str) -> Result<DownloadedFeed, FetchError> {
        let mut retries = 0usize;
        loop {
            let err = match self.try_once(url).await {
                Ok(mut feed) => {
                    feed.attempts = retries + 1;
                    tracing::debug!(
                        bytes = feed.body.len(),
                        attempts = feed.attempts,
                        "feed downloaded"
                    );
                    return Ok(feed);
                }
                Err(err) => err,
            };
            if !err.is_transient() || retries >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(retries);
            tracing::warn!(
                error = %err,
                retries,
                delay_ms = delay.as_millis() as u64,
                "feed download failed; retrying"
            );
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }

    async fn try_once(&self, url: &str) -> Result<DownloadedFeed, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(DownloadedFeed {
            status,
            final_url,
            body,
            attempts: 1,
        })
    }
}
