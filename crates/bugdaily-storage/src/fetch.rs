use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_USER_AGENT: &str = "bugdaily-ingest/0.1";

/// Linear backoff: the wait after failed attempt `n` (1-based) is `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after_attempt(&self, attempt: usize) -> Duration {
        self.base_delay
            .saturating_mul(u32::try_from(attempt).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            retry: RetryPolicy {
                max_attempts: config.retry.max_attempts.max(1),
                ..config.retry
            },
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// One GET. Anything but `200 OK` is an error.
    pub async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// GET with retries. Exhausting every attempt yields `None`, which callers read as
    /// "source unavailable this run".
    pub async fn fetch_with_retry(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Option<FetchedResponse> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            for attempt in 1..=self.retry.max_attempts {
                match self.fetch_once(url).await {
                    Ok(resp) => return Some(resp),
                    Err(err) => {
                        warn!(attempt, max_attempts = self.retry.max_attempts, error = %err, "fetch attempt failed");
                        if attempt < self.retry.max_attempts {
                            tokio::time::sleep(self.retry.delay_after_attempt(attempt)).await;
                        }
                    }
                }
            }
            warn!("giving up after retries; treating source as unavailable");
            None
        }
        .instrument(span)
        .await
    }

    /// Retried fetch decoded as UTF-8 text (lossy).
    pub async fn fetch_text(&self, run_id: Uuid, source_id: &str, url: &str) -> Option<String> {
        self.fetch_with_retry(run_id, source_id, url)
            .await
            .map(|resp| String::from_utf8_lossy(&resp.body).into_owned())
    }
}
