//! Page fetching for the listing sources.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

/// Exponential delay between retries of one page, capped at `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub retries: u32,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Wait before retry number `retry` (zero based).
    pub fn delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on requests in flight across all stores.
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    Status { status: u16, url: String },
}

impl FetchError {
    /// Throttling, server errors and connection trouble are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(status)
            }
        }
    }
}

/// Shared HTTP client for the listing sources. Retries transient failures
/// of a single page; it never retries a whole crawl.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            backoff: config.backoff,
        })
    }

    /// Fetch one listing page of `store_slug` as text.
    pub async fn fetch_text(&self, store_slug: &str, url: &str) -> Result<String, FetchError> {
        let span = info_span!("page_fetch", store = store_slug, url);
        async {
            // The semaphore is owned by the fetcher and never closed.
            let _permit = self.in_flight.acquire().await.ok();
            let mut retry = 0;
            loop {
                match self.fetch_once(url).await {
                    Ok(body) => return Ok(body),
                    Err(err) if err.is_transient() && retry < self.backoff.retries => {
                        let wait = self.backoff.delay(retry);
                        debug!(error = %err, retry, ?wait, "page fetch failed; retrying");
                        tokio::time::sleep(wait).await;
                        retry += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_once(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(ACCEPT, "text/html,application/xhtml+xml")
            .header(ACCEPT_LANGUAGE, "hu-HU,hu;q=0.9,en;q=0.8")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.text().await?)
    }
}

/// Resolve `href` against `base`. Already-absolute links are returned as-is.
pub fn absolute_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    if let Ok(url) = Url::parse(href) {
        return Some(url.to_string());
    }
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}
