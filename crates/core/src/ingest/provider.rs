use crate::domain::report::{NewsItem, RawIndicators};
use anyhow::{Context, Result};
use std::future::Future;
use std::time::Duration;

const DEFAULT_RETRIES: u32 = 3;

/// Headline source. Failures degrade to an empty list inside the implementation.
#[async_trait::async_trait]
pub trait NewsProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn fetch_news(&self, symbol: &str) -> Vec<NewsItem>;
}

/// Technical-indicator source. An error here aborts the generation cycle.
#[async_trait::async_trait]
pub trait IndicatorProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn fetch_indicators(&self, symbol: &str) -> Result<RawIndicators>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Reads `{PREFIX}_RETRIES`, falling back to the default attempt count.
    pub fn from_env(prefix: &str) -> Self {
        let retries = std::env::var(format!("{prefix}_RETRIES"))
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES);
        Self {
            retries,
            ..Self::default()
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * (1u32 << (attempt - 1).min(16))
    }

    pub async fn run<T, F, Fut>(&self, label: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(err) => {
                    if attempt >= self.retries.max(1) {
                        return Err(err);
                    }
                    let backoff = self.backoff(attempt);
                    tracing::warn!(label, attempt, ?backoff, error = %err, "provider call failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

pub fn timeout_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

pub fn build_http_client(timeout: Duration, what: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .with_context(|| format!("failed to build {what} http client"))
}

/// Reads a response body as JSON, turning non-2xx statuses into errors carrying the body.
pub async fn read_json(res: reqwest::Response, what: &str) -> Result<serde_json::Value> {
    let status = res.status();
    let text = res
        .text()
        .await
        .with_context(|| format!("failed to read {what} response"))?;
    let raw_json = serde_json::from_str::<serde_json::Value>(&text)
        .with_context(|| format!("{what} response is not valid JSON: {text}"))?;

    if !status.is_success() {
        anyhow::bail!("{what} HTTP {status}: {raw_json}");
    }
    Ok(raw_json)
}
