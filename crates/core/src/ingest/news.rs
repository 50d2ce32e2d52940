use crate::config::Settings;
use crate::domain::report::{NewsItem, MAX_NEWS_ITEMS};
use crate::ingest::provider::{self, NewsProvider, RetryPolicy};
use crate::ingest::types::{NewsArticle, NewsSearchResponse};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://newsapi.org";
const DEFAULT_PATH: &str = "/v2/everything";
const DEFAULT_TIMEOUT_SECS: u64 = 15;
const SUMMARY_MAX_CHARS: usize = 280;

/// News search over a NewsAPI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct NewsApiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl NewsApiProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = settings.require_news_api_key()?.to_string();
        let base_url = settings
            .news_api_base_url
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let timeout = provider::timeout_from_env(
            "NEWS_HTTP_TIMEOUT_SECS",
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        );

        Ok(Self {
            http: provider::build_http_client(timeout, "news")?,
            base_url,
            api_key,
            retry: RetryPolicy::from_env("NEWS"),
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key)?);
        Ok(headers)
    }

    async fn fetch_once(&self, symbol: &str) -> Result<Vec<NewsItem>> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), DEFAULT_PATH);
        let page_size = MAX_NEWS_ITEMS.to_string();
        let res = self
            .http
            .get(url)
            .headers(self.headers()?)
            .query(&[
                ("q", symbol),
                ("sortBy", "publishedAt"),
                ("language", "en"),
                ("pageSize", page_size.as_str()),
            ])
            .send()
            .await
            .context("news request failed")?;

        let raw_json = provider::read_json(res, "news").await?;
        let parsed = serde_json::from_value::<NewsSearchResponse>(raw_json)
            .context("failed to parse news response")?;
        into_news_items(parsed)
    }
}

#[async_trait::async_trait]
impl NewsProvider for NewsApiProvider {
    fn provider_name(&self) -> &'static str {
        "newsapi"
    }

    async fn fetch_news(&self, symbol: &str) -> Vec<NewsItem> {
        match self.retry.run("news", || self.fetch_once(symbol)).await {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(symbol, error = %err, "news fetch failed; continuing without news");
                Vec::new()
            }
        }
    }
}

/// Newest first, at most [`MAX_NEWS_ITEMS`]; articles without a title or link are skipped.
pub fn into_news_items(resp: NewsSearchResponse) -> Result<Vec<NewsItem>> {
    anyhow::ensure!(
        resp.status == "ok",
        "news provider returned status={} code={} message={}",
        resp.status,
        resp.code.as_deref().unwrap_or("-"),
        resp.message.as_deref().unwrap_or("-")
    );

    let mut items: Vec<NewsItem> = resp.articles.into_iter().filter_map(into_item).collect();
    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    items.truncate(MAX_NEWS_ITEMS);
    Ok(items)
}

fn into_item(article: NewsArticle) -> Option<NewsItem> {
    let title = article.title?.trim().to_string();
    let url = article.url?.trim().to_string();
    if title.is_empty() || url.is_empty() || title == "[Removed]" {
        return None;
    }

    let published_at = article
        .published_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))?;

    let summary = article
        .description
        .map(|s| truncate_chars(s.trim(), SUMMARY_MAX_CHARS))
        .unwrap_or_default();

    Some(NewsItem {
        title,
        published_at,
        source: article
            .source
            .name
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
        url,
        summary,
    })
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}
