use crate::config::Settings;
use crate::domain::report::{AverageReading, MacdReading, RawIndicators};
use crate::ingest::provider::{self, IndicatorProvider, RetryPolicy};
use anyhow::{Context, Result};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const AVERAGE_PERIOD: u32 = 20;
const RSI_PERIOD: u32 = 14;

/// Quote plus SMA, EMA, RSI and MACD.
const CALLS_PER_SYMBOL: u32 = 5;

/// SMA(20), EMA(20), RSI(14) and MACD on daily closes, plus the latest quote.
#[derive(Debug, Clone)]
pub struct AlphaVantageIndicators {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    req_delay: Duration,
    retry: RetryPolicy,
}

impl AlphaVantageIndicators {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = settings.require_alpha_vantage_api_key()?.to_string();
        let base_url = std::env::var("ALPHA_VANTAGE_BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let timeout = provider::timeout_from_env(
            "ALPHA_VANTAGE_TIMEOUT_SECS",
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        );
        // Free-tier keys are throttled per minute; spacing calls avoids the "Note" response.
        let req_delay_ms = std::env::var("ALPHA_VANTAGE_REQ_DELAY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let req_delay = Duration::from_millis(req_delay_ms);
        let pacing = pacing_per_symbol(req_delay);
        if pacing >= settings.pipeline.indicator_timeout {
            tracing::warn!(
                ?pacing,
                indicator_timeout = ?settings.pipeline.indicator_timeout,
                "alpha vantage pacing alone exceeds INDICATOR_TIMEOUT_SECS; every cycle will time out"
            );
        }

        Ok(Self {
            http: provider::build_http_client(timeout, "alpha vantage")?,
            base_url,
            api_key,
            req_delay,
            retry: RetryPolicy::from_env("ALPHA_VANTAGE"),
        })
    }

    async fn query(&self, params: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}/query", self.base_url.trim_end_matches('/'));
        let res = self
            .http
            .get(url)
            .query(params)
            .query(&[("apikey", self.api_key.as_str())])
            .send()
            .await
            .context("alpha vantage request failed")?;

        let body = provider::read_json(res, "alpha vantage").await?;
        check_api_error(&body)?;
        Ok(body)
    }

    async fn series(&self, function: &'static str, symbol: &str, extra: &[(&str, &str)]) -> Result<Value> {
        let mut params = vec![
            ("function", function),
            ("symbol", symbol),
            ("interval", "daily"),
            ("series_type", "close"),
        ];
        params.extend_from_slice(extra);
        self.retry.run(function, || self.query(&params)).await
    }

    async fn pace(&self) {
        if !self.req_delay.is_zero() {
            tokio::time::sleep(self.req_delay).await;
        }
    }
}

#[async_trait::async_trait]
impl IndicatorProvider for AlphaVantageIndicators {
    fn provider_name(&self) -> &'static str {
        "alpha_vantage"
    }

    async fn fetch_indicators(&self, symbol: &str) -> Result<RawIndicators> {
        let average_period = AVERAGE_PERIOD.to_string();
        let rsi_period = RSI_PERIOD.to_string();

        let quote_params = [("function", "GLOBAL_QUOTE"), ("symbol", symbol)];
        let quote = self
            .retry
            .run("GLOBAL_QUOTE", || self.query(&quote_params))
            .await?;
        let price = parse_quote_price(&quote)?;

        self.pace().await;
        let sma = self
            .series("SMA", symbol, &[("time_period", average_period.as_str())])
            .await?;
        self.pace().await;
        let ema = self
            .series("EMA", symbol, &[("time_period", average_period.as_str())])
            .await?;
        self.pace().await;
        let rsi = self
            .series("RSI", symbol, &[("time_period", rsi_period.as_str())])
            .await?;
        self.pace().await;
        let macd = self.series("MACD", symbol, &[]).await?;

        let indicators = RawIndicators {
            sma: AverageReading {
                value: latest_field(&sma, "SMA", "SMA")?,
                price,
            },
            ema: AverageReading {
                value: latest_field(&ema, "EMA", "EMA")?,
                price,
            },
            rsi: latest_field(&rsi, "RSI", "RSI")?,
            macd: MacdReading {
                macd: latest_field(&macd, "MACD", "MACD")?,
                signal: latest_field(&macd, "MACD", "MACD_Signal")?,
            },
        };

        tracing::debug!(symbol, ?indicators, "fetched indicators");
        Ok(indicators)
    }
}

/// Time spent sleeping between the calls for one symbol.
pub fn pacing_per_symbol(req_delay: Duration) -> Duration {
    req_delay.saturating_mul(CALLS_PER_SYMBOL - 1)
}

/// Throttling and bad-symbol responses arrive as HTTP 200 with a message body.
pub fn check_api_error(body: &Value) -> Result<()> {
    for key in ["Error Message", "Note", "Information"] {
        if let Some(msg) = body.get(key) {
            anyhow::bail!("alpha vantage {key}: {msg}");
        }
    }
    Ok(())
}

pub fn parse_quote_price(body: &Value) -> Result<f64> {
    let raw = body
        .get("Global Quote")
        .and_then(|q| q.get("05. price"))
        .and_then(Value::as_str)
        .context("alpha vantage quote missing `05. price`")?;
    parse_number(raw)
}

/// Reads `field` from the most recent date in `Technical Analysis: {indicator}`.
pub fn latest_field(body: &Value, indicator: &str, field: &str) -> Result<f64> {
    let series_key = format!("Technical Analysis: {indicator}");
    let series = body
        .get(&series_key)
        .and_then(Value::as_object)
        .with_context(|| format!("alpha vantage response missing `{series_key}`"))?;

    // Dates are ISO formatted, so the lexicographic max is the latest.
    let (date, point) = series
        .iter()
        .max_by(|a, b| a.0.cmp(b.0))
        .with_context(|| format!("`{series_key}` is empty"))?;

    let raw = point
        .get(field)
        .and_then(Value::as_str)
        .with_context(|| format!("`{series_key}` {date} missing `{field}`"))?;
    parse_number(raw).with_context(|| format!("`{series_key}` {date} `{field}`"))
}

fn parse_number(raw: &str) -> Result<f64> {
    let v = raw
        .trim()
        .parse::<f64>()
        .with_context(|| format!("not a number: {raw:?}"))?;
    anyhow::ensure!(v.is_finite(), "non-finite value: {raw:?}");
    Ok(v)
}
