use crate::config::Settings;
use crate::domain::report::NewsItem;
use crate::llm::error::LlmDiagnosticsError;
use crate::llm::text;
use crate::llm::{NarrativeGenerator, NarrativeInput, Provider};
use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct AnthropicNarrator {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicNarrator {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.require_anthropic_api_key()?.to_string();
        let base_url =
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let max_tokens = std::env::var("ANTHROPIC_MAX_TOKENS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_TOKENS);

        let timeout_secs = std::env::var("ANTHROPIC_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            http,
            api_key,
            base_url,
            model,
            max_tokens,
        })
    }

    async fn create_message(
        &self,
        req: CreateMessageRequest,
    ) -> anyhow::Result<CreateMessageResponse> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key)?);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let res = self
            .http
            .post(url)
            .headers(headers)
            .json(&req)
            .send()
            .await
            .context("Anthropic request failed")?;

        let status = res.status();
        let text = res
            .text()
            .await
            .context("failed to read Anthropic response body")?;
        if !status.is_success() {
            return Err(LlmDiagnosticsError {
                provider: Provider::Anthropic,
                stage: "http",
                detail: "non-success response".to_string(),
                status: Some(status.as_u16()),
                raw_output: Some(text),
            }
            .into());
        }

        serde_json::from_str::<CreateMessageResponse>(&text).map_err(|e| {
            LlmDiagnosticsError {
                provider: Provider::Anthropic,
                stage: "decode",
                detail: e.to_string(),
                status: Some(status.as_u16()),
                raw_output: Some(text),
            }
            .into()
        })
    }

    fn system_prompt() -> String {
        [
            "You are an equity research assistant writing a short advisory for a retail investor.",
            "Base the advisory only on the technical signals, scores and headlines provided.",
            "Structure: one-line outlook, then 3-5 bullet points covering trend, momentum, news and risk.",
            "Finish with a one-sentence suggested stance (accumulate, hold, or reduce) and why.",
            "Plain markdown only. Do not wrap the answer in a code fence. No investment guarantees.",
        ]
        .join("\n")
    }

    fn user_prompt(input: &NarrativeInput) -> String {
        let c = &input.classified;
        let s = &input.score;
        let mut out = String::new();
        let _ = writeln!(out, "Ticker: {}", input.symbol);
        let _ = writeln!(out, "\nTechnical indicators:");
        let _ = writeln!(
            out,
            "- SMA(20) {:.2} vs price {:.2}: {}",
            c.sma.value, c.sma.price, c.sma.signal
        );
        let _ = writeln!(
            out,
            "- EMA(20) {:.2} vs price {:.2}: {}",
            c.ema.value, c.ema.price, c.ema.signal
        );
        let _ = writeln!(out, "- RSI(14) {:.2}: {}", c.rsi.value, c.rsi.signal);
        let _ = writeln!(
            out,
            "- MACD {:.3} vs signal {:.3}: {}",
            c.macd.macd, c.macd.signal_line, c.macd.signal
        );

        let _ = writeln!(out, "\nScores (0-100):");
        for (name, value) in s.dimensions() {
            let _ = writeln!(out, "- {name}: {value:.1}");
        }

        let _ = writeln!(out, "\nRecent news:");
        if input.news.is_empty() {
            let _ = writeln!(out, "- (no recent headlines available)");
        }
        for item in &input.news {
            let _ = writeln!(out, "{}", news_line(item));
        }
        out
    }

    fn response_text(res: &CreateMessageResponse) -> String {
        let mut out = String::new();
        for block in &res.content {
            if let ContentBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }
}

fn news_line(item: &NewsItem) -> String {
    let mut line = format!(
        "- [{}] {} ({})",
        item.published_at.format("%Y-%m-%d"),
        item.title,
        item.source
    );
    if !item.summary.is_empty() {
        line.push_str(": ");
        line.push_str(&item.summary);
    }
    line
}

#[async_trait::async_trait]
impl NarrativeGenerator for AnthropicNarrator {
    async fn generate(&self, input: &NarrativeInput) -> anyhow::Result<String> {
        let make_req = |max_tokens: u32| CreateMessageRequest {
            model: self.model.clone(),
            max_tokens,
            system: Some(Self::system_prompt()),
            messages: vec![Message {
                role: "user",
                content: Self::user_prompt(input),
            }],
        };

        let mut res = self.create_message(make_req(self.max_tokens)).await?;

        // A truncated advisory is worse than a slower one: retry once with a higher ceiling.
        if matches!(res.stop_reason.as_deref(), Some("max_tokens")) {
            let bumped = self.max_tokens.saturating_mul(2).max(2048);
            tracing::warn!(
                symbol = %input.symbol,
                from = self.max_tokens,
                to = bumped,
                "Anthropic stop_reason=max_tokens; retrying once with higher max_tokens"
            );
            res = self.create_message(make_req(bumped)).await?;
        }

        let raw = Self::response_text(&res);
        text::clean_narrative(&raw).map_err(|e| {
            LlmDiagnosticsError {
                provider: Provider::Anthropic,
                stage: "parse",
                detail: e.to_string(),
                status: None,
                raw_output: Some(raw),
            }
            .into()
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct CreateMessageRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateMessageResponse {
    content: Vec<ContentBlock>,

    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Unknown,
}
