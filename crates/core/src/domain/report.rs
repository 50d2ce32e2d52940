use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on headlines kept per report.
pub const MAX_NEWS_ITEMS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub source: String,
    pub url: String,
    pub summary: String,
}

/// A moving-average reading together with the close it was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AverageReading {
    pub value: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdReading {
    pub macd: f64,
    pub signal: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawIndicators {
    pub sma: AverageReading,
    pub ema: AverageReading,
    pub rsi: f64,
    pub macd: MacdReading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendSignal {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RsiSignal {
    Overbought,
    Oversold,
    Neutral,
}

impl std::fmt::Display for TrendSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrendSignal::Bullish => write!(f, "bullish"),
            TrendSignal::Bearish => write!(f, "bearish"),
            TrendSignal::Neutral => write!(f, "neutral"),
        }
    }
}

impl std::fmt::Display for RsiSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RsiSignal::Overbought => write!(f, "overbought"),
            RsiSignal::Oversold => write!(f, "oversold"),
            RsiSignal::Neutral => write!(f, "neutral"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedAverage {
    pub value: f64,
    pub price: f64,
    pub signal: TrendSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedRsi {
    pub value: f64,
    pub signal: RsiSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedMacd {
    pub macd: f64,
    pub signal_line: f64,
    pub signal: TrendSignal,
}

/// Signal labels for each indicator, carrying the readings they were derived from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedIndicators {
    pub sma: ClassifiedAverage,
    pub ema: ClassifiedAverage,
    pub rsi: ClassifiedRsi,
    pub macd: ClassifiedMacd,
}

/// Five 0..=100 dimensions. `volatility` is inverted: higher means more stable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreVector {
    pub trend_strength: f64,
    pub momentum_strength: f64,
    pub macd_strength: f64,
    pub price_strength: f64,
    pub volatility: f64,
}

impl ScoreVector {
    pub fn dimensions(&self) -> [(&'static str, f64); 5] {
        [
            ("trend_strength", self.trend_strength),
            ("momentum_strength", self.momentum_strength),
            ("macd_strength", self.macd_strength),
            ("price_strength", self.price_strength),
            ("volatility", self.volatility),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedReport {
    pub symbol: String,
    pub news: Vec<NewsItem>,
    pub classified: ClassifiedIndicators,
    pub score: ScoreVector,
    pub narrative: String,
    /// True when `narrative` is the fallback text rather than generated output.
    #[serde(default)]
    pub narrative_degraded: bool,
    pub generated_at: DateTime<Utc>,
}

impl CachedReport {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.generated_at
    }
}

/// Last failed generation cycle for a symbol; cleared by the next successful one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationFailure {
    pub symbol: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    pub retry_after: DateTime<Utc>,
}

impl GenerationFailure {
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        now < self.retry_after
    }
}
