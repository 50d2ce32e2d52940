use crate::domain::report::{ClassifiedIndicators, NewsItem, ScoreVector};

pub mod anthropic;
pub mod error;
pub mod text;

/// Substituted whenever the narrative call fails or times out.
pub const FALLBACK_NARRATIVE: &str = "Unable to generate analysis. Please try again later.";

#[derive(Debug, Clone)]
pub struct NarrativeInput {
    pub symbol: String,
    pub news: Vec<NewsItem>,
    pub classified: ClassifiedIndicators,
    pub score: ScoreVector,
}

/// Tags diagnostics with the upstream that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
}

#[async_trait::async_trait]
pub trait NarrativeGenerator: Send + Sync {
    async fn generate(&self, input: &NarrativeInput) -> anyhow::Result<String>;
}
