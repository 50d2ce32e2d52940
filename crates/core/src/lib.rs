pub mod analysis;
pub mod domain;
pub mod ingest;
pub mod llm;
pub mod report;
pub mod storage;
pub mod time;

pub mod config {
    use anyhow::Context;
    use std::time::Duration;

    /// Maximum age of a cached report before it is considered stale.
    pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(15 * 60);

    pub const DEFAULT_REPORT_STORE_KEY: &str = "report_store";
    pub const DEFAULT_GENERATION_QUEUE_KEY: &str = "generation_queue";
    pub const DEFAULT_STORAGE_DIR: &str = "./data";

    const DEFAULT_NEWS_TIMEOUT_SECS: u64 = 15;
    const DEFAULT_INDICATOR_TIMEOUT_SECS: u64 = 30;
    const DEFAULT_NARRATIVE_TIMEOUT_SECS: u64 = 60;
    const DEFAULT_WORKER_POLL_SECS: u64 = 30;
    const DEFAULT_FAILURE_BACKOFF_SECS: u64 = 60;
    const DEFAULT_FAILURE_MAX_BACKOFF_SECS: u64 = 3600;
    const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum StorageBackend {
        File,
        Postgres,
        Memory,
    }

    impl std::str::FromStr for StorageBackend {
        type Err = anyhow::Error;

        fn from_str(s: &str) -> anyhow::Result<Self> {
            match s.trim().to_ascii_lowercase().as_str() {
                "file" => Ok(Self::File),
                "postgres" | "pg" => Ok(Self::Postgres),
                "memory" => Ok(Self::Memory),
                other => anyhow::bail!("unknown STORAGE_BACKEND: {other}"),
            }
        }
    }

    /// Timeouts and retry pacing for the generation pipeline.
    #[derive(Debug, Clone)]
    pub struct PipelineSettings {
        pub freshness_window: Duration,
        pub news_timeout: Duration,
        pub indicator_timeout: Duration,
        pub narrative_timeout: Duration,
        pub poll_interval: Duration,
        pub failure_backoff: Duration,
        pub failure_max_backoff: Duration,
    }

    impl Default for PipelineSettings {
        fn default() -> Self {
            Self {
                freshness_window: DEFAULT_FRESHNESS_WINDOW,
                news_timeout: Duration::from_secs(DEFAULT_NEWS_TIMEOUT_SECS),
                indicator_timeout: Duration::from_secs(DEFAULT_INDICATOR_TIMEOUT_SECS),
                narrative_timeout: Duration::from_secs(DEFAULT_NARRATIVE_TIMEOUT_SECS),
                poll_interval: Duration::from_secs(DEFAULT_WORKER_POLL_SECS),
                failure_backoff: Duration::from_secs(DEFAULT_FAILURE_BACKOFF_SECS),
                failure_max_backoff: Duration::from_secs(DEFAULT_FAILURE_MAX_BACKOFF_SECS),
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub storage_backend: StorageBackend,
        pub storage_dir: String,
        pub report_store_key: String,
        pub generation_queue_key: String,
        pub pipeline: PipelineSettings,
        pub watch_symbols: Vec<String>,
        pub sweep_interval: Duration,
        pub news_api_key: Option<String>,
        pub news_api_base_url: Option<String>,
        pub alpha_vantage_api_key: Option<String>,
        pub anthropic_api_key: Option<String>,
        pub sentry_dsn: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            let storage_backend = match std::env::var("STORAGE_BACKEND") {
                Ok(s) if !s.trim().is_empty() => s.parse()?,
                _ => StorageBackend::File,
            };

            let defaults = PipelineSettings::default();
            let pipeline = PipelineSettings {
                freshness_window: env_secs("REPORT_FRESHNESS_SECS")
                    .unwrap_or(defaults.freshness_window),
                news_timeout: env_secs("NEWS_TIMEOUT_SECS").unwrap_or(defaults.news_timeout),
                indicator_timeout: env_secs("INDICATOR_TIMEOUT_SECS")
                    .unwrap_or(defaults.indicator_timeout),
                narrative_timeout: env_secs("NARRATIVE_TIMEOUT_SECS")
                    .unwrap_or(defaults.narrative_timeout),
                poll_interval: env_secs("WORKER_POLL_SECS").unwrap_or(defaults.poll_interval),
                failure_backoff: env_secs("FAILURE_BACKOFF_SECS")
                    .unwrap_or(defaults.failure_backoff),
                failure_max_backoff: env_secs("FAILURE_MAX_BACKOFF_SECS")
                    .unwrap_or(defaults.failure_max_backoff),
            };

            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                storage_backend,
                storage_dir: non_empty_env("STORAGE_DIR")
                    .unwrap_or_else(|| DEFAULT_STORAGE_DIR.to_string()),
                report_store_key: non_empty_env("REPORT_STORE_KEY")
                    .unwrap_or_else(|| DEFAULT_REPORT_STORE_KEY.to_string()),
                generation_queue_key: non_empty_env("GENERATION_QUEUE_KEY")
                    .unwrap_or_else(|| DEFAULT_GENERATION_QUEUE_KEY.to_string()),
                pipeline,
                watch_symbols: parse_symbol_list(std::env::var("WATCH_SYMBOLS").ok().as_deref()),
                sweep_interval: env_secs("SWEEP_INTERVAL_SECS")
                    .unwrap_or(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS)),
                news_api_key: std::env::var("NEWS_API_KEY").ok(),
                news_api_base_url: std::env::var("NEWS_API_BASE_URL").ok(),
                alpha_vantage_api_key: std::env::var("ALPHA_VANTAGE_API_KEY").ok(),
                anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_anthropic_api_key(&self) -> anyhow::Result<&str> {
            self.anthropic_api_key
                .as_deref()
                .context("ANTHROPIC_API_KEY is required")
        }

        pub fn require_alpha_vantage_api_key(&self) -> anyhow::Result<&str> {
            self.alpha_vantage_api_key
                .as_deref()
                .context("ALPHA_VANTAGE_API_KEY is required")
        }

        pub fn require_news_api_key(&self) -> anyhow::Result<&str> {
            self.news_api_key
                .as_deref()
                .context("NEWS_API_KEY is required")
        }
    }

    /// Splits a comma-separated symbol list. Normalisation happens at the service boundary.
    pub fn parse_symbol_list(raw: Option<&str>) -> Vec<String> {
        raw.unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn env_secs(key: &str) -> Option<Duration> {
        std::env::var(key)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn non_empty_env(key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|s| !s.trim().is_empty())
    }

}
