use crate::analysis::{classify, normalize};
use crate::config::{PipelineSettings, Settings};
use crate::domain::report::{CachedReport, NewsItem, RawIndicators, MAX_NEWS_ITEMS};
use crate::ingest::alpha_vantage::AlphaVantageIndicators;
use crate::ingest::news::NewsApiProvider;
use crate::ingest::{IndicatorProvider, NewsProvider};
use crate::llm::anthropic::AnthropicNarrator;
use crate::llm::{NarrativeGenerator, NarrativeInput, FALLBACK_NARRATIVE};
use crate::report::{GenerationQueue, ReportStore};
use crate::time::Clock;
use anyhow::Context;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::Instrument;

/// External services a generation cycle depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub news: Arc<dyn NewsProvider>,
    pub indicators: Arc<dyn IndicatorProvider>,
    pub narrator: Arc<dyn NarrativeGenerator>,
}

impl Collaborators {
    /// NewsAPI, Alpha Vantage and Anthropic clients configured from the environment.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            news: Arc::new(NewsApiProvider::from_settings(settings)?),
            indicators: Arc::new(AlphaVantageIndicators::from_settings(settings)?),
            narrator: Arc::new(AnthropicNarrator::from_settings(settings)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Fetching,
    Classifying,
    Persisting,
    Error,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Fetching => "fetching",
            WorkerState::Classifying => "classifying",
            WorkerState::Persisting => "persisting",
            WorkerState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Queue was empty.
    Idle,
    /// Another cycle was already in flight.
    Busy,
    Generated {
        symbol: String,
        news_count: usize,
        narrative_degraded: bool,
    },
    Failed {
        symbol: String,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub generated: usize,
    pub failed: usize,
}

/// Drains the generation queue one symbol at a time.
pub struct ReportWorker {
    store: Arc<ReportStore>,
    queue: Arc<GenerationQueue>,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
    in_flight: AtomicBool,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ReportWorker {
    pub fn new(
        store: Arc<ReportStore>,
        queue: Arc<GenerationQueue>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            queue,
            collaborators,
            clock,
            settings,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Processes the symbol at the front of the queue, if any.
    ///
    /// Collaborator failures never escape: news degrades to an empty list, the narrative to
    /// [`FALLBACK_NARRATIVE`], and an indicator failure is recorded against the symbol. In
    /// every case the front entry is dequeued so one bad symbol cannot stall the queue.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return CycleOutcome::Busy;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let Some(symbol) = self.queue.peek_front().await else {
            return CycleOutcome::Idle;
        };

        let cycle_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("report_cycle", %symbol, %cycle_id);
        self.generate(symbol).instrument(span).await
    }

    /// Runs cycles until the queue is empty.
    pub async fn drain(&self) -> DrainSummary {
        let mut summary = DrainSummary::default();
        loop {
            match self.run_cycle().await {
                CycleOutcome::Idle | CycleOutcome::Busy => return summary,
                CycleOutcome::Generated { .. } => summary.generated += 1,
                CycleOutcome::Failed { .. } => summary.failed += 1,
            }
        }
    }

    /// Long-running loop: drain, then sleep until an enqueue, the poll interval, or shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(poll_interval = ?self.settings.poll_interval, "report worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let summary = self.drain().await;
            if summary != DrainSummary::default() {
                tracing::info!(
                    generated = summary.generated,
                    failed = summary.failed,
                    "queue drained"
                );
            }

            tokio::select! {
                _ = self.queue.wait_for_enqueue() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("report worker stopped");
    }

    async fn generate(&self, symbol: String) -> CycleOutcome {
        let t0 = Instant::now();
        transition(WorkerState::Fetching);
        let (news, indicators) = tokio::join!(
            self.fetch_news(&symbol),
            self.fetch_indicators(&symbol)
        );

        let indicators = match indicators {
            Ok(indicators) => indicators,
            Err(err) => return self.fail(symbol, err).await,
        };

        transition(WorkerState::Classifying);
        let classified = classify(&indicators);
        let score = normalize(&classified);
        let input = NarrativeInput {
            symbol: symbol.clone(),
            news,
            classified,
            score,
        };
        let (narrative, narrative_degraded) = self.narrate(&input).await;

        transition(WorkerState::Persisting);
        let now = self.clock.now();
        let generated_at = match self.store.get(&symbol).await {
            Some(previous) if previous.generated_at > now => previous.generated_at,
            _ => now,
        };
        let news_count = input.news.len();
        let report = CachedReport {
            symbol: symbol.clone(),
            news: input.news,
            classified,
            score,
            narrative,
            narrative_degraded,
            generated_at,
        };

        if let Err(err) = self.store.put(&symbol, report).await {
            tracing::error!(error = %format!("{err:#}"), "failed to persist report");
        }
        self.advance_queue().await;
        transition(WorkerState::Idle);

        tracing::info!(
            news_count,
            narrative_degraded,
            elapsed_ms = t0.elapsed().as_millis(),
            "report generated"
        );
        CycleOutcome::Generated {
            symbol,
            news_count,
            narrative_degraded,
        }
    }

    async fn fail(&self, symbol: String, err: anyhow::Error) -> CycleOutcome {
        transition(WorkerState::Error);
        let error = format!("{err:#}");
        let now = self.clock.now();
        match self
            .store
            .record_failure(
                &symbol,
                &error,
                now,
                self.settings.failure_backoff,
                self.settings.failure_max_backoff,
            )
            .await
        {
            Ok(failure) => tracing::error!(
                error = %error,
                attempts = failure.attempts,
                retry_after = %failure.retry_after,
                "indicator fetch failed; symbol dequeued"
            ),
            Err(persist_err) => tracing::error!(
                error = %error,
                persist_error = %format!("{persist_err:#}"),
                "indicator fetch failed and the failure could not be persisted"
            ),
        }
        self.advance_queue().await;
        transition(WorkerState::Idle);
        CycleOutcome::Failed { symbol, error }
    }

    async fn advance_queue(&self) {
        if let Err(err) = self.queue.dequeue_front().await {
            tracing::error!(error = %format!("{err:#}"), "failed to persist queue after dequeue");
        }
    }

    async fn fetch_news(&self, symbol: &str) -> Vec<NewsItem> {
        let timeout = self.settings.news_timeout;
        match tokio::time::timeout(timeout, self.collaborators.news.fetch_news(symbol)).await {
            Ok(mut items) => {
                items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
                items.truncate(MAX_NEWS_ITEMS);
                items
            }
            Err(_) => {
                tracing::warn!(?timeout, "news fetch timed out; continuing without news");
                Vec::new()
            }
        }
    }

    async fn fetch_indicators(&self, symbol: &str) -> anyhow::Result<RawIndicators> {
        let timeout = self.settings.indicator_timeout;
        let provider = self.collaborators.indicators.provider_name();
        let indicators =
            tokio::time::timeout(timeout, self.collaborators.indicators.fetch_indicators(symbol))
                .await
                .map_err(|_| anyhow::anyhow!("indicator fetch timed out after {timeout:?}"))?
                .with_context(|| format!("{provider} indicator fetch failed"))?;
        validate_indicators(&indicators)?;
        Ok(indicators)
    }

    async fn narrate(&self, input: &NarrativeInput) -> (String, bool) {
        let timeout = self.settings.narrative_timeout;
        match tokio::time::timeout(timeout, self.collaborators.narrator.generate(input)).await {
            Ok(Ok(text)) => (text, false),
            Ok(Err(err)) => {
                tracing::warn!(error = %format!("{err:#}"), "narrative generation failed; using fallback");
                (FALLBACK_NARRATIVE.to_string(), true)
            }
            Err(_) => {
                tracing::warn!(?timeout, "narrative generation timed out; using fallback");
                (FALLBACK_NARRATIVE.to_string(), true)
            }
        }
    }
}

fn transition(state: WorkerState) {
    tracing::debug!(%state, "worker state");
}

fn validate_indicators(raw: &RawIndicators) -> anyhow::Result<()> {
    let readings = [
        ("sma", raw.sma.value),
        ("sma_price", raw.sma.price),
        ("ema", raw.ema.value),
        ("ema_price", raw.ema.price),
        ("rsi", raw.rsi),
        ("macd", raw.macd.macd),
        ("macd_signal", raw.macd.signal),
    ];
    for (name, value) in readings {
        anyhow::ensure!(value.is_finite(), "indicator {name} is not finite ({value})");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::report::{AverageReading, MacdReading};
    use crate::storage::{DurableKeyValueStore, MemoryKvStore};
    use crate::time::ManualClock;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()
    }

    fn bullish() -> RawIndicators {
        RawIndicators {
            sma: AverageReading { value: 180.23, price: 186.35 },
            ema: AverageReading { value: 182.12, price: 186.35 },
            rsi: 68.5,
            macd: MacdReading { macd: 1.45, signal: 1.0 },
        }
    }

    fn headline(day: u32) -> NewsItem {
        NewsItem {
            title: format!("headline {day}"),
            published_at: Utc.with_ymd_and_hms(2026, 2, day, 12, 0, 0).unwrap(),
            source: "Wire".to_string(),
            url: format!("https://example.com/{day}"),
            summary: String::new(),
        }
    }

    struct FakeNews(Vec<NewsItem>);

    #[async_trait::async_trait]
    impl NewsProvider for FakeNews {
        fn provider_name(&self) -> &'static str {
            "fake"
        }

        async fn fetch_news(&self, _symbol: &str) -> Vec<NewsItem> {
            self.0.clone()
        }
    }

    struct SlowNews;

    #[async_trait::async_trait]
    impl NewsProvider for SlowNews {
        fn provider_name(&self) -> &'static str {
            "slow"
        }

        async fn fetch_news(&self, _symbol: &str) -> Vec<NewsItem> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            vec![headline(1)]
        }
    }

    #[derive(Default)]
    struct FakeIndicators {
        failing: HashSet<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl IndicatorProvider for FakeIndicators {
        fn provider_name(&self) -> &'static str {
            "fake"
        }

        async fn fetch_indicators(&self, symbol: &str) -> anyhow::Result<RawIndicators> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(symbol) {
                anyhow::bail!("upstream 503 for {symbol}");
            }
            Ok(bullish())
        }
    }

    /// Blocks inside the indicator call until a permit is released.
    struct GatedIndicators(Arc<Semaphore>);

    #[async_trait::async_trait]
    impl IndicatorProvider for GatedIndicators {
        fn provider_name(&self) -> &'static str {
            "gated"
        }

        async fn fetch_indicators(&self, _symbol: &str) -> anyhow::Result<RawIndicators> {
            let _permit = self.0.acquire().await?;
            Ok(bullish())
        }
    }

    struct SlowIndicators;

    #[async_trait::async_trait]
    impl IndicatorProvider for SlowIndicators {
        fn provider_name(&self) -> &'static str {
            "slow"
        }

        async fn fetch_indicators(&self, _symbol: &str) -> anyhow::Result<RawIndicators> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(bullish())
        }
    }

    struct SlowNarrator;

    #[async_trait::async_trait]
    impl NarrativeGenerator for SlowNarrator {
        async fn generate(&self, _input: &NarrativeInput) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("too late".to_string())
        }
    }

    struct FakeNarrator {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl NarrativeGenerator for FakeNarrator {
        async fn generate(&self, input: &NarrativeInput) -> anyhow::Result<String> {
            anyhow::ensure!(!self.fail, "model overloaded");
            Ok(format!("{} looks constructive.", input.symbol))
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            freshness_window: Duration::from_secs(5),
            news_timeout: Duration::from_millis(50),
            indicator_timeout: Duration::from_secs(5),
            narrative_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            failure_backoff: Duration::from_secs(60),
            failure_max_backoff: Duration::from_secs(600),
        }
    }

    struct Harness {
        store: Arc<ReportStore>,
        queue: Arc<GenerationQueue>,
        clock: Arc<ManualClock>,
        worker: Arc<ReportWorker>,
    }

    async fn harness(collaborators: Collaborators) -> Harness {
        harness_with(collaborators, settings()).await
    }

    async fn harness_with(collaborators: Collaborators, settings: PipelineSettings) -> Harness {
        let kv: Arc<dyn DurableKeyValueStore> = Arc::new(MemoryKvStore::default());
        let store = Arc::new(ReportStore::init(kv.clone(), "report_store").await.unwrap());
        let queue = Arc::new(GenerationQueue::init(kv, "generation_queue").await.unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let worker = Arc::new(ReportWorker::new(
            store.clone(),
            queue.clone(),
            collaborators,
            clock.clone(),
            settings,
        ));
        Harness {
            store,
            queue,
            clock,
            worker,
        }
    }

    fn collaborators(
        news: Vec<NewsItem>,
        indicators: FakeIndicators,
        narrator_fails: bool,
    ) -> Collaborators {
        Collaborators {
            news: Arc::new(FakeNews(news)),
            indicators: Arc::new(indicators),
            narrator: Arc::new(FakeNarrator {
                fail: narrator_fails,
            }),
        }
    }

    #[tokio::test]
    async fn idle_when_queue_empty() {
        let h = harness(collaborators(vec![], FakeIndicators::default(), false)).await;
        assert_eq!(h.worker.run_cycle().await, CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn generates_report_and_dequeues() {
        let news: Vec<_> = (1..=7).map(headline).collect();
        let h = harness(collaborators(news, FakeIndicators::default(), false)).await;
        h.queue.enqueue("AAPL").await.unwrap();

        let outcome = h.worker.run_cycle().await;
        assert_eq!(
            outcome,
            CycleOutcome::Generated {
                symbol: "AAPL".to_string(),
                news_count: MAX_NEWS_ITEMS,
                narrative_degraded: false,
            }
        );

        let report = h.store.get("AAPL").await.unwrap();
        assert_eq!(report.generated_at, t0());
        assert_eq!(report.narrative, "AAPL looks constructive.");
        assert_eq!(report.news.len(), MAX_NEWS_ITEMS);
        assert_eq!(report.news[0].title, "headline 7");
        assert_eq!(report.score.trend_strength, 100.0);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn narrative_failure_uses_fallback() {
        let h = harness(collaborators(vec![], FakeIndicators::default(), true)).await;
        h.queue.enqueue("MSFT").await.unwrap();

        h.worker.run_cycle().await;
        let report = h.store.get("MSFT").await.unwrap();
        assert_eq!(report.narrative, FALLBACK_NARRATIVE);
        assert!(report.narrative_degraded);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn slow_news_degrades_to_empty() {
        let h = harness(Collaborators {
            news: Arc::new(SlowNews),
            indicators: Arc::new(FakeIndicators::default()),
            narrator: Arc::new(FakeNarrator { fail: false }),
        })
        .await;
        h.queue.enqueue("AAPL").await.unwrap();

        h.worker.run_cycle().await;
        assert!(h.store.get("AAPL").await.unwrap().news.is_empty());
    }

    #[tokio::test]
    async fn slow_indicators_time_out_into_a_recorded_failure() {
        let h = harness_with(
            Collaborators {
                news: Arc::new(FakeNews(vec![])),
                indicators: Arc::new(SlowIndicators),
                narrator: Arc::new(FakeNarrator { fail: false }),
            },
            PipelineSettings {
                indicator_timeout: Duration::from_millis(50),
                ..settings()
            },
        )
        .await;
        h.queue.enqueue("AAPL").await.unwrap();
        h.queue.enqueue("MSFT").await.unwrap();

        let outcome = h.worker.run_cycle().await;
        let CycleOutcome::Failed { symbol, error } = outcome else {
            panic!("expected a failed cycle, got {outcome:?}");
        };
        assert_eq!(symbol, "AAPL");
        assert!(error.contains("timed out"), "{error}");

        assert_eq!(h.queue.snapshot().await, vec!["MSFT"]);
        assert!(h.store.get("AAPL").await.is_none());
        let failure = h.store.failure("AAPL").await.unwrap();
        assert_eq!(failure.attempts, 1);
        assert!(failure.error.contains("timed out"));
    }

    #[tokio::test]
    async fn slow_narrative_times_out_into_fallback() {
        let h = harness_with(
            Collaborators {
                news: Arc::new(FakeNews(vec![])),
                indicators: Arc::new(FakeIndicators::default()),
                narrator: Arc::new(SlowNarrator),
            },
            PipelineSettings {
                narrative_timeout: Duration::from_millis(50),
                ..settings()
            },
        )
        .await;
        h.queue.enqueue("NVDA").await.unwrap();

        let outcome = h.worker.run_cycle().await;
        assert_eq!(
            outcome,
            CycleOutcome::Generated {
                symbol: "NVDA".to_string(),
                news_count: 0,
                narrative_degraded: true,
            }
        );
        let report = h.store.get("NVDA").await.unwrap();
        assert_eq!(report.narrative, FALLBACK_NARRATIVE);
        assert!(report.narrative_degraded);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn indicator_failure_dequeues_and_records() {
        let indicators = FakeIndicators {
            failing: HashSet::from(["TSLA"]),
            ..Default::default()
        };
        let h = harness(collaborators(vec![], indicators, false)).await;
        h.queue.enqueue("TSLA").await.unwrap();
        h.queue.enqueue("AAPL").await.unwrap();

        let outcome = h.worker.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Failed { ref symbol, .. } if symbol == "TSLA"));
        assert_eq!(h.queue.snapshot().await, vec!["AAPL"]);
        assert!(h.store.get("TSLA").await.is_none());

        let failure = h.store.failure("TSLA").await.unwrap();
        assert_eq!(failure.attempts, 1);
        assert!(failure.error.contains("upstream 503"));

        assert!(matches!(h.worker.run_cycle().await, CycleOutcome::Generated { .. }));
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn generated_at_never_moves_backwards() {
        let h = harness(collaborators(vec![], FakeIndicators::default(), false)).await;
        h.queue.enqueue("AAPL").await.unwrap();
        h.worker.run_cycle().await;

        h.clock.set(t0() - chrono::Duration::seconds(30));
        h.queue.enqueue("AAPL").await.unwrap();
        h.worker.run_cycle().await;

        assert_eq!(h.store.get("AAPL").await.unwrap().generated_at, t0());
    }

    #[tokio::test]
    async fn second_cycle_is_rejected_while_one_is_in_flight() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(Collaborators {
            news: Arc::new(FakeNews(vec![])),
            indicators: Arc::new(GatedIndicators(gate.clone())),
            narrator: Arc::new(FakeNarrator { fail: false }),
        })
        .await;
        h.queue.enqueue("AAPL").await.unwrap();

        let first = {
            let worker = h.worker.clone();
            tokio::spawn(async move { worker.run_cycle().await })
        };
        while !h.worker.is_busy() {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.worker.run_cycle().await, CycleOutcome::Busy);
        gate.add_permits(1);
        assert!(matches!(first.await.unwrap(), CycleOutcome::Generated { .. }));
        assert!(!h.worker.is_busy());
    }

    #[tokio::test]
    async fn drain_processes_everything_in_order() {
        let indicators = FakeIndicators {
            failing: HashSet::from(["BAD"]),
            ..Default::default()
        };
        let h = harness(collaborators(vec![], indicators, false)).await;
        for s in ["AAPL", "BAD", "MSFT"] {
            h.queue.enqueue(s).await.unwrap();
        }

        let summary = h.worker.drain().await;
        assert_eq!(summary, DrainSummary { generated: 2, failed: 1 });
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn run_loop_wakes_on_enqueue_and_stops_on_shutdown() {
        let h = harness(collaborators(vec![], FakeIndicators::default(), false)).await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.worker.clone().run(rx));

        h.queue.enqueue("NVDA").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.store.get("NVDA").await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker did not pick up the enqueued symbol");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[test]
    fn rejects_non_finite_indicators() {
        let mut raw = bullish();
        assert!(validate_indicators(&raw).is_ok());
        raw.rsi = f64::NAN;
        assert!(validate_indicators(&raw).is_err());
    }
}
