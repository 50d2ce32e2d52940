use crate::domain::report::{CachedReport, GenerationFailure};
use crate::report::to_chrono;
use crate::storage::DurableKeyValueStore;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Persisted shape of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub reports: BTreeMap<String, CachedReport>,
    #[serde(default)]
    pub failures: BTreeMap<String, GenerationFailure>,
}

/// Symbol-keyed report cache, written through to durable storage on every mutation.
pub struct ReportStore {
    kv: Arc<dyn DurableKeyValueStore>,
    key: String,
    state: RwLock<StoreSnapshot>,
}

impl ReportStore {
    /// Loads the store. A blob that no longer decodes is discarded and the store starts empty;
    /// a failing read is returned to the caller.
    pub async fn init(kv: Arc<dyn DurableKeyValueStore>, key: &str) -> anyhow::Result<Self> {
        let bytes = kv
            .read(key)
            .await
            .with_context(|| format!("failed to load report store (key={key})"))?;

        let state = match bytes {
            None => StoreSnapshot::default(),
            Some(bytes) => match decode(&bytes) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(key, error = %err, "report store unreadable; starting empty");
                    StoreSnapshot::default()
                }
            },
        };

        tracing::info!(
            key,
            backend = kv.backend_name(),
            reports = state.reports.len(),
            failures = state.failures.len(),
            "report store loaded"
        );

        Ok(Self {
            kv,
            key: key.to_string(),
            state: RwLock::new(state),
        })
    }

    pub async fn get(&self, symbol: &str) -> Option<CachedReport> {
        self.state.read().await.reports.get(symbol).cloned()
    }

    pub async fn failure(&self, symbol: &str) -> Option<GenerationFailure> {
        self.state.read().await.failures.get(symbol).cloned()
    }

    /// True iff a report exists and `now - generated_at < window`.
    pub async fn is_fresh(&self, symbol: &str, now: DateTime<Utc>, window: Duration) -> bool {
        self.state
            .read()
            .await
            .reports
            .get(symbol)
            .is_some_and(|r| r.age(now) < to_chrono(window))
    }

    /// Overwrites the entry for `symbol` and clears any recorded failure.
    pub async fn put(&self, symbol: &str, report: CachedReport) -> anyhow::Result<()> {
        anyhow::ensure!(
            report.symbol == symbol,
            "report symbol mismatch: expected {symbol}, got {}",
            report.symbol
        );

        let mut state = self.state.write().await;
        if let Some(existing) = state.reports.get(symbol) {
            anyhow::ensure!(
                report.generated_at >= existing.generated_at,
                "refusing to move {symbol} generated_at backwards ({} < {})",
                report.generated_at,
                existing.generated_at
            );
        }
        state.reports.insert(symbol.to_string(), report);
        state.failures.remove(symbol);
        self.persist(&state).await
    }

    /// Records a failed cycle; the retry delay doubles per consecutive failure up to `cap`.
    pub async fn record_failure(
        &self,
        symbol: &str,
        error: &str,
        now: DateTime<Utc>,
        base: Duration,
        cap: Duration,
    ) -> anyhow::Result<GenerationFailure> {
        let mut state = self.state.write().await;
        let attempts = state
            .failures
            .get(symbol)
            .map_or(1, |f| f.attempts.saturating_add(1));
        let failure = GenerationFailure {
            symbol: symbol.to_string(),
            error: error.to_string(),
            failed_at: now,
            attempts,
            retry_after: now + to_chrono(retry_delay(attempts, base, cap)),
        };
        state.failures.insert(symbol.to_string(), failure.clone());
        self.persist(&state).await?;
        Ok(failure)
    }

    /// Drops every report and failure. Not used by normal operation.
    pub async fn clear(&self) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        *state = StoreSnapshot::default();
        self.persist(&state).await
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.read().await.clone()
    }

    // Runs under the write lock so persisted blobs follow mutation order.
    async fn persist(&self, state: &StoreSnapshot) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(state).context("serialize report store failed")?;
        self.kv
            .write(&self.key, &bytes)
            .await
            .with_context(|| format!("failed to persist report store (key={})", self.key))
    }
}

pub fn retry_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempts.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exp).min(cap)
}

fn decode(bytes: &[u8]) -> anyhow::Result<StoreSnapshot> {
    if let Ok(snapshot) = serde_json::from_slice::<StoreSnapshot>(bytes) {
        return Ok(snapshot);
    }
    // Earlier layout: a bare symbol -> report map.
    let reports = serde_json::from_slice::<BTreeMap<String, CachedReport>>(bytes)
        .context("report store blob matches no known layout")?;
    Ok(StoreSnapshot {
        reports,
        failures: BTreeMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{classify, normalize};
    use crate::domain::report::{AverageReading, MacdReading, RawIndicators};
    use crate::storage::MemoryKvStore;
    use chrono::TimeZone;

    const KEY: &str = "report_store";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, 14, 30, 0).unwrap()
    }

    fn report(symbol: &str, generated_at: DateTime<Utc>) -> CachedReport {
        let classified = classify(&RawIndicators {
            sma: AverageReading { value: 100.0, price: 101.0 },
            ema: AverageReading { value: 100.5, price: 101.0 },
            rsi: 55.0,
            macd: MacdReading { macd: 0.4, signal: 0.2 },
        });
        CachedReport {
            symbol: symbol.to_string(),
            news: Vec::new(),
            score: normalize(&classified),
            classified,
            narrative: "Hold.".to_string(),
            narrative_degraded: false,
            generated_at,
        }
    }

    async fn store_on(kv: &Arc<MemoryKvStore>) -> ReportStore {
        ReportStore::init(kv.clone() as Arc<dyn DurableKeyValueStore>, KEY)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn freshness_window_boundary() {
        let kv = Arc::new(MemoryKvStore::default());
        let store = store_on(&kv).await;
        let window = Duration::from_secs(5);
        store.put("AAPL", report("AAPL", t0())).await.unwrap();

        let eps = chrono::Duration::milliseconds(1);
        let w = chrono::Duration::seconds(5);
        assert!(store.is_fresh("AAPL", t0() + w - eps, window).await);
        assert!(!store.is_fresh("AAPL", t0() + w, window).await);
        assert!(!store.is_fresh("AAPL", t0() + w + eps, window).await);
        assert!(!store.is_fresh("MSFT", t0(), window).await);
    }

    #[tokio::test]
    async fn put_overwrites_and_reloads() {
        let kv = Arc::new(MemoryKvStore::default());
        let store = store_on(&kv).await;
        store.put("AAPL", report("AAPL", t0())).await.unwrap();
        store
            .put("AAPL", report("AAPL", t0() + chrono::Duration::seconds(60)))
            .await
            .unwrap();
        store.put("MSFT", report("MSFT", t0())).await.unwrap();

        let reloaded = store_on(&kv).await;
        assert_eq!(reloaded.snapshot().await, store.snapshot().await);
        assert_eq!(reloaded.snapshot().await.reports.len(), 2);
        assert_eq!(
            reloaded.get("AAPL").await.unwrap().generated_at,
            t0() + chrono::Duration::seconds(60)
        );
    }

    #[tokio::test]
    async fn refuses_to_move_generated_at_backwards() {
        let kv = Arc::new(MemoryKvStore::default());
        let store = store_on(&kv).await;
        store.put("AAPL", report("AAPL", t0())).await.unwrap();
        let older = report("AAPL", t0() - chrono::Duration::seconds(1));
        assert!(store.put("AAPL", older).await.is_err());
        assert_eq!(store.get("AAPL").await.unwrap().generated_at, t0());
    }

    #[tokio::test]
    async fn rejects_mismatched_symbol() {
        let kv = Arc::new(MemoryKvStore::default());
        let store = store_on(&kv).await;
        assert!(store.put("AAPL", report("MSFT", t0())).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_blob_resets_to_empty() {
        let kv = Arc::new(MemoryKvStore::default());
        kv.insert_raw(KEY, b"{not json".to_vec()).await;
        let store = store_on(&kv).await;
        assert_eq!(store.snapshot().await, StoreSnapshot::default());

        // Still writable after the reset.
        store.put("AAPL", report("AAPL", t0())).await.unwrap();
        assert!(store_on(&kv).await.get("AAPL").await.is_some());
    }

    #[tokio::test]
    async fn accepts_bare_map_layout() {
        let kv = Arc::new(MemoryKvStore::default());
        let mut legacy = BTreeMap::new();
        legacy.insert("AAPL".to_string(), report("AAPL", t0()));
        kv.insert_raw(KEY, serde_json::to_vec(&legacy).unwrap()).await;

        let store = store_on(&kv).await;
        assert_eq!(store.get("AAPL").await, Some(report("AAPL", t0())));
    }

    #[tokio::test]
    async fn failures_back_off_and_clear_on_success() {
        let kv = Arc::new(MemoryKvStore::default());
        let store = store_on(&kv).await;
        let base = Duration::from_secs(60);
        let cap = Duration::from_secs(300);

        let first = store.record_failure("TSLA", "boom", t0(), base, cap).await.unwrap();
        assert_eq!(first.attempts, 1);
        assert_eq!(first.retry_after, t0() + chrono::Duration::seconds(60));

        let second = store.record_failure("TSLA", "boom", t0(), base, cap).await.unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.retry_after, t0() + chrono::Duration::seconds(120));

        assert_eq!(store_on(&kv).await.failure("TSLA").await, Some(second));

        store.put("TSLA", report("TSLA", t0())).await.unwrap();
        assert_eq!(store.failure("TSLA").await, None);
    }

    #[test]
    fn retry_delay_is_capped() {
        let base = Duration::from_secs(60);
        let cap = Duration::from_secs(3600);
        assert_eq!(retry_delay(1, base, cap), base);
        assert_eq!(retry_delay(4, base, cap), Duration::from_secs(480));
        assert_eq!(retry_delay(40, base, cap), cap);
    }

    #[tokio::test]
    async fn clear_empties_durable_copy() {
        let kv = Arc::new(MemoryKvStore::default());
        let store = store_on(&kv).await;
        store.put("AAPL", report("AAPL", t0())).await.unwrap();
        store.clear().await.unwrap();
        assert!(store_on(&kv).await.get("AAPL").await.is_none());
    }
}
