use crate::domain::report::{CachedReport, GenerationFailure};
use crate::domain::symbol::normalize_symbol;
use crate::report::{to_chrono, GenerationQueue, ReportStore};
use crate::time::Clock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportResponse {
    pub symbol: String,
    pub report: Option<CachedReport>,
    pub stale: bool,
    /// Set while the last cycle for this symbol failed and has not been retried successfully.
    pub failure: Option<GenerationFailure>,
    pub queued: bool,
}

/// Read facade for the UI layer. Never generates inline; stale or missing reports are queued
/// for the worker and the last known report is returned.
pub struct ReportService {
    store: Arc<ReportStore>,
    queue: Arc<GenerationQueue>,
    clock: Arc<dyn Clock>,
    freshness_window: Duration,
}

impl ReportService {
    pub fn new(
        store: Arc<ReportStore>,
        queue: Arc<GenerationQueue>,
        clock: Arc<dyn Clock>,
        freshness_window: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            freshness_window,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Errors only on an invalid symbol.
    pub async fn request_report(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ReportResponse> {
        let symbol = normalize_symbol(symbol)?;

        // Freshness is judged on the same copy that is returned, so a concurrent clear can
        // never produce a fresh response without a report.
        let report = self.store.get(&symbol).await;
        let window = to_chrono(self.freshness_window);
        if report.as_ref().is_some_and(|r| r.age(now) < window) {
            return Ok(ReportResponse {
                report,
                stale: false,
                failure: None,
                queued: self.queue.contains(&symbol).await,
                symbol,
            });
        }

        let failure = self.store.failure(&symbol).await;
        let backing_off = failure.as_ref().is_some_and(|f| f.is_backing_off(now));
        if backing_off {
            tracing::debug!(%symbol, "stale report not requeued; last generation failed recently");
        } else {
            self.enqueue_logged(&symbol).await;
        }

        Ok(ReportResponse {
            report,
            stale: true,
            failure,
            queued: self.queue.contains(&symbol).await,
            symbol,
        })
    }

    /// Enqueues every symbol that is not fresh. Returns the symbols that were newly queued.
    pub async fn prime_watch_set(&self, symbols: &[String], now: DateTime<Utc>) -> Vec<String> {
        let mut enqueued = Vec::new();
        for raw in symbols {
            let symbol = match normalize_symbol(raw) {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(symbol = %raw, error = %err, "skipping invalid watch symbol");
                    continue;
                }
            };

            if self.store.is_fresh(&symbol, now, self.freshness_window).await {
                continue;
            }
            if self
                .store
                .failure(&symbol)
                .await
                .is_some_and(|f| f.is_backing_off(now))
            {
                continue;
            }
            if self.enqueue_logged(&symbol).await {
                enqueued.push(symbol);
            }
        }

        if !enqueued.is_empty() {
            tracing::info!(count = enqueued.len(), symbols = ?enqueued, "watch set primed");
        }
        enqueued
    }

    /// Re-primes `symbols` every `interval` until shutdown.
    pub async fn run_sweeper(
        self: Arc<Self>,
        symbols: Vec<String>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if symbols.is_empty() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.prime_watch_set(&symbols, self.now()).await;
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn queued_symbols(&self) -> Vec<String> {
        self.queue.snapshot().await
    }

    pub async fn clear_cache(&self) -> anyhow::Result<()> {
        self.store.clear().await?;
        tracing::info!("report cache cleared");
        Ok(())
    }

    // Storage errors are logged: the entry is live in memory and the worker will still see it.
    async fn enqueue_logged(&self, symbol: &str) -> bool {
        match self.queue.enqueue(symbol).await {
            Ok(added) => added,
            Err(err) => {
                tracing::error!(symbol, error = %format!("{err:#}"), "failed to persist enqueue");
                true
            }
        }
    }
}
