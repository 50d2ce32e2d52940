use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockbrief_core::config::{parse_symbol_list, Settings};
use stockbrief_core::domain::symbol::normalize_symbol;
use stockbrief_core::report::{Collaborators, ReportService, ReportState, ReportWorker};
use stockbrief_core::storage::lock;
use stockbrief_core::time::{Clock, SystemClock};

#[derive(Debug, Parser)]
#[command(name = "stockbrief_worker")]
struct Args {
    /// Comma-separated symbols to queue before draining. Defaults to WATCH_SYMBOLS.
    #[arg(long)]
    symbols: Option<String>,

    /// Report what would be generated without calling providers or writing storage.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();
    let symbols = match args.symbols.as_deref() {
        Some(raw) => parse_symbol_list(Some(raw)),
        None => settings.watch_symbols.clone(),
    };

    if let Err(err) = run(&settings, &symbols, args.dry_run).await {
        sentry_anyhow::capture_anyhow(&err);
        tracing::error!(error = %format!("{err:#}"), "worker run failed");
        return Err(err);
    }
    Ok(())
}

async fn run(settings: &Settings, symbols: &[String], dry_run: bool) -> anyhow::Result<()> {
    let storage = stockbrief_core::storage::open(settings).await?;
    let state = ReportState::init(
        storage.kv.clone(),
        &settings.report_store_key,
        &settings.generation_queue_key,
    )
    .await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if dry_run {
        let now = clock.now();
        let mut stale = Vec::new();
        for raw in symbols {
            let Ok(symbol) = normalize_symbol(raw) else {
                tracing::warn!(symbol = %raw, "skipping invalid symbol");
                continue;
            };
            if !state
                .store
                .is_fresh(&symbol, now, settings.pipeline.freshness_window)
                .await
            {
                stale.push(symbol);
            }
        }
        tracing::info!(
            dry_run = true,
            queued = ?state.queue.snapshot().await,
            stale = ?stale,
            "worker dry-run"
        );
        return Ok(());
    }

    // Nothing after the lease is taken may return early.
    let collaborators = Collaborators::from_settings(settings)?;

    let lease = match &storage.pool {
        Some(pool) => match lock::try_acquire_drain_lock(pool).await? {
            Some(lease) => Some(lease),
            None => {
                tracing::warn!("drain lock not acquired; another worker is running");
                return Ok(());
            }
        },
        None => None,
    };

    let service = ReportService::new(
        state.store.clone(),
        state.queue.clone(),
        clock.clone(),
        settings.pipeline.freshness_window,
    );
    service.prime_watch_set(symbols, clock.now()).await;

    let worker = ReportWorker::new(
        state.store.clone(),
        state.queue.clone(),
        collaborators,
        clock,
        settings.pipeline.clone(),
    );
    let summary = worker.drain().await;
    tracing::info!(
        generated = summary.generated,
        failed = summary.failed,
        backend = storage.kv.backend_name(),
        "worker run finished"
    );

    if let Some(lease) = lease {
        if let Err(e) = lease.release().await {
            tracing::warn!(error = %e, "failed to release drain lock");
        }
    }
    Ok(())
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
