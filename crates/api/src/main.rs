use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockbrief_core::report::{Collaborators, ReportService, ReportState, ReportWorker};
use stockbrief_core::time::{Clock, SystemClock};

mod routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = stockbrief_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let storage = stockbrief_core::storage::open(&settings).await?;
    let state = ReportState::init(
        storage.kv.clone(),
        &settings.report_store_key,
        &settings.generation_queue_key,
    )
    .await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let service = Arc::new(ReportService::new(
        state.store.clone(),
        state.queue.clone(),
        clock.clone(),
        settings.pipeline.freshness_window,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    match Collaborators::from_settings(&settings) {
        Ok(collaborators) => {
            let worker = Arc::new(ReportWorker::new(
                state.store.clone(),
                state.queue.clone(),
                collaborators,
                clock.clone(),
                settings.pipeline.clone(),
            ));
            background.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(
                error = %e,
                "report worker disabled; serving cached reports only"
            );
        }
    }

    if !settings.watch_symbols.is_empty() {
        background.push(tokio::spawn(service.clone().run_sweeper(
            settings.watch_symbols.clone(),
            settings.sweep_interval,
            shutdown_rx.clone(),
        )));
    }

    let app = routes::router(routes::AppState {
        service,
        storage_backend: storage.kv.backend_name(),
    });

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, backend = storage.kv.backend_name(), "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    tracing::info!("api stopped");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &stockbrief_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
