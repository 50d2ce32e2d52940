use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use stockbrief_core::report::{ReportResponse, ReportService};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReportService>,
    pub storage_backend: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/reports/:symbol", get(get_report))
        .route("/reports/prime", post(prime_reports))
        .route("/reports", delete(clear_reports))
        .route("/queue", get(get_queue))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_report(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<ReportResponse>, StatusCode> {
    let now = state.service.now();
    let res = state
        .service
        .request_report(&symbol, now)
        .await
        .map_err(|e| {
            tracing::debug!(symbol = %symbol, error = %e, "rejected report request");
            StatusCode::BAD_REQUEST
        })?;
    Ok(Json(res))
}

#[derive(Debug, Deserialize)]
pub struct PrimeRequest {
    pub symbols: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PrimeResponse {
    pub enqueued: Vec<String>,
}

async fn prime_reports(
    State(state): State<AppState>,
    Json(req): Json<PrimeRequest>,
) -> Json<PrimeResponse> {
    let now = state.service.now();
    let enqueued = state.service.prime_watch_set(&req.symbols, now).await;
    Json(PrimeResponse { enqueued })
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub backend: &'static str,
    pub symbols: Vec<String>,
}

async fn get_queue(State(state): State<AppState>) -> Json<QueueResponse> {
    Json(QueueResponse {
        backend: state.storage_backend,
        symbols: state.service.queued_symbols().await,
    })
}

async fn clear_reports(State(state): State<AppState>) -> StatusCode {
    match state.service.clear_cache().await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %format!("{e:#}"), "failed to clear report cache");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
