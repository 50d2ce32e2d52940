use crate::storage::DurableKeyValueStore;
use std::sync::Arc;

pub mod queue;
pub mod service;
pub mod store;
pub mod worker;

pub use queue::GenerationQueue;
pub use service::{ReportResponse, ReportService};
pub use store::ReportStore;
pub use worker::{Collaborators, CycleOutcome, ReportWorker};

/// Store and queue loaded from durable storage, shared by the facade and the worker.
#[derive(Clone)]
pub struct ReportState {
    pub store: Arc<ReportStore>,
    pub queue: Arc<GenerationQueue>,
}

impl ReportState {
    pub async fn init(
        kv: Arc<dyn DurableKeyValueStore>,
        store_key: &str,
        queue_key: &str,
    ) -> anyhow::Result<Self> {
        let store = ReportStore::init(Arc::clone(&kv), store_key).await?;
        let queue = GenerationQueue::init(kv, queue_key).await?;
        Ok(Self {
            store: Arc::new(store),
            queue: Arc::new(queue),
        })
    }
}

pub(crate) fn to_chrono(window: std::time::Duration) -> chrono::Duration {
    // Anything too large for chrono is effectively "forever".
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(365 * 1000))
}
