use crate::domain::symbol::normalize_symbol;
use crate::storage::DurableKeyValueStore;
use anyhow::Context;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// FIFO of symbols awaiting generation. Duplicates are rejected on insert.
pub struct GenerationQueue {
    kv: Arc<dyn DurableKeyValueStore>,
    key: String,
    entries: Mutex<VecDeque<String>>,
    wake: Notify,
}

impl GenerationQueue {
    pub async fn init(kv: Arc<dyn DurableKeyValueStore>, key: &str) -> anyhow::Result<Self> {
        let bytes = kv
            .read(key)
            .await
            .with_context(|| format!("failed to load generation queue (key={key})"))?;

        let entries = match bytes {
            None => VecDeque::new(),
            Some(bytes) => match decode(&bytes) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(key, error = %err, "generation queue unreadable; starting empty");
                    VecDeque::new()
                }
            },
        };

        tracing::info!(key, backend = kv.backend_name(), pending = entries.len(), "generation queue loaded");

        Ok(Self {
            kv,
            key: key.to_string(),
            entries: Mutex::new(entries),
            wake: Notify::new(),
        })
    }

    /// Appends `symbol` unless already queued. Returns whether it was added.
    pub async fn enqueue(&self, symbol: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|s| s == symbol) {
            return Ok(false);
        }
        entries.push_back(symbol.to_string());
        tracing::debug!(symbol, pending = entries.len(), "enqueued");
        // Wake the worker before persisting: the entry is live in memory either way.
        self.wake.notify_one();
        self.persist(&entries).await?;
        Ok(true)
    }

    pub async fn peek_front(&self) -> Option<String> {
        self.entries.lock().await.front().cloned()
    }

    /// Removes the front entry. The in-memory removal happens even if persisting fails.
    pub async fn dequeue_front(&self) -> anyhow::Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        let Some(front) = entries.pop_front() else {
            return Ok(None);
        };
        self.persist(&entries).await?;
        Ok(Some(front))
    }

    pub async fn contains(&self, symbol: &str) -> bool {
        self.entries.lock().await.iter().any(|s| s == symbol)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Resolves after the next successful `enqueue`, or immediately if one happened since
    /// the last wait.
    pub async fn wait_for_enqueue(&self) {
        self.wake.notified().await;
    }

    async fn persist(&self, entries: &VecDeque<String>) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(entries).context("serialize generation queue failed")?;
        self.kv
            .write(&self.key, &bytes)
            .await
            .with_context(|| format!("failed to persist generation queue (key={})", self.key))
    }
}

/// Decodes a JSON array of symbols, re-normalising and dropping duplicates and junk.
fn decode(bytes: &[u8]) -> anyhow::Result<VecDeque<String>> {
    let raw: Vec<String> =
        serde_json::from_slice(bytes).context("generation queue blob is not a JSON string array")?;
    let mut out: VecDeque<String> = VecDeque::with_capacity(raw.len());
    for entry in raw {
        match normalize_symbol(&entry) {
            Ok(symbol) if !out.contains(&symbol) => out.push_back(symbol),
            Ok(_) => {}
            Err(err) => tracing::warn!(entry, error = %err, "dropping invalid queued symbol"),
        }
    }
    Ok(out)
}
