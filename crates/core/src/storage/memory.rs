use crate::storage::DurableKeyValueStore;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub async fn insert_raw(&self, key: &str, value: impl Into<Vec<u8>>) {
        self.entries.lock().await.insert(key.to_string(), value.into());
    }
}

#[async_trait::async_trait]
impl DurableKeyValueStore for MemoryKvStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
