use crate::storage::DurableKeyValueStore;
use anyhow::Context;

#[derive(Debug, Clone)]
pub struct PgKvStore {
    pool: sqlx::PgPool,
}

impl PgKvStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DurableKeyValueStore for PgKvStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = $1")
            .persistent(false)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("select kv_store failed (key={key})"))?;
        Ok(row.map(|(value,)| value))
    }

    async fn write(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let t0 = std::time::Instant::now();
        sqlx::query(
            "INSERT INTO kv_store (key, value, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
        )
        .persistent(false)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert kv_store failed (key={key})"))?;

        tracing::debug!(
            key,
            bytes = value.len(),
            elapsed_ms = t0.elapsed().as_millis(),
            "kv_store upsert"
        );
        Ok(())
    }
}
