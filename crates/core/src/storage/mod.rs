use crate::config::{Settings, StorageBackend};
use anyhow::Context;
use std::sync::Arc;

pub mod file;
pub mod lock;
pub mod memory;
pub mod postgres;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;
pub use postgres::PgKvStore;

/// Byte-blob persistence under string keys.
#[async_trait::async_trait]
pub trait DurableKeyValueStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn write(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;
}

pub struct OpenedStorage {
    pub kv: Arc<dyn DurableKeyValueStore>,
    /// Present for the postgres backend; used for session-scoped locks.
    pub pool: Option<sqlx::PgPool>,
}

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

pub async fn open(settings: &Settings) -> anyhow::Result<OpenedStorage> {
    match settings.storage_backend {
        StorageBackend::File => {
            let kv = FileKvStore::open(&settings.storage_dir).await?;
            tracing::info!(dir = %settings.storage_dir, "using file storage backend");
            Ok(OpenedStorage {
                kv: Arc::new(kv),
                pool: None,
            })
        }
        StorageBackend::Postgres => {
            let db_url = settings.require_database_url()?;
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect(db_url)
                .await
                .context("connect DATABASE_URL failed")?;
            migrate(&pool).await?;
            tracing::info!("using postgres storage backend");
            Ok(OpenedStorage {
                kv: Arc::new(PgKvStore::new(pool.clone())),
                pool: Some(pool),
            })
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage backend; nothing survives a restart");
            Ok(OpenedStorage {
                kv: Arc::new(MemoryKvStore::default()),
                pool: None,
            })
        }
    }
}
