use anyhow::Context;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;

// Advisory locks are scoped to the Postgres session, so the lease pins one pooled connection
// for as long as it is held.
const LOCK_NAMESPACE: i64 = 0x5354_4B42_5246; // "STKBRF"

const DRAIN_LOCK_KEY: i64 = LOCK_NAMESPACE ^ 0x01;

pub struct DrainLease {
    conn: PoolConnection<Postgres>,
}

/// Best-effort guard against two processes draining the same queue at once.
pub async fn try_acquire_drain_lock(pool: &sqlx::PgPool) -> anyhow::Result<Option<DrainLease>> {
    let mut conn = pool
        .acquire()
        .await
        .context("failed to acquire connection for drain lock")?;
    let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .persistent(false)
        .bind(DRAIN_LOCK_KEY)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("failed to acquire advisory lock (key={DRAIN_LOCK_KEY})"))?;

    Ok(acquired.0.then_some(DrainLease { conn }))
}

impl DrainLease {
    pub async fn release(mut self) -> anyhow::Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(DRAIN_LOCK_KEY)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("failed to release advisory lock (key={DRAIN_LOCK_KEY})"))?;
        Ok(())
    }
}
