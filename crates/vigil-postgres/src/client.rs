use anyhow::Result;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::future::Future;
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, warn};
use vigil_domain::{DomainResult, StoreHealth, StoreStats};

/// Connection settings for the telemetry store.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub pool_size: usize,
}

/// Pooled handle to the telemetry store. Cloning shares the pool.
#[derive(Clone)]
pub struct PostgresClient {
    pool: Pool,
}

impl PostgresClient {
    /// Build the connection pool. No connection is attempted here; callers
    /// probe with [`ping`](Self::ping) before serving traffic.
    pub fn new(config: &PostgresConfig) -> Result<Self> {
        let mut pool_config = Config::new();
        pool_config.application_name = Some("vigil".to_string());
        pool_config.dbname = Some(config.database.clone());
        pool_config.host = Some(config.host.clone());
        pool_config.port = Some(config.port);
        pool_config.user = Some(config.username.clone());
        pool_config.password = Some(config.password.clone());
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = pool_config.create_pool(Some(Runtime::Tokio1), NoTls)?;
        pool.resize(config.pool_size);

        Ok(Self { pool })
    }

    /// Round-trip a trivial query to prove the store is reachable.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute("SELECT 1", &[]).await?;
        debug!("telemetry store reachable");
        Ok(())
    }

    /// Gets a connection from the pool.
    pub async fn get_connection(&self) -> Result<deadpool_postgres::Client> {
        Ok(self.pool.get().await?)
    }

    /// Idempotent DDL for the telemetry tables, executed at startup.
    ///
    /// Anomalies carry a uniqueness key over (device, point, detector) so
    /// redelivered batches can be skipped instead of duplicated.
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.get_connection().await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS devices (
                     device_id   TEXT PRIMARY KEY,
                     device_name TEXT NOT NULL,
                     location    TEXT,
                     lat         DOUBLE PRECISION,
                     lng         DOUBLE PRECISION,
                     created_at  TIMESTAMPTZ NOT NULL,
                     updated_at  TIMESTAMPTZ NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS points (
                     id            BIGSERIAL PRIMARY KEY,
                     device_id     TEXT NOT NULL REFERENCES devices (device_id),
                     ts            TIMESTAMPTZ NOT NULL,
                     temperature_c DOUBLE PRECISION NOT NULL,
                     vibration_g   DOUBLE PRECISION NOT NULL,
                     humidity_pct  DOUBLE PRECISION NOT NULL,
                     voltage_v     DOUBLE PRECISION NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS points_device_ts_idx
                     ON points (device_id, ts DESC);
                 CREATE TABLE IF NOT EXISTS anomalies (
                     id        BIGSERIAL PRIMARY KEY,
                     device_id TEXT NOT NULL REFERENCES devices (device_id),
                     point_id  BIGINT REFERENCES points (id) ON DELETE SET NULL,
                     ts        TIMESTAMPTZ NOT NULL,
                     score     DOUBLE PRECISION NOT NULL,
                     detector  TEXT NOT NULL,
                     flagged   BOOLEAN NOT NULL DEFAULT TRUE,
                     CONSTRAINT anomalies_dedupe_key
                         UNIQUE (device_id, point_id, detector)
                 );
                 CREATE INDEX IF NOT EXISTS anomalies_device_ts_idx
                     ON anomalies (device_id, ts DESC);",
            )
            .await?;
        debug!("telemetry schema ensured");
        Ok(())
    }
}

#[async_trait]
impl StoreHealth for PostgresClient {
    async fn connected(&self) -> bool {
        self.ping().await.is_ok()
    }

    async fn stats(&self) -> DomainResult<StoreStats> {
        let client = self.get_connection().await?;
        let row = client
            .query_one(
                "SELECT (SELECT COUNT(*) FROM devices),
                        (SELECT COUNT(*) FROM points),
                        (SELECT COUNT(*) FROM anomalies)",
                &[],
            )
            .await
            .map_err(anyhow::Error::from)?;
        Ok(StoreStats {
            devices: row.get(0),
            metrics: row.get(1),
            anomalies: row.get(2),
        })
    }
}

/// Number of attempts for write operations before the failure surfaces.
pub(crate) const DEFAULT_WRITE_ATTEMPTS: u32 = 3;

/// Retry an operation with exponential backoff, starting at 100 ms.
pub(crate) async fn with_retries<T, Fut>(
    label: &str,
    attempts: u32,
    mut op: impl FnMut() -> Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(100);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(
                    operation = label,
                    attempt,
                    error = %e,
                    "store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retries_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retries("test", 3, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(anyhow::anyhow!("transient"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("still down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
