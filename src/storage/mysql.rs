//! MySQL storage.
//!
//! Each increment is one transaction: an `INSERT ... ON DUPLICATE KEY UPDATE`
//! that creates, resets or bumps the row, then a read of the new count. The
//! upsert takes the row lock itself, so racing creators of the same key
//! serialize on it instead of on a gap lock. Connections run at
//! `READ COMMITTED`, which keeps InnoDB from taking gap locks at all.
//!
//! Expired counter and ban rows are deleted in the background every few
//! hundred increments.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Executor;
use tracing::{debug, info, warn};

use super::sql::{expiry, remaining, SweepSchedule};
use super::{OpContext, StorageStrategy};
use crate::error::StorageError;

const SET_READ_COMMITTED: &str = "SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED";

const CREATE_RATE_LIMITS: &str = "CREATE TABLE IF NOT EXISTS rate_limits \
    (k VARCHAR(255) PRIMARY KEY, count INT NOT NULL, expires_at DATETIME(6) NULL)";

const CREATE_BANS: &str = "CREATE TABLE IF NOT EXISTS bans \
    (k VARCHAR(255) PRIMARY KEY, expires_at DATETIME(6) NOT NULL)";

// `count` is assigned before `expires_at`, so the IF sees the old expiry.
const UPSERT_COUNTER: &str = "INSERT INTO rate_limits (k, count, expires_at) VALUES (?, 1, ?) \
    ON DUPLICATE KEY UPDATE \
    count = IF(expires_at IS NULL OR expires_at < ?, 1, count + 1), \
    expires_at = VALUES(expires_at)";

const READ_COUNTER: &str = "SELECT count FROM rate_limits WHERE k = ?";

const UPSERT_BAN: &str = "INSERT INTO bans (k, expires_at) VALUES (?, ?) \
    ON DUPLICATE KEY UPDATE expires_at = VALUES(expires_at)";

const SELECT_BAN: &str = "SELECT expires_at FROM bans WHERE k = ?";

const DELETE_EXPIRED_COUNTERS: &str = "DELETE FROM rate_limits WHERE expires_at < ?";

const DELETE_EXPIRED_BANS: &str = "DELETE FROM bans WHERE expires_at < ?";

/// Storage backed by MySQL or MariaDB.
#[derive(Debug)]
pub struct MySqlStorage {
    pool: MySqlPool,
    sweeps: SweepSchedule,
}

impl MySqlStorage {
    /// Connect to `dsn` and create the tables if they do not exist.
    pub async fn connect(dsn: &str) -> Result<Self, StorageError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute(SET_READ_COMMITTED).await?;
                    Ok(())
                })
            })
            .connect(dsn)
            .await
            .map_err(|e| StorageError::Connection(format!("failed to connect to mysql: {}", e)))?;

        let storage = Self::from_pool(pool);
        storage.ensure_schema().await?;
        info!("Connected to MySQL");
        Ok(storage)
    }

    fn from_pool(pool: MySqlPool) -> Self {
        Self {
            pool,
            sweeps: SweepSchedule::default(),
        }
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(CREATE_RATE_LIMITS).execute(&self.pool).await?;
        sqlx::query(CREATE_BANS).execute(&self.pool).await?;
        Ok(())
    }

    /// Delete counter and ban rows that have expired. Returns the number of
    /// rows removed.
    pub async fn sweep_expired(&self) -> Result<u64, StorageError> {
        delete_expired(&self.pool, Utc::now()).await
    }

    fn spawn_sweep(&self) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            match delete_expired(&pool, Utc::now()).await {
                Ok(rows) => debug!(rows = rows, "Deleted expired MySQL rows"),
                Err(e) => warn!(error = %e, "Failed to delete expired MySQL rows"),
            }
        });
    }

    async fn increment_tx(&self, key: &str, window: Duration) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(UPSERT_COUNTER)
            .bind(key)
            .bind(expiry(now, window))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        let (count,): (i32,) = sqlx::query_as(READ_COUNTER)
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(count.max(0) as u64)
    }

    async fn ban_expiry(&self, key: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(SELECT_BAN)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(expires_at,)| expires_at))
    }
}

async fn delete_expired(pool: &MySqlPool, now: DateTime<Utc>) -> Result<u64, StorageError> {
    let counters = sqlx::query(DELETE_EXPIRED_COUNTERS)
        .bind(now)
        .execute(pool)
        .await?;
    let bans = sqlx::query(DELETE_EXPIRED_BANS).bind(now).execute(pool).await?;
    Ok(counters.rows_affected() + bans.rows_affected())
}

#[async_trait]
impl StorageStrategy for MySqlStorage {
    fn name(&self) -> &'static str {
        "mysql"
    }

    async fn increment(
        &self,
        ctx: &OpContext,
        key: &str,
        window: Duration,
    ) -> Result<u64, StorageError> {
        let count = ctx.run(self.increment_tx(key, window)).await?;
        if self.sweeps.record_write() {
            self.spawn_sweep();
        }
        Ok(count)
    }

    async fn set_ban(
        &self,
        ctx: &OpContext,
        key: &str,
        duration: Duration,
    ) -> Result<(), StorageError> {
        let expires_at = expiry(Utc::now(), duration);
        ctx.run(async {
            sqlx::query(UPSERT_BAN)
                .bind(key)
                .bind(expires_at)
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(StorageError::from)
        })
        .await
    }

    async fn is_banned(&self, ctx: &OpContext, key: &str) -> Result<bool, StorageError> {
        let expires_at = ctx.run(self.ban_expiry(key)).await?;
        Ok(expires_at.is_some_and(|expires_at| expires_at > Utc::now()))
    }

    async fn ban_reset(&self, ctx: &OpContext, key: &str) -> Result<Duration, StorageError> {
        let expires_at = ctx.run(self.ban_expiry(key)).await?;
        Ok(remaining(expires_at, Utc::now()))
    }

    async fn close(&self) -> Result<(), StorageError> {
        debug!("Closing MySQL pool");
        self.pool.close().await;
        Ok(())
    }
}
