//! Redis storage.
//!
//! Counters use `INCR` and `PEXPIRE` inside one `MULTI`/`EXEC`, so the
//! increment and the expiry refresh land together in a single round trip.
//! Bans are plain keys holding `banned` with a millisecond TTL.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info};

use super::{OpContext, StorageStrategy};
use crate::error::StorageError;

/// Payload stored under a ban key.
const BAN_MARKER: &str = "banned";

/// Storage backed by a Redis server.
pub struct RedisStorage {
    /// `None` once closed
    conn: RwLock<Option<MultiplexedConnection>>,
}

impl RedisStorage {
    /// Connect to `redis_url` and verify the server answers `PING`.
    pub async fn connect(redis_url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StorageError::Connection(format!("invalid Redis URL: {}", e)))?;

        let ctx = OpContext::with_timeout(Duration::from_secs(5));
        let mut conn = ctx
            .run(async {
                client
                    .get_multiplexed_tokio_connection()
                    .await
                    .map_err(|e| StorageError::Connection(e.to_string()))
            })
            .await?;

        let _: String = ctx
            .run(async {
                redis::cmd("PING")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StorageError::Connection(e.to_string()))
            })
            .await?;

        info!("Connected to Redis");
        Ok(Self {
            conn: RwLock::new(Some(conn)),
        })
    }

    /// A handle on the shared connection, or an error after `close`.
    fn connection(&self) -> Result<MultiplexedConnection, StorageError> {
        self.conn
            .read()
            .as_ref()
            .cloned()
            .ok_or_else(|| StorageError::Connection("redis connection is closed".to_string()))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

#[async_trait]
impl StorageStrategy for RedisStorage {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn increment(
        &self,
        ctx: &OpContext,
        key: &str,
        window: Duration,
    ) -> Result<u64, StorageError> {
        let mut conn = self.connection()?;
        let (count,): (u64,) = ctx
            .run(async {
                redis::pipe()
                    .atomic()
                    .cmd("INCR")
                    .arg(key)
                    .cmd("PEXPIRE")
                    .arg(key)
                    .arg(millis(window))
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(StorageError::from)
            })
            .await?;
        Ok(count)
    }

    async fn set_ban(
        &self,
        ctx: &OpContext,
        key: &str,
        duration: Duration,
    ) -> Result<(), StorageError> {
        let mut conn = self.connection()?;
        ctx.run(async {
            redis::cmd("SET")
                .arg(key)
                .arg(BAN_MARKER)
                .arg("PX")
                .arg(millis(duration))
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(StorageError::from)
        })
        .await
    }

    async fn is_banned(&self, ctx: &OpContext, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection()?;
        ctx.run(async {
            redis::cmd("EXISTS")
                .arg(key)
                .query_async::<_, bool>(&mut conn)
                .await
                .map_err(StorageError::from)
        })
        .await
    }

    async fn ban_reset(&self, ctx: &OpContext, key: &str) -> Result<Duration, StorageError> {
        let mut conn = self.connection()?;
        // -2 when the key is missing, -1 when it has no expiry
        let ttl_ms: i64 = ctx
            .run(async {
                redis::cmd("PTTL")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(StorageError::from)
            })
            .await?;
        Ok(Duration::from_millis(ttl_ms.max(0) as u64))
    }

    async fn close(&self) -> Result<(), StorageError> {
        // The multiplexed connection closes once in-flight clones finish.
        if self.conn.write().take().is_some() {
            debug!("Closed Redis connection");
        }
        Ok(())
    }
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage").finish_non_exhaustive()
    }
}
