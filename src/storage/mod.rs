//! Counter and ban storage.
//!
//! Every backend implements [`StorageStrategy`]. The rate limiter only ever
//! talks to the trait, so the choice of backend is a startup decision.

mod context;
mod memcached;
mod memory;
mod mysql;
mod postgres;
mod redis;
mod sql;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StorageBackendKind, StorageConfig};
use crate::error::{Result, StorageError};
use crate::ratelimit::{Clock, SystemClock};

pub use context::OpContext;
pub use memcached::MemcachedStorage;
pub use memory::InMemoryStorage;
pub use mysql::MySqlStorage;
pub use postgres::PostgresStorage;
pub use self::redis::RedisStorage;

/// Storage operations the rate limiter relies on.
///
/// `increment` is the one correctness-critical operation: concurrent
/// increments of the same key must never lose an update.
#[async_trait]
pub trait StorageStrategy: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Increment the counter for `key`, creating it at 1 with a time-to-live
    /// of `window` if absent. Returns the post-increment count.
    async fn increment(&self, ctx: &OpContext, key: &str, window: Duration)
        -> std::result::Result<u64, StorageError>;

    /// Create or refresh a ban marker for `key` that expires after `duration`.
    async fn set_ban(&self, ctx: &OpContext, key: &str, duration: Duration)
        -> std::result::Result<(), StorageError>;

    /// Whether an unexpired ban marker exists for `key`.
    async fn is_banned(&self, ctx: &OpContext, key: &str) -> std::result::Result<bool, StorageError>;

    /// Remaining time on the ban marker for `key`, zero if none.
    async fn ban_reset(&self, ctx: &OpContext, key: &str)
        -> std::result::Result<Duration, StorageError>;

    /// Release backend connections.
    async fn close(&self) -> std::result::Result<(), StorageError>;
}

/// Connect the backend selected in `config`.
///
/// Fails if the backend is unreachable; the relational backends also create
/// their tables here.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn StorageStrategy>> {
    connect_with_clock(config, Arc::new(SystemClock)).await
}

/// Like [`connect`], with an explicit clock for backends that compare expiry
/// times themselves.
pub async fn connect_with_clock(
    config: &StorageConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn StorageStrategy>> {
    let storage: Arc<dyn StorageStrategy> = match config.backend {
        StorageBackendKind::Memory => Arc::new(InMemoryStorage::with_clock(clock)),
        StorageBackendKind::Redis => Arc::new(RedisStorage::connect(&config.redis_url).await?),
        StorageBackendKind::Memcached => Arc::new(
            MemcachedStorage::connect(config.memcached_server_list(), clock).await?,
        ),
        StorageBackendKind::Mysql => Arc::new(MySqlStorage::connect(&config.mysql_dsn).await?),
        StorageBackendKind::Postgres => {
            Arc::new(PostgresStorage::connect(&config.postgres_dsn).await?)
        }
    };

    info!(backend = storage.name(), "Storage backend connected");
    Ok(storage)
}

/// Whole seconds for TTL-in-seconds protocols, never below one.
///
/// A zero expiry means "never expire" to Memcached, so sub-second durations
/// round up.
pub(crate) fn ttl_secs(duration: Duration) -> u64 {
    let secs = duration
        .as_secs()
        .saturating_add(u64::from(duration.subsec_nanos() > 0));
    secs.max(1)
}
