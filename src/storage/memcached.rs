//! Memcached storage.
//!
//! Memcached's `incr` does not create missing keys, so a first increment is
//! `incr` -> miss -> `add 0` -> `incr`. Whichever client wins the `add`, every
//! racing client's count lands on the same counter.
//!
//! Memcached cannot report a key's remaining TTL, so ban markers store their
//! own expiry as a Unix timestamp in seconds.
//!
//! The `memcache` client is blocking; calls run on tokio's blocking pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memcache::{CommandError, MemcacheError};
use tracing::{debug, info};

use super::{ttl_secs, OpContext, StorageStrategy};
use crate::error::StorageError;
use crate::ratelimit::Clock;

/// Key written at startup to prove the servers accept writes.
const PING_KEY: &str = "__tollgate_ping__";

/// Longest expiry Memcached treats as relative; larger values are Unix times.
const MAX_RELATIVE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Storage backed by one or more Memcached servers.
pub struct MemcachedStorage {
    client: memcache::Client,
    clock: Arc<dyn Clock>,
}

impl MemcachedStorage {
    /// Connect to `servers` (`host:port` or `memcache://` URLs).
    pub async fn connect(servers: Vec<String>, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        if servers.is_empty() {
            return Err(StorageError::Connection(
                "no memcached servers provided".to_string(),
            ));
        }

        let urls: Vec<String> = servers.into_iter().map(server_url).collect();
        let client = tokio::task::spawn_blocking(move || -> Result<_, StorageError> {
            let client = memcache::Client::connect(urls)
                .map_err(|e| StorageError::Connection(e.to_string()))?;
            client
                .set(PING_KEY, "1", 1)
                .map_err(|e| StorageError::Connection(e.to_string()))?;
            Ok(client)
        })
        .await??;

        info!("Connected to Memcached");
        Ok(Self { client, clock })
    }

    /// Run a blocking client call on the blocking pool under `ctx`.
    async fn call<T, F>(&self, ctx: &OpContext, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&memcache::Client) -> Result<T, StorageError> + Send + 'static,
    {
        let client = self.client.clone();
        ctx.run(async move {
            tokio::task::spawn_blocking(move || f(&client))
                .await
                .map_err(StorageError::from)
                .and_then(|result| result)
        })
        .await
    }

    fn ban_expiry(&self, key: &str, raw: &str) -> Result<i64, StorageError> {
        raw.trim().parse().map_err(|_| StorageError::Corrupt {
            key: key.to_string(),
            reason: "ban marker is not a timestamp".to_string(),
        })
    }
}

/// Expiry in seconds as Memcached reads it, clamped to the relative range.
fn relative_ttl(duration: Duration) -> u32 {
    ttl_secs(duration).min(MAX_RELATIVE_TTL_SECS) as u32
}

fn server_url(server: String) -> String {
    if server.starts_with("memcache://") || server.starts_with("memcache+") {
        server
    } else {
        format!("memcache://{}", server)
    }
}

fn is_miss(err: &MemcacheError) -> bool {
    matches!(err, MemcacheError::CommandError(CommandError::KeyNotFound))
}

fn is_not_stored(err: &MemcacheError) -> bool {
    matches!(err, MemcacheError::CommandError(CommandError::KeyExists))
}

/// The increment-or-create sequence against a live client.
fn increment_or_create(
    client: &memcache::Client,
    key: &str,
    ttl: u32,
) -> Result<u64, MemcacheError> {
    match client.increment(key, 1) {
        Ok(count) => {
            if let Err(e) = client.touch(key, ttl) {
                debug!(key = %key, error = %e, "Failed to refresh counter expiry");
            }
            Ok(count)
        }
        Err(e) if is_miss(&e) => {
            match client.add(key, 0u64, ttl) {
                Ok(()) => {}
                // another client created it between our incr and add
                Err(e) if is_not_stored(&e) => {}
                Err(e) => return Err(e),
            }
            client.increment(key, 1)
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl StorageStrategy for MemcachedStorage {
    fn name(&self) -> &'static str {
        "memcached"
    }

    async fn increment(
        &self,
        ctx: &OpContext,
        key: &str,
        window: Duration,
    ) -> Result<u64, StorageError> {
        let key = key.to_string();
        let ttl = relative_ttl(window);
        self.call(ctx, move |client| {
            increment_or_create(client, &key, ttl).map_err(StorageError::from)
        })
        .await
    }

    async fn set_ban(
        &self,
        ctx: &OpContext,
        key: &str,
        duration: Duration,
    ) -> Result<(), StorageError> {
        let key = key.to_string();
        let ttl = relative_ttl(duration);
        let expires_at = self.clock.now().timestamp() + i64::from(ttl);
        self.call(ctx, move |client| {
            client
                .set(&key, expires_at.to_string().as_str(), ttl)
                .map_err(StorageError::from)
        })
        .await
    }

    async fn is_banned(&self, ctx: &OpContext, key: &str) -> Result<bool, StorageError> {
        Ok(self.ban_reset(ctx, key).await? > Duration::ZERO)
    }

    async fn ban_reset(&self, ctx: &OpContext, key: &str) -> Result<Duration, StorageError> {
        let owned = key.to_string();
        let raw: Option<String> = self
            .call(ctx, move |client| client.get(&owned).map_err(StorageError::from))
            .await?;

        let Some(raw) = raw else {
            return Ok(Duration::ZERO);
        };
        let expires_at = self.ban_expiry(key, &raw)?;
        let remaining = expires_at - self.clock.now().timestamp();
        Ok(Duration::from_secs(remaining.max(0) as u64))
    }

    async fn close(&self) -> Result<(), StorageError> {
        // Connections are pooled by the client and closed on drop.
        debug!("Releasing Memcached connections");
        Ok(())
    }
}

impl std::fmt::Debug for MemcachedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcachedStorage").finish_non_exhaustive()
    }
}
