//! In-process storage backed by concurrent maps.
//!
//! Counters live in a [`DashMap`]; each increment holds the key's shard lock
//! for the read-modify-write, which makes it atomic per key. Expired entries
//! are swept every few hundred writes instead of by a background task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

use super::{OpContext, StorageStrategy};
use crate::error::StorageError;
use crate::ratelimit::{saturating_add, Clock, SystemClock};

/// Number of writes between expiry sweeps.
const SWEEP_INTERVAL: u64 = 512;

/// A counter and the moment it stops counting.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    expires_at: DateTime<Utc>,
}

impl WindowCounter {
    fn new(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 0,
            expires_at: expiry(now, window),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    saturating_add(now, ttl)
}

/// Storage that keeps counters and bans in process memory.
///
/// Only coordinates the tasks of a single process; use a shared backend when
/// several instances sit behind one load balancer.
#[derive(Debug)]
pub struct InMemoryStorage {
    counters: DashMap<String, WindowCounter>,
    bans: DashMap<String, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            bans: DashMap::new(),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Current value of an unexpired counter.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.counters
            .get(key)
            .filter(|c| !c.is_expired(now))
            .map(|c| c.count)
    }

    /// Number of stored counters, expired ones included until swept.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Drop every expired counter and ban.
    pub fn sweep_expired(&self) {
        let now = self.clock.now();
        self.counters.retain(|_, c| !c.is_expired(now));
        self.bans.retain(|_, expires_at| *expires_at > now);
    }

    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL == 0 {
            self.sweep_expired();
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageStrategy for InMemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn increment(
        &self,
        ctx: &OpContext,
        key: &str,
        window: Duration,
    ) -> Result<u64, StorageError> {
        ctx.check()?;

        let now = self.clock.now();
        let count = {
            let mut counter = self
                .counters
                .entry(key.to_string())
                .or_insert_with(|| WindowCounter::new(now, window));
            if counter.is_expired(now) {
                *counter = WindowCounter::new(now, window);
            }
            counter.count += 1;
            counter.expires_at = expiry(now, window);
            counter.count
        };

        trace!(key = %key, count = count, "Incremented in-memory counter");
        self.record_write();
        Ok(count)
    }

    async fn set_ban(
        &self,
        ctx: &OpContext,
        key: &str,
        duration: Duration,
    ) -> Result<(), StorageError> {
        ctx.check()?;
        self.bans
            .insert(key.to_string(), expiry(self.clock.now(), duration));
        self.record_write();
        Ok(())
    }

    async fn is_banned(&self, ctx: &OpContext, key: &str) -> Result<bool, StorageError> {
        ctx.check()?;
        let now = self.clock.now();
        Ok(self.bans.get(key).is_some_and(|expires_at| *expires_at > now))
    }

    async fn ban_reset(&self, ctx: &OpContext, key: &str) -> Result<Duration, StorageError> {
        ctx.check()?;
        let now = self.clock.now();
        let remaining = self
            .bans
            .get(key)
            .and_then(|expires_at| (*expires_at - now).to_std().ok())
            .unwrap_or(Duration::ZERO);
        Ok(remaining)
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.counters.clear();
        self.bans.clear();
        Ok(())
    }
}
