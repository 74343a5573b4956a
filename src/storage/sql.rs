//! Pieces shared by the relational backends.
//!
//! Each relational backend keeps its own SQL; the expiry arithmetic and the
//! expired-row sweep schedule are shared.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ratelimit::saturating_add;

/// `now + ttl` as a database timestamp.
pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    saturating_add(now, ttl)
}

/// Count after one increment of a locked row.
///
/// A row whose expiry has passed (or was never set) belongs to a finished
/// window and starts over at 1.
pub(crate) fn next_count(count: i32, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i32 {
    match expires_at {
        Some(expires_at) if expires_at >= now => count.saturating_add(1),
        _ => 1,
    }
}

/// Number of counter increments between deletes of expired rows.
pub(crate) const SWEEP_INTERVAL: u64 = 512;

/// Counts writes and says when the expired rows are due for deletion.
#[derive(Debug, Default)]
pub(crate) struct SweepSchedule {
    writes: AtomicU64,
}

impl SweepSchedule {
    /// Record one write. True on every `SWEEP_INTERVAL`th call.
    pub(crate) fn record_write(&self) -> bool {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        writes % SWEEP_INTERVAL == 0
    }
}

/// Time left on a ban row, zero once it has lapsed.
pub(crate) fn remaining(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    expires_at
        .and_then(|expires_at| (expires_at - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}
