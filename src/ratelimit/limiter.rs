//! Core rate limiter implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};

use super::clock::{saturating_add, Clock, SystemClock};
use super::identity::IdentityKey;
use crate::config::RateLimitingConfig;
use crate::error::{Result, TollgateError};
use crate::storage::{OpContext, StorageStrategy};

/// Reason given for every deny, whether the identity was already banned or
/// has just gone over its quota.
pub const QUOTA_EXCEEDED_MESSAGE: &str =
    "You have reached the maximum number of requests or actions allowed within a certain time frame";

/// Length of a counting window. Windows are aligned to Unix seconds.
const WINDOW: Duration = Duration::from_secs(1);

/// The outcome of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Human-readable explanation; never contains a raw token
    pub reason: String,
    /// When the client may expect capacity again
    pub reset_time: DateTime<Utc>,
    /// Quota that applied to this identity
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
}

impl Decision {
    /// Time from `now` until `reset_time`, zero if already past.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_time - now).to_std().unwrap_or(Duration::ZERO)
    }

    fn denied(limit: u64, reset_time: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            reason: QUOTA_EXCEEDED_MESSAGE.to_string(),
            reset_time,
            limit,
            remaining: 0,
        }
    }
}

/// The rate limiting decision engine.
///
/// Holds no mutable state of its own: all coordination between concurrent
/// checks happens in the storage backend, so one instance can be shared
/// behind an `Arc` by every request handler.
pub struct RateLimiter {
    /// Counter and ban storage
    storage: Arc<dyn StorageStrategy>,
    /// Time source for window keys and reset times
    clock: Arc<dyn Clock>,
    /// Quota for IP identities and tokens without an override
    default_limit: u64,
    /// Per-token quota overrides, keyed by raw token
    token_limits: HashMap<String, u64>,
    /// How long an identity stays banned after going over quota
    block_duration: Duration,
    /// Deadline applied to the storage calls of one check
    storage_timeout: Duration,
    closed: AtomicBool,
}

impl RateLimiter {
    /// Create a rate limiter that reads the system clock.
    pub fn new(config: &RateLimitingConfig, storage: Arc<dyn StorageStrategy>) -> Self {
        Self::with_clock(config, storage, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &RateLimitingConfig,
        storage: Arc<dyn StorageStrategy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            clock,
            default_limit: config.default_limit,
            token_limits: config.token_limit_table(),
            block_duration: config.block_duration(),
            storage_timeout: config.storage_timeout(),
            closed: AtomicBool::new(false),
        }
    }

    /// Deadline callers should give each check.
    pub fn storage_timeout(&self) -> Duration {
        self.storage_timeout
    }

    pub fn storage_name(&self) -> &'static str {
        self.storage.name()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Quota for a request carrying `token` (empty for anonymous requests).
    pub fn limit_for(&self, token: &str) -> u64 {
        if token.is_empty() {
            return self.default_limit;
        }
        self.token_limits
            .get(token)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Check and count one request.
    ///
    /// The identity is the token when `token` is non-empty, otherwise `ip`.
    /// Storage failures are returned as errors, never as an allow or a deny.
    pub async fn check(&self, ctx: &OpContext, ip: &str, token: &str) -> Result<Decision> {
        let identity = IdentityKey::resolve(ip, token);
        let limit = self.limit_for(token);
        let now = self.clock.now();

        let window_key = identity.window_key(now.timestamp());
        let ban_key = identity.ban_key();

        trace!(identity = %identity, key = %window_key, limit = limit, "Checking rate limit");

        let banned = self
            .storage
            .is_banned(ctx, &ban_key)
            .await
            .map_err(TollgateError::BanLookup)?;
        if banned {
            debug!(identity = %identity, "Identity is banned");
            let reset_time = self.ban_reset_time(ctx, &ban_key, now).await;
            return Ok(Decision::denied(limit, reset_time));
        }

        let count = self
            .storage
            .increment(ctx, &window_key, WINDOW)
            .await
            .map_err(TollgateError::Increment)?;

        if count > limit {
            info!(
                identity = %identity,
                count = count,
                limit = limit,
                block_secs = self.block_duration.as_secs(),
                "Rate limit exceeded, banning identity"
            );
            // The deny stands whether or not the ban is recorded.
            if let Err(e) = self
                .storage
                .set_ban(ctx, &ban_key, self.block_duration)
                .await
            {
                warn!(identity = %identity, error = %e, "Failed to set ban");
            }
            return Ok(Decision::denied(limit, saturating_add(now, self.block_duration)));
        }

        Ok(Decision {
            allowed: true,
            reason: format!(
                "Request allowed for {} ({}/{} requests)",
                identity, count, limit
            ),
            reset_time: saturating_add(now, WINDOW),
            limit,
            remaining: limit.saturating_sub(count),
        })
    }

    /// Exact time left on the ban for this identity, zero if not banned.
    pub async fn ban_reset(&self, ctx: &OpContext, ip: &str, token: &str) -> Result<Duration> {
        let identity = IdentityKey::resolve(ip, token);
        let remaining = self.storage.ban_reset(ctx, &identity.ban_key()).await?;
        Ok(remaining)
    }

    /// Reset time for an identity that was already banned.
    ///
    /// Uses the ban's real remaining time. That lookup is advisory, so a
    /// failure falls back to a full block duration from now.
    async fn ban_reset_time(&self, ctx: &OpContext, ban_key: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.storage.ban_reset(ctx, ban_key).await {
            Ok(remaining) if !remaining.is_zero() => saturating_add(now, remaining),
            Ok(_) => saturating_add(now, self.block_duration),
            Err(e) => {
                debug!(error = %e, "Ban reset lookup failed, assuming full block duration");
                saturating_add(now, self.block_duration)
            }
        }
    }

    /// Release the storage backend. Later calls do nothing.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(backend = self.storage.name(), "Closing storage backend");
        self.storage.close().await.map_err(|e| {
            error!(error = %e, "Failed to close storage backend");
            TollgateError::Storage(e)
        })
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.storage.name())
            .field("default_limit", &self.default_limit)
            .field("token_overrides", &self.token_limits.len())
            .field("block_duration", &self.block_duration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenLimit;
    use crate::error::StorageError;
    use crate::ratelimit::{hash_token, ManualClock};
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    const START: i64 = 1_700_000_000;

    fn test_config(default_limit: u64) -> RateLimitingConfig {
        RateLimitingConfig {
            default_limit,
            token_limits: vec![TokenLimit {
                token: "abc123".to_string(),
                limit: 2,
            }],
            block_duration_secs: 10,
            storage_timeout_ms: 1000,
        }
    }

    fn create_test_limiter(
        default_limit: u64,
    ) -> (RateLimiter, Arc<InMemoryStorage>, ManualClock) {
        let clock = ManualClock::at_epoch_secs(START);
        clock.advance(Duration::from_millis(100));
        let storage = Arc::new(InMemoryStorage::with_clock(Arc::new(clock.clone())));
        let limiter = RateLimiter::with_clock(
            &test_config(default_limit),
            storage.clone(),
            Arc::new(clock.clone()),
        );
        (limiter, storage, clock)
    }

    /// In-memory storage with switchable failures.
    #[derive(Default)]
    struct FlakyStorage {
        inner: InMemoryStorage,
        fail_is_banned: bool,
        fail_increment: bool,
        fail_set_ban: bool,
        fail_ban_reset: bool,
    }

    fn injected() -> StorageError {
        StorageError::Connection("injected failure".to_string())
    }

    #[async_trait]
    impl StorageStrategy for FlakyStorage {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn increment(
            &self,
            ctx: &OpContext,
            key: &str,
            window: Duration,
        ) -> std::result::Result<u64, StorageError> {
            if self.fail_increment {
                return Err(injected());
            }
            self.inner.increment(ctx, key, window).await
        }

        async fn set_ban(
            &self,
            ctx: &OpContext,
            key: &str,
            duration: Duration,
        ) -> std::result::Result<(), StorageError> {
            if self.fail_set_ban {
                return Err(injected());
            }
            self.inner.set_ban(ctx, key, duration).await
        }

        async fn is_banned(
            &self,
            ctx: &OpContext,
            key: &str,
        ) -> std::result::Result<bool, StorageError> {
            if self.fail_is_banned {
                return Err(injected());
            }
            self.inner.is_banned(ctx, key).await
        }

        async fn ban_reset(
            &self,
            ctx: &OpContext,
            key: &str,
        ) -> std::result::Result<Duration, StorageError> {
            if self.fail_ban_reset {
                return Err(injected());
            }
            self.inner.ban_reset(ctx, key).await
        }

        async fn close(&self) -> std::result::Result<(), StorageError> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_ip_quota_then_ban_then_recovery() {
        let (limiter, storage, clock) = create_test_limiter(5);
        let ctx = OpContext::background();

        for expected_remaining in [4, 3, 2, 1, 0] {
            let decision = limiter.check(&ctx, "1.2.3.4", "").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.limit, 5);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let decision = limiter.check(&ctx, "1.2.3.4", "").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reason, QUOTA_EXCEEDED_MESSAGE);
        assert!(storage.is_banned(&ctx, "ban:ip:1.2.3.4").await.unwrap());

        clock.advance(Duration::from_secs(10));
        let decision = limiter.check(&ctx, "1.2.3.4", "").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_ban_outlasts_window() {
        let (limiter, _storage, clock) = create_test_limiter(1);
        let ctx = OpContext::background();

        assert!(limiter.check(&ctx, "1.2.3.4", "").await.unwrap().allowed);
        assert!(!limiter.check(&ctx, "1.2.3.4", "").await.unwrap().allowed);

        for _ in 0..9 {
            clock.advance(Duration::from_secs(1));
            let decision = limiter.check(&ctx, "1.2.3.4", "").await.unwrap();
            assert!(!decision.allowed, "ban must hold for the full block duration");
        }

        clock.advance(Duration::from_secs(1));
        assert!(limiter.check(&ctx, "1.2.3.4", "").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_override_quota() {
        let (limiter, _storage, _clock) = create_test_limiter(5);
        let ctx = OpContext::background();

        let results: Vec<Decision> = vec![
            limiter.check(&ctx, "1.2.3.4", "abc123").await.unwrap(),
            limiter.check(&ctx, "1.2.3.4", "abc123").await.unwrap(),
            limiter.check(&ctx, "1.2.3.4", "abc123").await.unwrap(),
        ];

        assert_eq!(
            results.iter().map(|d| d.allowed).collect::<Vec<_>>(),
            vec![true, true, false]
        );
        assert!(results.iter().all(|d| d.limit == 2));
    }

    #[tokio::test]
    async fn test_unknown_token_uses_default() {
        let (limiter, _storage, _clock) = create_test_limiter(5);
        let ctx = OpContext::background();

        let decision = limiter.check(&ctx, "1.2.3.4", "unknown-token").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.remaining, 4);
        assert_eq!(limiter.limit_for(""), 5);
        assert_eq!(limiter.limit_for("abc123"), 2);
    }

    #[tokio::test]
    async fn test_token_and_ip_do_not_share_counters() {
        let (limiter, storage, clock) = create_test_limiter(5);
        let ctx = OpContext::background();

        limiter.check(&ctx, "1.2.3.4", "").await.unwrap();
        limiter.check(&ctx, "", "1.2.3.4").await.unwrap();
        limiter.check(&ctx, "", "1.2.3.4").await.unwrap();

        let second = clock.now().timestamp();
        assert_eq!(storage.current_count(&format!("ip:1.2.3.4:{}", second)), Some(1));
        assert_eq!(
            storage.current_count(&format!("token:{}:{}", hash_token("1.2.3.4"), second)),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_messages_never_contain_raw_token() {
        let (limiter, _storage, _clock) = create_test_limiter(1);
        let ctx = OpContext::background();
        let token = "super-secret-token";

        let allowed = limiter.check(&ctx, "", token).await.unwrap();
        assert_eq!(
            allowed.reason,
            "Request allowed for token:su**************en (1/1 requests)"
        );

        let denied = limiter.check(&ctx, "", token).await.unwrap();
        assert!(!denied.allowed);
        assert!(!denied.reason.contains(token));
    }

    #[tokio::test]
    async fn test_allow_reason_for_ip() {
        let (limiter, _storage, _clock) = create_test_limiter(5);
        let ctx = OpContext::background();

        let decision = limiter.check(&ctx, "10.0.0.1", "").await.unwrap();
        assert_eq!(decision.reason, "Request allowed for ip:10.0.0.1 (1/5 requests)");
        assert_eq!(decision.reset_time, limiter.now() + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_banned_requests_are_not_counted() {
        let (limiter, storage, _clock) = create_test_limiter(1);
        let ctx = OpContext::background();

        limiter.check(&ctx, "1.2.3.4", "").await.unwrap();
        limiter.check(&ctx, "1.2.3.4", "").await.unwrap();
        let key = format!("ip:1.2.3.4:{}", limiter.now().timestamp());
        assert_eq!(storage.current_count(&key), Some(2));

        for _ in 0..5 {
            assert!(!limiter.check(&ctx, "1.2.3.4", "").await.unwrap().allowed);
        }
        assert_eq!(storage.current_count(&key), Some(2));
    }

    #[tokio::test]
    async fn test_edge_burst_across_second_boundary() {
        let (limiter, _storage, clock) = create_test_limiter(2);
        let ctx = OpContext::background();
        clock.set(DateTime::<Utc>::from_timestamp(START, 999_000_000).unwrap());

        assert!(limiter.check(&ctx, "1.2.3.4", "").await.unwrap().allowed);
        assert!(limiter.check(&ctx, "1.2.3.4", "").await.unwrap().allowed);

        clock.advance(Duration::from_millis(1));
        let decision = limiter.check(&ctx, "1.2.3.4", "").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_deny_reset_time() {
        let (limiter, _storage, clock) = create_test_limiter(1);
        let ctx = OpContext::background();

        limiter.check(&ctx, "1.2.3.4", "").await.unwrap();
        let fresh = limiter.check(&ctx, "1.2.3.4", "").await.unwrap();
        assert_eq!(fresh.reset_time, limiter.now() + chrono::Duration::seconds(10));
        assert_eq!(fresh.retry_after(limiter.now()), Duration::from_secs(10));

        // mid-ban denies report the time actually left
        clock.advance(Duration::from_secs(4));
        let mid_ban = limiter.check(&ctx, "1.2.3.4", "").await.unwrap();
        assert_eq!(mid_ban.reset_time, fresh.reset_time);
        assert_eq!(mid_ban.retry_after(limiter.now()), Duration::from_secs(6));

        let remaining = limiter.ban_reset(&ctx, "1.2.3.4", "").await.unwrap();
        assert_eq!(remaining, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_oversized_block_duration_saturates() {
        let clock = ManualClock::at_epoch_secs(START);
        let storage = Arc::new(InMemoryStorage::with_clock(Arc::new(clock.clone())));
        let config = RateLimitingConfig {
            block_duration_secs: 100_000_000_000_000,
            ..test_config(1)
        };
        let limiter = RateLimiter::with_clock(&config, storage, Arc::new(clock));
        let ctx = OpContext::background();

        assert_ok!(limiter.check(&ctx, "1.2.3.4", "").await);
        let decision = assert_ok!(limiter.check(&ctx, "1.2.3.4", "").await);
        assert!(!decision.allowed);
        assert_eq!(decision.reset_time, DateTime::<Utc>::MAX_UTC);

        let decision = assert_ok!(limiter.check(&ctx, "1.2.3.4", "").await);
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_ban_reset_lookup_failure_falls_back() {
        let storage = Arc::new(FlakyStorage {
            fail_ban_reset: true,
            ..FlakyStorage::default()
        });
        let limiter = RateLimiter::new(&test_config(1), storage.clone());
        let ctx = OpContext::background();

        storage.set_ban(&ctx, "ban:ip:1.2.3.4", Duration::from_secs(3)).await.unwrap();
        let before = Utc::now();
        let decision = limiter.check(&ctx, "1.2.3.4", "").await.unwrap();

        assert!(!decision.allowed);
        assert!(decision.reset_time >= before + chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn test_ban_write_failure_still_denies() {
        let storage = Arc::new(FlakyStorage {
            fail_set_ban: true,
            ..FlakyStorage::default()
        });
        let limiter = RateLimiter::new(&test_config(1), storage);
        let ctx = OpContext::background();

        assert!(limiter.check(&ctx, "1.2.3.4", "").await.unwrap().allowed);
        let decision = assert_ok!(limiter.check(&ctx, "1.2.3.4", "").await);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, QUOTA_EXCEEDED_MESSAGE);
    }

    #[tokio::test]
    async fn test_storage_errors_propagate() {
        let limiter = RateLimiter::new(
            &test_config(5),
            Arc::new(FlakyStorage {
                fail_is_banned: true,
                ..FlakyStorage::default()
            }),
        );
        let err = assert_err!(limiter.check(&OpContext::background(), "1.2.3.4", "").await);
        assert!(matches!(err, TollgateError::BanLookup(_)));

        let limiter = RateLimiter::new(
            &test_config(5),
            Arc::new(FlakyStorage {
                fail_increment: true,
                ..FlakyStorage::default()
            }),
        );
        let err = assert_err!(limiter.check(&OpContext::background(), "", "abc123").await);
        assert!(matches!(err, TollgateError::Increment(_)));
        assert!(!err.to_string().contains("abc123"));
    }

    #[tokio::test]
    async fn test_cancelled_check_is_an_error() {
        let (limiter, _storage, _clock) = create_test_limiter(5);
        let ctx = OpContext::background();
        ctx.cancel();

        let err = limiter.check(&ctx, "1.2.3.4", "").await.unwrap_err();
        assert!(matches!(err, TollgateError::BanLookup(StorageError::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_allow_exactly_quota() {
        let clock = ManualClock::at_epoch_secs(START);
        let storage = Arc::new(FlakyStorage {
            inner: InMemoryStorage::with_clock(Arc::new(clock.clone())),
            // keep every request on the increment path
            fail_set_ban: true,
            ..FlakyStorage::default()
        });
        let limiter = Arc::new(RateLimiter::with_clock(
            &test_config(10),
            storage.clone(),
            Arc::new(clock.clone()),
        ));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .check(&OpContext::background(), "1.2.3.4", "")
                        .await
                        .unwrap()
                })
            })
            .collect();

        let decisions: Vec<Decision> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let allowed = decisions.iter().filter(|d| d.allowed).count();
        assert_eq!(allowed, 10);
        assert_eq!(decisions.len() - allowed, 40);
        assert_eq!(
            storage.inner.current_count(&format!("ip:1.2.3.4:{}", START)),
            Some(50)
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (limiter, _storage, _clock) = create_test_limiter(5);
        assert!(limiter.close().await.is_ok());
        assert!(limiter.close().await.is_ok());
    }
}
