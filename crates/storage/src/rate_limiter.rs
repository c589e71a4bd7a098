//! Sliding-window rate limiting keyed by principal.
//!
//! Provides a [`RateLimiter`] trait and a [`SlidingWindowLimiter`]
//! implementation that keeps an exact log of accepted request instants per
//! key. A request is accepted while fewer than `max_requests` accepted
//! requests fall inside the trailing `window`.
//!
//! # Concurrency
//!
//! Each key lives in its own [`DashMap`] entry, so checks for different
//! principals contend only at shard granularity and never on a global lock.
//! The per-key log is capped at `max_requests` entries, which bounds memory
//! per principal.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use sentra_common_storage::rate_limiter::{RateLimitConfig, RateLimiter, SlidingWindowLimiter};
//!
//! let limiter = SlidingWindowLimiter::new(RateLimitConfig::new(2, Duration::from_secs(60)));
//! assert!(limiter.check("alice").is_ok());
//! assert!(limiter.check("alice").is_ok());
//! assert!(limiter.check("alice").is_err());
//! // Other principals are unaffected
//! assert!(limiter.check("bob").is_ok());
//! ```

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::error::{StorageError, StorageResult};

/// Default number of requests accepted per window.
pub const DEFAULT_MAX_REQUESTS: u32 = 1000;

/// Default window length (one hour).
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Configuration for a sliding-window rate limit.
///
/// Deserializes from `{ max_requests, per }` where `per` is a humantime
/// duration string such as `"1h"` or `"30s"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum accepted requests inside one window.
    max_requests: u32,
    /// Window length.
    #[serde(with = "humantime_serde")]
    per: Duration,
}

impl RateLimitConfig {
    /// Creates a new rate limit configuration.
    ///
    /// # Arguments
    ///
    /// * `max_requests` - Requests accepted per window (must be >= 1)
    /// * `per` - Window length (must be non-zero)
    ///
    /// # Panics
    ///
    /// Panics if `max_requests` or `per` is zero.
    #[must_use]
    pub fn new(max_requests: u32, per: Duration) -> Self {
        assert!(max_requests >= 1, "max_requests must be at least 1");
        assert!(!per.is_zero(), "window must be non-zero");
        Self { max_requests, per }
    }

    /// Returns the number of requests accepted per window.
    #[must_use]
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Returns the window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.per
    }

    /// Validates a deserialized configuration, which bypasses [`Self::new`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidRecord`] when either field is zero.
    pub fn validate(&self) -> StorageResult<()> {
        if self.max_requests == 0 {
            return Err(StorageError::invalid_record("max_requests must be at least 1"));
        }
        if self.per.is_zero() {
            return Err(StorageError::invalid_record("rate limit window must be non-zero"));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests: DEFAULT_MAX_REQUESTS, per: DEFAULT_WINDOW }
    }
}

/// Per-key rate limiting.
pub trait RateLimiter: Send + Sync {
    /// Counts one request for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RateLimitExceeded`] with a `retry_after` hint
    /// when the key is over its limit. A rejected request is not counted.
    fn check(&self, key: &str) -> StorageResult<()>;
}

impl<L: RateLimiter + ?Sized> RateLimiter for std::sync::Arc<L> {
    fn check(&self, key: &str) -> StorageResult<()> {
        (**self).check(key)
    }
}

/// Accepted-request log for one key.
#[derive(Debug, Default)]
struct WindowLog {
    accepted: VecDeque<Instant>,
    /// Window of the most recent check; used by sweeps.
    window: Duration,
}

impl WindowLog {
    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.accepted.front()
            && now.saturating_duration_since(*oldest) >= window
        {
            self.accepted.pop_front();
        }
    }

    /// Records `now` if under the limit, otherwise returns the time until the
    /// oldest entry leaves the window.
    fn try_acquire(&mut self, now: Instant, config: RateLimitConfig) -> Result<(), Duration> {
        self.window = config.per;
        self.evict_expired(now, config.per);

        if self.accepted.len() < config.max_requests as usize {
            self.accepted.push_back(now);
            return Ok(());
        }

        let retry_after = self
            .accepted
            .front()
            .map(|oldest| config.per.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(config.per);
        Err(retry_after)
    }
}

/// Snapshot of rate limiter metrics.
#[derive(Debug, Clone, Default)]
pub struct RateLimitMetricsSnapshot {
    /// Total requests that were allowed through.
    pub allowed: u64,
    /// Total requests that were rejected.
    pub rejected: u64,
    /// Keys currently tracked.
    pub tracked_keys: usize,
}

/// Exact sliding-window limiter with one log per key.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    logs: DashMap<String, WindowLog>,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl SlidingWindowLimiter {
    /// Creates a new limiter applying `config` to every key.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            logs: DashMap::new(),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Returns the default configuration applied by [`RateLimiter::check`].
    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Counts one request for `key` under an explicit limit.
    ///
    /// Used where the limit depends on the request (per-rule limits); callers
    /// must namespace `key` so different limits never share a log.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RateLimitExceeded`] when over the limit.
    pub fn check_with_limit(&self, key: &str, config: RateLimitConfig) -> StorageResult<()> {
        self.check_at(key, config, Instant::now())
    }

    /// Like [`Self::check_with_limit`] with an explicit clock reading.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RateLimitExceeded`] when over the limit.
    pub fn check_at(&self, key: &str, config: RateLimitConfig, now: Instant) -> StorageResult<()> {
        let outcome = self.logs.entry(key.to_owned()).or_default().try_acquire(now, config);

        match outcome {
            Ok(()) => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Err(retry_after) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    key,
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "rate limit exceeded"
                );
                Err(StorageError::rate_limit_exceeded(retry_after))
            },
        }
    }

    /// Drops logs whose entries have all left the window.
    ///
    /// Returns the number of keys removed. Call periodically to keep idle
    /// principals from accumulating.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.logs.len();
        self.logs.retain(|_, log| {
            let window = log.window;
            log.evict_expired(now, window);
            !log.accepted.is_empty()
        });
        before.saturating_sub(self.logs.len())
    }

    /// Returns a snapshot of the limiter metrics.
    #[must_use]
    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            tracked_keys: self.logs.len(),
        }
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check(&self, key: &str) -> StorageResult<()> {
        self.check_with_limit(key, self.config)
    }
}
