//! Envelope replay prevention via (public key, nonce) tracking.
//!
//! The replay guard remembers every nonce accepted from a key until the
//! envelope's timestamp leaves the acceptance window. After that the
//! timestamp check alone rejects the envelope, so the entry can go.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use sentra_common_authn::replay::{InMemoryReplayGuard, ReplayGuard};
//!
//! # async fn example() -> Result<(), sentra_common_authn::AuthError> {
//! let guard = InMemoryReplayGuard::new(100_000);
//! guard.check_and_mark("O2onvM62pC1io6jQKm8Nc2UyFXcd4kOmOsBIoYtZ2ik", "bm9uY2Utbm9uY2Utbm9uY2U", Duration::from_secs(60)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Design
//!
//! - **Atomic**: check and mark are one cache operation, so two concurrent presentations of the
//!   same envelope cannot both succeed.
//! - **Per-entry expiry**: each nonce expires when its envelope's window closes.
//! - **Fails closed**: at capacity the guard refuses new nonces rather than evicting live ones,
//!   since an evicted nonce could be replayed.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use moka::future::Cache;

use crate::error::AuthError;

/// Default number of nonces tracked at once.
pub const DEFAULT_REPLAY_CAPACITY: u64 = 1_000_000;

/// Trait for envelope replay detection.
///
/// Implementations track seen (public key, nonce) pairs and reject
/// duplicates. The guard is responsible for cleaning up expired entries.
#[async_trait]
pub trait ReplayGuard: Send + Sync {
    /// Records `nonce` for `public_key`, failing if it was already recorded.
    ///
    /// # Arguments
    ///
    /// * `public_key` - The envelope's public key
    /// * `nonce` - The envelope's nonce as sent
    /// * `ttl` - How long the pair must be remembered
    ///
    /// # Errors
    ///
    /// - [`AuthError::ReplayDetected`] if the pair was already recorded
    /// - [`AuthError::ReplayGuardSaturated`] if the guard cannot record more pairs
    async fn check_and_mark(&self, public_key: &str, nonce: &str, ttl: Duration) -> Result<(), AuthError>;
}

#[async_trait]
impl<G: ReplayGuard + ?Sized> ReplayGuard for Arc<G> {
    async fn check_and_mark(&self, public_key: &str, nonce: &str, ttl: Duration) -> Result<(), AuthError> {
        (**self).check_and_mark(public_key, nonce, ttl).await
    }
}

/// Per-entry expiry policy that stores the absolute expiration instant.
struct NonceExpiry;

impl moka::Expiry<String, Instant> for NonceExpiry {
    fn expire_after_create(&self, _key: &String, value: &Instant, created_at: Instant) -> Option<Duration> {
        Some(value.saturating_duration_since(created_at))
    }
}

/// In-memory replay guard backed by a [`moka::future::Cache`].
///
/// # Thread Safety
///
/// `InMemoryReplayGuard` is `Send + Sync` and safe for concurrent use from
/// multiple async tasks.
pub struct InMemoryReplayGuard {
    /// Cache mapping `public_key:nonce` to its expiration instant.
    seen: Cache<String, Instant>,
    /// Inserted minus evicted. Over-counts expired entries until moka's
    /// maintenance removes them, never under-counts.
    live: Arc<AtomicU64>,
    capacity: u64,
}

impl std::fmt::Debug for InMemoryReplayGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryReplayGuard")
            .field("entries", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl InMemoryReplayGuard {
    /// Creates a replay guard that tracks at most `capacity` live nonces.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        let live = Arc::new(AtomicU64::new(0));
        let evicted = Arc::clone(&live);
        let seen = Cache::builder()
            .expire_after(NonceExpiry)
            .eviction_listener(move |_key, _value, _cause| {
                evicted.fetch_sub(1, Ordering::AcqRel);
            })
            .build();
        Self { seen, live, capacity }
    }

    /// Number of nonces currently tracked, including expired ones not yet
    /// evicted.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }

    /// Returns `true` if no nonces are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs moka's pending maintenance, evicting expired entries.
    pub async fn sync(&self) {
        self.seen.run_pending_tasks().await;
    }

    async fn has_room(&self) -> bool {
        if self.len() < self.capacity {
            return true;
        }
        // Expired entries still count until maintenance evicts them
        self.seen.run_pending_tasks().await;
        self.len() < self.capacity
    }
}

impl Default for InMemoryReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

#[async_trait]
impl ReplayGuard for InMemoryReplayGuard {
    #[tracing::instrument(skip(self, nonce))]
    async fn check_and_mark(&self, public_key: &str, nonce: &str, ttl: Duration) -> Result<(), AuthError> {
        let key = format!("{public_key}:{nonce}");

        if self.seen.contains_key(&key) {
            return Err(AuthError::ReplayDetected);
        }
        if !self.has_room().await {
            tracing::error!(capacity = self.capacity, "replay guard saturated, rejecting request");
            return Err(AuthError::ReplayGuardSaturated);
        }

        // Counted before insertion so an immediate eviction cannot underflow
        self.live.fetch_add(1, Ordering::AcqRel);
        let expiration = Instant::now() + ttl;
        let entry = self.seen.entry(key).or_insert(expiration).await;
        if entry.is_fresh() {
            Ok(())
        } else {
            self.live.fetch_sub(1, Ordering::AcqRel);
            Err(AuthError::ReplayDetected)
        }
    }
}
