//! Read-through cache over the key registry.
//!
//! Every authentication needs the record for the envelope's public key. The
//! cache keeps recent lookups in memory for a short TTL; that TTL is the
//! upper bound on how long a revocation made directly in the registry can
//! take to reach the authenticator. Revocations made through
//! [`RequestAuthenticator::revoke_key`](crate::RequestAuthenticator::revoke_key)
//! invalidate the entry immediately.
//!
//! # Architecture
//!
//! ```text
//! envelope arrives → public_key
//!                  → check local cache
//!                  → miss? lookup in KeyRegistry
//!                  → found? cache the record (active or revoked)
//!                  → unknown? return None, nothing cached
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fail::fail_point;
use moka::future::Cache;
use sentra_common_storage::{KeyRecord, KeyRegistry, StorageError};

use crate::error::AuthError;

/// Default key cache TTL (bounds revocation propagation).
pub const DEFAULT_KEY_CACHE_TTL: Duration = Duration::from_secs(5);

/// Default maximum number of cached key records.
pub const DEFAULT_KEY_CACHE_CAPACITY: u64 = 10_000;

/// TTL cache of [`KeyRecord`]s keyed by public key.
pub struct KeyCache {
    cache: Cache<String, Arc<KeyRecord>>,
    registry: Arc<dyn KeyRegistry>,
    /// Monotonic generation counter incremented on every invalidation.
    ///
    /// If the generation changes between the start and end of a registry
    /// fetch, the result is returned but not cached.
    invalidation_gen: AtomicU64,
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache").field("entries", &self.cache.entry_count()).finish_non_exhaustive()
    }
}

impl KeyCache {
    /// Creates a cache with the default capacity.
    #[must_use]
    pub fn new(registry: Arc<dyn KeyRegistry>, ttl: Duration) -> Self {
        Self::with_capacity(registry, ttl, DEFAULT_KEY_CACHE_CAPACITY)
    }

    /// Creates a cache with a custom capacity.
    #[must_use]
    pub fn with_capacity(registry: Arc<dyn KeyRegistry>, ttl: Duration, max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).max_capacity(max_capacity).build(),
            registry,
            invalidation_gen: AtomicU64::new(0),
        }
    }

    /// The registry behind the cache.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn KeyRegistry> {
        &self.registry
    }

    /// Returns the record for `public_key`, or `None` if it was never
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyStorage`] if the registry lookup fails.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, public_key: &str) -> Result<Option<Arc<KeyRecord>>, AuthError> {
        if let Some(record) = self.cache.get(public_key).await {
            tracing::debug!(cache = "key", "cache hit");
            return Ok(Some(record));
        }
        tracing::debug!(cache = "key", "cache miss");

        let gen_before = self.invalidation_gen.load(Ordering::Acquire);

        fail_point!("key-cache-before-fetch", |_| {
            Err(AuthError::key_storage(StorageError::internal("injected failure before registry fetch")))
        });
        let Some(record) = self.registry.lookup(public_key).await.map_err(AuthError::key_storage)? else {
            return Ok(None);
        };
        let record = Arc::new(record);

        if self.invalidation_gen.load(Ordering::Acquire) != gen_before {
            tracing::debug!("discarding registry result: invalidation occurred during fetch");
            return Ok(Some(record));
        }

        self.cache.insert(public_key.to_owned(), Arc::clone(&record)).await;
        Ok(Some(record))
    }

    /// Drops the cached record for `public_key`.
    ///
    /// An audit event is emitted at INFO level for compliance tracking.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate(&self, public_key: &str) {
        self.invalidation_gen.fetch_add(1, Ordering::Release);
        self.cache.invalidate(public_key).await;
        tracing::info!(
            audit.action = "invalidate_key_cache",
            audit.resource = %format_args!("key:{public_key}"),
            audit.result = "success",
            "audit_event"
        );
    }

    /// Drops every cached record.
    #[tracing::instrument(skip(self))]
    pub async fn clear_all(&self) {
        let evicted = self.cache.entry_count();
        self.invalidation_gen.fetch_add(1, Ordering::Release);
        self.cache.invalidate_all();
        tracing::info!(
            audit.action = "clear_key_cache",
            audit.resource = "all_keys",
            audit.result = "success",
            audit.evicted = evicted,
            "audit_event"
        );
    }

    /// Approximate number of cached records.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Runs pending cache maintenance.
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use sentra_common_storage::{keys::MemoryKeyRegistry, testutil::make_key_record};

    use super::*;

    fn setup() -> (MemoryKeyRegistry, KeyCache) {
        let registry = MemoryKeyRegistry::new();
        let cache = KeyCache::new(Arc::new(registry.clone()), Duration::from_secs(60));
        (registry, cache)
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_cached() {
        let (registry, cache) = setup();
        assert!(cache.get("pk-1").await.unwrap().is_none());

        registry.register(&make_key_record("pk-1", "alice")).await.unwrap();
        let found = cache.get("pk-1").await.unwrap().expect("registered after miss");
        assert_eq!(found.principal_id.as_str(), "alice");
    }

    #[tokio::test]
    async fn test_cache_hit_serves_stale_record_until_invalidated() {
        let (registry, cache) = setup();
        registry.register(&make_key_record("pk-1", "alice")).await.unwrap();
        assert!(cache.get("pk-1").await.unwrap().unwrap().is_active());

        registry.revoke("pk-1", Some("device lost")).await.unwrap();
        assert!(cache.get("pk-1").await.unwrap().unwrap().is_active(), "served from cache");

        cache.invalidate("pk-1").await;
        assert!(!cache.get("pk-1").await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_ttl_bounds_staleness() {
        let registry = MemoryKeyRegistry::new();
        let cache = KeyCache::new(Arc::new(registry.clone()), Duration::from_millis(50));
        registry.register(&make_key_record("pk-1", "alice")).await.unwrap();
        cache.get("pk-1").await.unwrap();

        registry.revoke("pk-1", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.sync().await;

        assert!(!cache.get("pk-1").await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_clear_all() {
        let (registry, cache) = setup();
        registry.register(&make_key_record("pk-1", "alice")).await.unwrap();
        registry.register(&make_key_record("pk-2", "bob")).await.unwrap();
        cache.get("pk-1").await.unwrap();
        cache.get("pk-2").await.unwrap();
        cache.sync().await;
        assert_eq!(cache.entry_count(), 2);

        cache.clear_all().await;
        cache.sync().await;
        assert_eq!(cache.entry_count(), 0);
    }
}
