//! Storage trait for key registry operations.
//!
//! The surface is deliberately narrow: register, lookup, revoke, plus the
//! `last_used_at` touch performed by successful authentications. There is no
//! update of key material and no delete.
//!
//! # Usage
//!
//! ```no_run
//! use sentra_common_storage::keys::{KeyRecord, KeyRegistry};
//! use sentra_common_storage::StorageError;
//!
//! async fn enroll<R: KeyRegistry>(registry: &R, record: &KeyRecord) -> Result<(), StorageError> {
//!     registry.register(record).await
//! }
//! ```

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{
    error::{StorageError, StorageResult},
    keys::KeyRecord,
    types::PrincipalId,
};

/// Persistence layer for enrolled device keys.
///
/// # Invariants
///
/// - A public key maps to at most one record, across all revocation states.
/// - `revoked_at`, once set, is never cleared.
/// - Records are never removed.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// Enrolls a new device key.
    ///
    /// # Errors
    ///
    /// - [`StorageError::AlreadyExists`] if the public key was ever registered, even if it has
    ///   since been revoked
    /// - [`StorageError::InvalidRecord`] if the record is already revoked
    async fn register(&self, record: &KeyRecord) -> StorageResult<()>;

    /// Retrieves the record for a public key.
    ///
    /// Returns `Ok(None)` for unknown keys; revoked keys are returned with
    /// `revoked_at` set.
    async fn lookup(&self, public_key: &str) -> StorageResult<Option<KeyRecord>>;

    /// Permanently revokes a key.
    ///
    /// Idempotent: revoking an already-revoked key succeeds without
    /// modifying the original `revoked_at` or reason.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the key was never registered.
    async fn revoke(&self, public_key: &str, reason: Option<&str>) -> StorageResult<()>;

    /// Records a successful authentication with the key.
    ///
    /// Touching a revoked key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the key was never registered.
    async fn touch_last_used(&self, public_key: &str, at: DateTime<Utc>) -> StorageResult<()>;

    /// Lists every record (active and revoked) owned by a principal, ordered
    /// by registration time.
    async fn list_for_principal(&self, principal: &PrincipalId) -> StorageResult<Vec<KeyRecord>>;

    /// Rotates a device key: registers `new_record`, then revokes
    /// `old_public_key` with reason `"key rotation"`.
    ///
    /// The new key is registered first so there is never a window without a
    /// valid key. If revocation fails the new key cannot be deleted (records
    /// are never removed), so it is revoked instead with reason
    /// `"rotation rollback"` and the original error is returned.
    async fn rotate(&self, old_public_key: &str, new_record: &KeyRecord) -> StorageResult<()> {
        self.register(new_record).await?;

        if let Err(e) = self.revoke(old_public_key, Some("key rotation")).await {
            let _rollback = self.revoke(&new_record.public_key, Some("rotation rollback")).await;
            return Err(e);
        }

        Ok(())
    }
}

#[async_trait]
impl<R: KeyRegistry + ?Sized> KeyRegistry for Arc<R> {
    async fn register(&self, record: &KeyRecord) -> StorageResult<()> {
        (**self).register(record).await
    }

    async fn lookup(&self, public_key: &str) -> StorageResult<Option<KeyRecord>> {
        (**self).lookup(public_key).await
    }

    async fn revoke(&self, public_key: &str, reason: Option<&str>) -> StorageResult<()> {
        (**self).revoke(public_key, reason).await
    }

    async fn touch_last_used(&self, public_key: &str, at: DateTime<Utc>) -> StorageResult<()> {
        (**self).touch_last_used(public_key, at).await
    }

    async fn list_for_principal(&self, principal: &PrincipalId) -> StorageResult<Vec<KeyRecord>> {
        (**self).list_for_principal(principal).await
    }
}

/// Applies a registration to a key map, enforcing registry invariants.
pub(crate) fn apply_register(
    keys: &mut HashMap<String, KeyRecord>,
    record: &KeyRecord,
) -> StorageResult<()> {
    if record.revoked_at.is_some() {
        return Err(StorageError::invalid_record("cannot register a revoked key"));
    }
    if record.public_key.is_empty() {
        return Err(StorageError::invalid_record("public key must not be empty"));
    }
    if keys.contains_key(&record.public_key) {
        return Err(StorageError::already_exists(record.public_key.clone()));
    }
    keys.insert(record.public_key.clone(), record.clone());
    Ok(())
}

/// Applies a revocation to a key map. Returns `true` if the map changed.
pub(crate) fn apply_revoke(
    keys: &mut HashMap<String, KeyRecord>,
    public_key: &str,
    reason: Option<&str>,
    at: DateTime<Utc>,
) -> StorageResult<bool> {
    let record = keys.get_mut(public_key).ok_or_else(|| StorageError::not_found(public_key))?;
    if record.revoked_at.is_some() {
        return Ok(false);
    }
    record.revoked_at = Some(at);
    record.revocation_reason = reason.map(str::to_owned);
    Ok(true)
}

/// Applies a `last_used_at` touch. Returns the previous value when the map
/// changed, `None` when the touch was ignored.
pub(crate) fn apply_touch(
    keys: &mut HashMap<String, KeyRecord>,
    public_key: &str,
    at: DateTime<Utc>,
) -> StorageResult<Option<Option<DateTime<Utc>>>> {
    let record = keys.get_mut(public_key).ok_or_else(|| StorageError::not_found(public_key))?;
    if record.revoked_at.is_some() {
        return Ok(None);
    }
    let previous = record.last_used_at;
    if previous.is_some_and(|prev| prev >= at) {
        return Ok(None);
    }
    record.last_used_at = Some(at);
    Ok(Some(previous))
}

pub(crate) fn collect_for_principal(
    keys: &HashMap<String, KeyRecord>,
    principal: &PrincipalId,
) -> Vec<KeyRecord> {
    let mut records: Vec<KeyRecord> =
        keys.values().filter(|r| &r.principal_id == principal).cloned().collect();
    records.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
    records
}

/// In-memory implementation of [`KeyRegistry`].
///
/// # Thread Safety
///
/// Uses [`parking_lot::RwLock`]; lookups (the authentication hot path) take
/// only the read lock.
///
/// # Examples
///
/// ```
/// use sentra_common_storage::keys::{KeyRecord, KeyRegistry, MemoryKeyRegistry};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = MemoryKeyRegistry::new();
///     let record = KeyRecord::builder()
///         .public_key("pk-1")
///         .principal_id("alice")
///         .device_label("laptop")
///         .build();
///
///     registry.register(&record).await?;
///     registry.revoke("pk-1", Some("device lost")).await?;
///
///     let stored = registry.lookup("pk-1").await?.expect("record retained after revocation");
///     assert!(!stored.is_active());
///     Ok(())
/// }
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyRegistry {
    /// Records indexed by public key.
    keys: Arc<RwLock<HashMap<String, KeyRecord>>>,
}

impl MemoryKeyRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of records (active and revoked).
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Returns `true` if no key was ever registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[async_trait]
impl KeyRegistry for MemoryKeyRegistry {
    #[tracing::instrument(skip(self, record), fields(principal = %record.principal_id))]
    async fn register(&self, record: &KeyRecord) -> StorageResult<()> {
        apply_register(&mut self.keys.write(), record)
    }

    #[tracing::instrument(skip(self))]
    async fn lookup(&self, public_key: &str) -> StorageResult<Option<KeyRecord>> {
        Ok(self.keys.read().get(public_key).cloned())
    }

    #[tracing::instrument(skip(self))]
    async fn revoke(&self, public_key: &str, reason: Option<&str>) -> StorageResult<()> {
        apply_revoke(&mut self.keys.write(), public_key, reason, Utc::now()).map(|_| ())
    }

    async fn touch_last_used(&self, public_key: &str, at: DateTime<Utc>) -> StorageResult<()> {
        apply_touch(&mut self.keys.write(), public_key, at).map(|_| ())
    }

    #[tracing::instrument(skip(self))]
    async fn list_for_principal(&self, principal: &PrincipalId) -> StorageResult<Vec<KeyRecord>> {
        Ok(collect_for_principal(&self.keys.read(), principal))
    }
}
