//! Audit-logging decorator for [`KeyRegistry`] implementations.
//!
//! Wraps any registry to append an [`AuditEntry`](crate::audit::AuditEntry)
//! for every key lifecycle operation, without modifying the underlying store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{KeyRecord, KeyRegistry};
use crate::{
    audit::{AuditAction, AuditDecision, AuditLog, NewAuditEntry},
    error::{StorageError, StorageResult},
    types::PrincipalId,
};

/// Decorator that records key lifecycle events in an [`AuditLog`].
///
/// Registration, revocation and rotation are audited whether they succeed
/// or fail. Lookups and `last_used_at` touches are not: authentication
/// decisions are audited by the authenticator itself.
///
/// If the audit append fails the operation's outcome is still applied to the
/// inner registry, but the audit error is returned so the caller cannot
/// mistake an unrecorded change for a recorded one.
///
/// # Usage
///
/// ```no_run
/// use sentra_common_storage::audit::MemoryAuditLog;
/// use sentra_common_storage::keys::{AuditedKeyRegistry, MemoryKeyRegistry};
///
/// let registry = AuditedKeyRegistry::new(MemoryKeyRegistry::new(), MemoryAuditLog::new(), "operator");
/// ```
pub struct AuditedKeyRegistry<R, L> {
    inner: R,
    log: L,
    actor: Arc<str>,
}

impl<R, L> AuditedKeyRegistry<R, L>
where
    R: KeyRegistry,
    L: AuditLog,
{
    /// Creates a new audited registry wrapping the given registry and log.
    pub fn new(inner: R, log: L, actor: impl Into<Arc<str>>) -> Self {
        Self { inner, log, actor: actor.into() }
    }

    /// Returns a reference to the inner registry.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn record<T>(
        &self,
        action: AuditAction,
        public_key: &str,
        res: StorageResult<T>,
        extra: &[(&str, &str)],
    ) -> StorageResult<T> {
        let (decision, reason) = match &res {
            Ok(_) => (AuditDecision::Completed, "ok"),
            Err(e) => (AuditDecision::Denied, reason_code(e)),
        };

        let mut entry = NewAuditEntry::builder()
            .actor(self.actor.to_string())
            .action(action)
            .decision(decision)
            .reason_code(reason)
            .build()
            .with_metadata("public_key", public_key);
        for (k, v) in extra {
            entry = entry.with_metadata(*k, *v);
        }

        self.log.append(entry).await?;
        res
    }
}

fn reason_code(err: &StorageError) -> &'static str {
    match err {
        StorageError::NotFound { .. } => "not_found",
        StorageError::AlreadyExists { .. } => "already_exists",
        StorageError::InvalidRecord { .. } => "invalid_record",
        _ => "storage_error",
    }
}

#[async_trait]
impl<R, L> KeyRegistry for AuditedKeyRegistry<R, L>
where
    R: KeyRegistry,
    L: AuditLog,
{
    async fn register(&self, record: &KeyRecord) -> StorageResult<()> {
        let res = self.inner.register(record).await;
        self.record(
            AuditAction::RegisterKey,
            &record.public_key,
            res,
            &[("principal_id", record.principal_id.as_str()), ("device", record.device_label.as_str())],
        )
        .await
    }

    async fn lookup(&self, public_key: &str) -> StorageResult<Option<KeyRecord>> {
        self.inner.lookup(public_key).await
    }

    async fn revoke(&self, public_key: &str, reason: Option<&str>) -> StorageResult<()> {
        let res = self.inner.revoke(public_key, reason).await;
        self.record(AuditAction::RevokeKey, public_key, res, &[("reason", reason.unwrap_or(""))])
            .await
    }

    async fn touch_last_used(&self, public_key: &str, at: DateTime<Utc>) -> StorageResult<()> {
        self.inner.touch_last_used(public_key, at).await
    }

    async fn list_for_principal(&self, principal: &PrincipalId) -> StorageResult<Vec<KeyRecord>> {
        self.inner.list_for_principal(principal).await
    }

    async fn rotate(&self, old_public_key: &str, new_record: &KeyRecord) -> StorageResult<()> {
        let res = self.inner.rotate(old_public_key, new_record).await;
        self.record(
            AuditAction::RotateKey,
            old_public_key,
            res,
            &[
                ("new_public_key", new_record.public_key.as_str()),
                ("principal_id", new_record.principal_id.as_str()),
            ],
        )
        .await
    }
}
