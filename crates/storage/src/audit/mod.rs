//! Append-only, tamper-evident audit log.
//!
//! Every privileged decision (authentications, key lifecycle events,
//! credential requests and approvals) is recorded as an [`AuditEntry`].
//! The only write path is [`AuditLog::append`]: there is no update or delete
//! on any layer, and sealed entries expose read-only accessors.
//!
//! # Architecture
//!
//! - [`MemoryAuditLog`]: in-process log for tests.
//! - [`FileAuditLog`]: one JSON object per line, `fsync`ed before `append` returns, hash-chained
//!   and resumed from the file tail on open.
//! - [`TracingAuditLog`]: decorator that mirrors each sealed entry as a structured `tracing`
//!   event for log aggregation.
//!
//! # Usage
//!
//! ```
//! use sentra_common_storage::audit::{
//!     AuditAction, AuditDecision, AuditLog, MemoryAuditLog, NewAuditEntry,
//! };
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let log = MemoryAuditLog::new();
//! let entry = log
//!     .append(
//!         NewAuditEntry::builder()
//!             .actor("alice")
//!             .action(AuditAction::Authenticate)
//!             .decision(AuditDecision::Allowed)
//!             .reason_code("ok")
//!             .build(),
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(entry.id(), 1);
//! # });
//! ```

mod chain;
mod entry;
mod file;
mod memory;
mod summary;

use std::sync::Arc;

use async_trait::async_trait;
pub use chain::{AuditChainError, ChainHead, GENESIS_HASH, verify_chain, verify_next};
pub use entry::{AuditAction, AuditDecision, AuditEntry, NewAuditEntry};
pub use file::{FileAuditLog, export, read_entries};
pub use memory::MemoryAuditLog;
pub use summary::{AuditSummary, DecisionCounts, SuspiciousPattern};

use crate::error::StorageResult;

/// Trait for audit log backends.
///
/// # Durability
///
/// `append` returns only after the entry is durable for the backend. Callers
/// that gate a response on the audit write (the authenticator and broker)
/// treat any error as fatal for that request.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Seals and appends an entry, returning the sealed form.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::StorageError) when the entry could not be made durable.
    /// Nothing is appended in that case.
    async fn append(&self, entry: NewAuditEntry) -> StorageResult<AuditEntry>;
}

#[async_trait]
impl<L: AuditLog + ?Sized> AuditLog for Arc<L> {
    async fn append(&self, entry: NewAuditEntry) -> StorageResult<AuditEntry> {
        (**self).append(entry).await
    }
}

/// Audit log decorator that emits a structured `tracing` event for every
/// sealed entry.
///
/// Events are emitted at `INFO` level after the inner append succeeds.
///
/// Field mapping:
/// - `audit.id`: sequence number
/// - `audit.actor`: who performed the action
/// - `audit.action`: the operation (e.g., "credential_request")
/// - `audit.decision`: "allowed", "denied", ...
/// - `audit.reason`: stable reason code
/// - `audit.metadata`: additional context as `k=v` pairs
#[derive(Debug, Clone)]
pub struct TracingAuditLog<L> {
    inner: L,
}

impl<L: AuditLog> TracingAuditLog<L> {
    /// Wraps `inner`.
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    /// Returns a reference to the inner log.
    pub fn inner(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L: AuditLog> AuditLog for TracingAuditLog<L> {
    async fn append(&self, entry: NewAuditEntry) -> StorageResult<AuditEntry> {
        let sealed = match self.inner.append(entry).await {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::error!(error = %e, "audit append failed");
                return Err(e);
            },
        };

        let metadata_str =
            sealed.metadata().iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(", ");

        tracing::info!(
            audit.id = sealed.id(),
            audit.actor = %sealed.actor(),
            audit.action = %sealed.action(),
            audit.decision = %sealed.decision(),
            audit.reason = %sealed.reason_code(),
            audit.metadata = %metadata_str,
            "audit_event"
        );
        Ok(sealed)
    }
}
