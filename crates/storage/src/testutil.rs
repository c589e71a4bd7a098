//! Shared test utilities for store testing.
//!
//! This module provides test doubles and record factories used by this
//! crate's tests and by the authenticator and broker test suites. It is
//! feature-gated behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! sentra-common-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use sentra_common_storage::testutil::{FailingAuditLog, make_key_record};
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;

use crate::{
    audit::{AuditEntry, AuditLog, MemoryAuditLog, NewAuditEntry},
    error::{StorageError, StorageResult},
    keys::KeyRecord,
};

/// Create a [`KeyRecord`] for `principal` with a deterministic device label.
#[must_use]
pub fn make_key_record(public_key: &str, principal: &str) -> KeyRecord {
    KeyRecord::builder()
        .public_key(public_key)
        .principal_id(principal)
        .device_label(format!("{principal}-device"))
        .build()
}

/// Audit log that can be switched into a failing mode.
///
/// While failing, every `append` returns [`StorageError::Io`] and nothing is
/// recorded. Clones share the switch and the underlying entries.
#[derive(Debug, Clone, Default)]
pub struct FailingAuditLog {
    inner: MemoryAuditLog,
    failing: Arc<AtomicBool>,
    rejected: Arc<AtomicU64>,
}

impl FailingAuditLog {
    /// Creates a log that succeeds until [`Self::set_failing`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns fault injection on or off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Entries successfully appended.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.entries()
    }

    /// Number of appends rejected by fault injection.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditLog for FailingAuditLog {
    async fn append(&self, entry: NewAuditEntry) -> StorageResult<AuditEntry> {
        if self.failing.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::io("injected audit write failure"));
        }
        self.inner.append(entry).await
    }
}

/// Assert that a [`StorageResult`] is a [`StorageError::NotFound`].
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use sentra_common_storage::assert_not_found;
/// use sentra_common_storage::error::{StorageError, StorageResult};
///
/// let result: StorageResult<()> = Err(StorageError::NotFound { key: "missing".into() });
/// assert_not_found!(result);
/// ```
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NotFound { .. })),
            "expected StorageError::NotFound, got: {:?}",
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is a [`StorageError::AlreadyExists`].
#[macro_export]
macro_rules! assert_already_exists {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::AlreadyExists { .. })),
            "expected StorageError::AlreadyExists, got: {:?}",
            $result,
        );
    };
}
