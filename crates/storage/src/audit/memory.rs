//! In-memory audit log.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AuditEntry, AuditLog, ChainHead, NewAuditEntry};
use crate::error::StorageResult;

#[derive(Debug, Default)]
struct MemoryState {
    head: ChainHead,
    entries: Vec<AuditEntry>,
}

/// In-memory implementation of [`AuditLog`].
///
/// Entries are chained exactly as in the file backend, so
/// [`verify_chain`](super::verify_chain) works on [`Self::entries`].
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditLog {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryAuditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of every sealed entry in append order.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.state.lock().entries.clone()
    }

    /// Returns the number of entries appended.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if nothing was appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, entry: NewAuditEntry) -> StorageResult<AuditEntry> {
        let mut state = self.state.lock();
        let sealed = AuditEntry::seal(state.head.last_id + 1, entry, &state.head.last_hash);
        state.head.advance(&sealed);
        state.entries.push(sealed.clone());
        Ok(sealed)
    }
}
