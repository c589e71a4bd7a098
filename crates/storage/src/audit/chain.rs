//! Hash chaining for tamper evidence.
//!
//! Each entry stores `hash = SHA-256(prev_hash ‖ encode(fields))` in hex,
//! where `encode` writes every field in declaration order, fixed-width
//! integers big-endian and strings length-prefixed. Editing, removing or
//! reordering any entry breaks the link to every later entry.

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::entry::{AuditEntry, SealedFields};

/// `prev_hash` of the first entry in a log.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Position of the newest entry in a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    /// Id of the newest entry (0 for an empty chain).
    pub last_id: u64,
    /// Hash of the newest entry ([`GENESIS_HASH`] for an empty chain).
    pub last_hash: String,
}

impl Default for ChainHead {
    fn default() -> Self {
        Self { last_id: 0, last_hash: GENESIS_HASH.to_owned() }
    }
}

impl ChainHead {
    /// Advances the head past `entry`.
    pub(crate) fn advance(&mut self, entry: &AuditEntry) {
        self.last_id = entry.id();
        self.last_hash = entry.hash().to_owned();
    }
}

/// Integrity violation found while verifying a chain.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditChainError {
    /// A line of the log file is not a valid entry.
    #[error("malformed audit entry at line {line}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// The parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// Ids are not consecutive.
    #[error("audit entry id {found} out of sequence (expected {expected})")]
    OutOfSequence {
        /// The id that should have followed.
        expected: u64,
        /// The id actually found.
        found: u64,
    },

    /// `prev_hash` does not match the previous entry's hash.
    #[error("audit entry {id} does not link to its predecessor")]
    BrokenLink {
        /// Id of the entry whose link is broken.
        id: u64,
    },

    /// The stored hash does not match the entry contents.
    #[error("audit entry {id} hash mismatch")]
    HashMismatch {
        /// Id of the altered entry.
        id: u64,
    },
}

fn update_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

/// Computes the chain hash of an entry's sealed fields.
pub(crate) fn compute_hash(fields: &SealedFields<'_>) -> String {
    let mut hasher = Sha256::new();
    update_str(&mut hasher, fields.prev_hash);
    hasher.update(fields.id.to_be_bytes());
    update_str(&mut hasher, fields.actor);
    update_str(&mut hasher, fields.action.as_str());
    update_str(&mut hasher, fields.decision.as_str());
    update_str(&mut hasher, fields.reason_code);
    hasher.update(fields.timestamp_unix_ms.to_be_bytes());
    hasher.update((fields.metadata.len() as u64).to_be_bytes());
    for (key, value) in fields.metadata {
        update_str(&mut hasher, key);
        update_str(&mut hasher, value);
    }
    hex::encode(hasher.finalize())
}

/// Checks one entry against the running head and advances it.
///
/// # Errors
///
/// Returns the first integrity violation found in `entry`.
pub fn verify_next(head: &mut ChainHead, entry: &AuditEntry) -> Result<(), AuditChainError> {
    let expected = head.last_id + 1;
    if entry.id() != expected {
        return Err(AuditChainError::OutOfSequence { expected, found: entry.id() });
    }
    if entry.prev_hash() != head.last_hash {
        return Err(AuditChainError::BrokenLink { id: entry.id() });
    }
    if compute_hash(&entry.sealed_fields()) != entry.hash() {
        return Err(AuditChainError::HashMismatch { id: entry.id() });
    }
    head.advance(entry);
    Ok(())
}

/// Verifies a complete chain starting from genesis.
///
/// Returns the head of the verified chain.
///
/// # Errors
///
/// Returns the first integrity violation found.
pub fn verify_chain<'a>(
    entries: impl IntoIterator<Item = &'a AuditEntry>,
) -> Result<ChainHead, AuditChainError> {
    let mut head = ChainHead::default();
    for entry in entries {
        verify_next(&mut head, entry)?;
    }
    Ok(head)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditDecision, NewAuditEntry};

    fn chain(len: u64) -> Vec<AuditEntry> {
        let mut head = ChainHead::default();
        (1..=len)
            .map(|id| {
                let entry = AuditEntry::seal(
                    id,
                    NewAuditEntry::builder()
                        .actor(format!("actor-{id}"))
                        .action(AuditAction::CredentialRequest)
                        .decision(AuditDecision::Completed)
                        .reason_code("ok")
                        .build()
                        .with_metadata("service", "github"),
                    &head.last_hash,
                );
                head.advance(&entry);
                entry
            })
            .collect()
    }

    fn tamper(entry: &AuditEntry, f: impl FnOnce(&mut serde_json::Value)) -> AuditEntry {
        let mut value = serde_json::to_value(entry).unwrap();
        f(&mut value);
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_empty_chain_is_genesis() {
        let head = verify_chain(&Vec::<AuditEntry>::new()).unwrap();
        assert_eq!(head, ChainHead::default());
    }

    #[test]
    fn test_valid_chain_verifies() {
        let entries = chain(5);
        let head = verify_chain(&entries).unwrap();
        assert_eq!(head.last_id, 5);
        assert_eq!(head.last_hash, entries[4].hash());
    }

    #[test]
    fn test_edited_field_detected() {
        let mut entries = chain(3);
        entries[1] = tamper(&entries[1], |v| v["decision"] = serde_json::json!("denied"));
        assert!(matches!(verify_chain(&entries), Err(AuditChainError::HashMismatch { id: 2 })));
    }

    #[test]
    fn test_edited_metadata_detected() {
        let mut entries = chain(3);
        entries[0] = tamper(&entries[0], |v| v["metadata"]["service"] = serde_json::json!("aws"));
        assert!(matches!(verify_chain(&entries), Err(AuditChainError::HashMismatch { id: 1 })));
    }

    #[test]
    fn test_removed_entry_detected() {
        let mut entries = chain(3);
        entries.remove(1);
        assert!(matches!(
            verify_chain(&entries),
            Err(AuditChainError::OutOfSequence { expected: 2, found: 3 })
        ));
    }

    #[test]
    fn test_rehashed_entry_breaks_next_link() {
        let mut entries = chain(3);
        // Re-seal a modified entry so its own hash is consistent
        let forged = AuditEntry::seal(
            2,
            NewAuditEntry::builder()
                .actor("someone-else")
                .action(AuditAction::CredentialRequest)
                .decision(AuditDecision::Completed)
                .reason_code("ok")
                .build(),
            entries[0].hash(),
        );
        entries[1] = forged;
        assert!(matches!(verify_chain(&entries), Err(AuditChainError::BrokenLink { id: 3 })));
    }

    #[test]
    fn test_length_prefix_prevents_field_shifting() {
        let a = AuditEntry::seal(
            1,
            NewAuditEntry::builder()
                .actor("ab")
                .action(AuditAction::Authenticate)
                .decision(AuditDecision::Allowed)
                .reason_code("c")
                .build(),
            GENESIS_HASH,
        );
        let b = tamper(&a, |v| {
            v["actor"] = serde_json::json!("a");
            v["reason_code"] = serde_json::json!("bc");
        });
        assert_ne!(compute_hash(&a.sealed_fields()), compute_hash(&b.sealed_fields()));
    }
}
