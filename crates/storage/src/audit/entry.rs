//! Audit entry types.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Privileged action being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditAction {
    /// A signed control-plane request was authenticated (or rejected).
    Authenticate,
    /// A device key was registered.
    RegisterKey,
    /// A device key was revoked.
    RevokeKey,
    /// A device key was rotated (new registered, old revoked).
    RotateKey,
    /// A worker asked the broker to perform a privileged operation.
    CredentialRequest,
    /// A credential request was parked awaiting an operator.
    ApprovalRequested,
    /// An operator approved or denied a parked request.
    ApprovalResolved,
    /// The policy document was (re)loaded.
    PolicyReload,
}

impl AuditAction {
    /// Returns the wire name of the action.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::RegisterKey => "register_key",
            Self::RevokeKey => "revoke_key",
            Self::RotateKey => "rotate_key",
            Self::CredentialRequest => "credential_request",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalResolved => "approval_resolved",
            Self::PolicyReload => "policy_reload",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded for an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditDecision {
    /// The request passed every check.
    Allowed,
    /// The request was rejected by a check or by policy.
    Denied,
    /// The request is suspended awaiting a decision.
    Pending,
    /// The privileged call was executed and its result released.
    Completed,
    /// The caller went away before the request finished.
    Canceled,
    /// The request failed for an operational reason (upstream, secrets).
    Failed,
}

impl AuditDecision {
    /// Returns the wire name of the decision.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AuditDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit record before it is sealed into the chain.
///
/// # Example
///
/// ```
/// use sentra_common_storage::audit::{AuditAction, AuditDecision, NewAuditEntry};
///
/// let entry = NewAuditEntry::builder()
///     .actor("worker-7")
///     .action(AuditAction::CredentialRequest)
///     .decision(AuditDecision::Denied)
///     .reason_code("policy_denied")
///     .build()
///     .with_metadata("service", "github");
///
/// assert_eq!(entry.metadata.get("service").map(String::as_str), Some("github"));
/// ```
#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct NewAuditEntry {
    /// Identity responsible for the action (principal, worker, operator).
    #[builder(into)]
    pub actor: String,
    /// The action that was performed.
    pub action: AuditAction,
    /// The decision reached.
    pub decision: AuditDecision,
    /// Stable machine-readable reason (e.g. `"ok"`, `"replay_detected"`).
    #[builder(into)]
    pub reason_code: String,
    /// When the decision was made (defaults to now).
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
    /// Additional context; never contains secret material.
    #[builder(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NewAuditEntry {
    /// Adds a metadata field, replacing any previous value for `key`.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A sealed, immutable audit record.
///
/// Fields are only readable. Entries are created exclusively by an
/// [`AuditLog`](super::AuditLog) when appending, which assigns the
/// monotonic `id` and links `prev_hash`/`hash` into the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditEntry {
    id: u64,
    actor: String,
    action: AuditAction,
    decision: AuditDecision,
    reason_code: String,
    timestamp_unix_ms: i64,
    metadata: BTreeMap<String, String>,
    prev_hash: String,
    hash: String,
}

/// The hashed projection of an entry: every field except `hash`.
pub(crate) struct SealedFields<'a> {
    pub(crate) id: u64,
    pub(crate) actor: &'a str,
    pub(crate) action: AuditAction,
    pub(crate) decision: AuditDecision,
    pub(crate) reason_code: &'a str,
    pub(crate) timestamp_unix_ms: i64,
    pub(crate) metadata: &'a BTreeMap<String, String>,
    pub(crate) prev_hash: &'a str,
}

impl AuditEntry {
    /// Seals `entry` as chain element `id` following `prev_hash`.
    pub(crate) fn seal(id: u64, entry: NewAuditEntry, prev_hash: &str) -> Self {
        let mut sealed = Self {
            id,
            actor: entry.actor,
            action: entry.action,
            decision: entry.decision,
            reason_code: entry.reason_code,
            timestamp_unix_ms: entry.timestamp.timestamp_millis(),
            metadata: entry.metadata,
            prev_hash: prev_hash.to_owned(),
            hash: String::new(),
        };
        sealed.hash = super::chain::compute_hash(&sealed.sealed_fields());
        sealed
    }

    pub(crate) fn sealed_fields(&self) -> SealedFields<'_> {
        SealedFields {
            id: self.id,
            actor: &self.actor,
            action: self.action,
            decision: self.decision,
            reason_code: &self.reason_code,
            timestamp_unix_ms: self.timestamp_unix_ms,
            metadata: &self.metadata,
            prev_hash: &self.prev_hash,
        }
    }

    /// Monotonic sequence number, starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identity responsible for the action.
    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// The recorded action.
    #[must_use]
    pub fn action(&self) -> AuditAction {
        self.action
    }

    /// The recorded decision.
    #[must_use]
    pub fn decision(&self) -> AuditDecision {
        self.decision
    }

    /// Stable machine-readable reason code.
    #[must_use]
    pub fn reason_code(&self) -> &str {
        &self.reason_code
    }

    /// Decision time in Unix milliseconds.
    #[must_use]
    pub fn timestamp_unix_ms(&self) -> i64 {
        self.timestamp_unix_ms
    }

    /// Decision time, if representable.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_unix_ms)
    }

    /// Additional context fields.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Hash of the preceding entry (all zeros for the first entry).
    #[must_use]
    pub fn prev_hash(&self) -> &str {
        &self.prev_hash
    }

    /// Hex-encoded SHA-256 over this entry's fields and `prev_hash`.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::audit::chain::GENESIS_HASH;

    #[rstest]
    #[case::authenticate(AuditAction::Authenticate, "authenticate")]
    #[case::register(AuditAction::RegisterKey, "register_key")]
    #[case::revoke(AuditAction::RevokeKey, "revoke_key")]
    #[case::rotate(AuditAction::RotateKey, "rotate_key")]
    #[case::credential(AuditAction::CredentialRequest, "credential_request")]
    #[case::approval_requested(AuditAction::ApprovalRequested, "approval_requested")]
    #[case::approval_resolved(AuditAction::ApprovalResolved, "approval_resolved")]
    #[case::policy_reload(AuditAction::PolicyReload, "policy_reload")]
    fn test_action_display_matches_serde(#[case] action: AuditAction, #[case] expected: &str) {
        assert_eq!(action.to_string(), expected);
        assert_eq!(serde_json::to_string(&action).unwrap(), format!("\"{expected}\""));
    }

    #[rstest]
    #[case::allowed(AuditDecision::Allowed, "allowed")]
    #[case::denied(AuditDecision::Denied, "denied")]
    #[case::pending(AuditDecision::Pending, "pending")]
    #[case::completed(AuditDecision::Completed, "completed")]
    #[case::canceled(AuditDecision::Canceled, "canceled")]
    #[case::failed(AuditDecision::Failed, "failed")]
    fn test_decision_display_matches_serde(#[case] decision: AuditDecision, #[case] expected: &str) {
        assert_eq!(decision.to_string(), expected);
        assert_eq!(serde_json::to_string(&decision).unwrap(), format!("\"{expected}\""));
    }

    #[test]
    fn test_builder_defaults() {
        let entry = NewAuditEntry::builder()
            .actor("alice")
            .action(AuditAction::Authenticate)
            .decision(AuditDecision::Allowed)
            .reason_code("ok")
            .build();
        assert!(entry.metadata.is_empty());
        assert!((Utc::now() - entry.timestamp).num_seconds() < 2);
    }

    #[test]
    fn test_seal_is_deterministic_and_links_prev_hash() {
        let ts = Utc::now();
        let make = || {
            NewAuditEntry::builder()
                .actor("alice")
                .action(AuditAction::Authenticate)
                .decision(AuditDecision::Allowed)
                .reason_code("ok")
                .timestamp(ts)
                .build()
        };

        let a = AuditEntry::seal(1, make(), GENESIS_HASH);
        let b = AuditEntry::seal(1, make(), GENESIS_HASH);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
        assert_eq!(a.prev_hash(), GENESIS_HASH);

        let c = AuditEntry::seal(2, make(), a.hash());
        assert_ne!(c.hash(), a.hash());
        assert_eq!(c.prev_hash(), a.hash());
    }

    #[test]
    fn test_entry_rejects_unknown_fields() {
        let entry = AuditEntry::seal(
            1,
            NewAuditEntry::builder()
                .actor("a")
                .action(AuditAction::RevokeKey)
                .decision(AuditDecision::Completed)
                .reason_code("ok")
                .build(),
            GENESIS_HASH,
        );
        let mut value = serde_json::to_value(&entry).unwrap();
        value["secret"] = serde_json::json!("nope");
        assert!(serde_json::from_value::<AuditEntry>(value).is_err());
    }
}
