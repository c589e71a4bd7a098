//! Key record type stored in the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::PrincipalId;

/// A registered device public key (Ed25519 only).
///
/// Only the public half is ever stored; the private key stays on the
/// enrolling device.
///
/// # Validation Rules
///
/// A key authenticates requests only while `revoked_at.is_none()`.
/// Revocation is permanent; re-enrolling a device requires a new key.
///
/// # Example
///
/// ```
/// use sentra_common_storage::keys::KeyRecord;
///
/// let record = KeyRecord::builder()
///     .public_key("O2onvM62pC1io6jQKm8Nc2UyFXcd4kOmOsBIoYtZ2ik")
///     .principal_id("alice")
///     .device_label("ci-runner-7")
///     .build();
///
/// assert!(record.is_active());
/// assert!(record.last_used_at.is_none());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct KeyRecord {
    /// Ed25519 public key (base64url-encoded, no padding).
    ///
    /// This is the registry's primary key: it is unique across all
    /// principals and all revocation states.
    #[builder(into)]
    pub public_key: String,

    /// Principal that owns the enrolled device.
    #[builder(into)]
    pub principal_id: PrincipalId,

    /// Human-readable device label (e.g., "laptop", "ci-runner-7").
    #[builder(into)]
    pub device_label: String,

    /// When the key was enrolled. Set once, never changes.
    #[builder(default = Utc::now())]
    pub registered_at: DateTime<Utc>,

    /// Last successful authentication with this key.
    pub last_used_at: Option<DateTime<Utc>>,

    /// Revocation timestamp (if revoked). Once set, never cleared.
    pub revoked_at: Option<DateTime<Utc>>,

    /// Reason recorded alongside `revoked_at` (e.g., "device lost").
    #[serde(default)]
    pub revocation_reason: Option<String>,
}

impl KeyRecord {
    /// Returns `true` if the key has not been revoked.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn create_test_record() -> KeyRecord {
        KeyRecord::builder()
            .public_key("O2onvM62pC1io6jQKm8Nc2UyFXcd4kOmOsBIoYtZ2ik")
            .principal_id("alice")
            .device_label("laptop")
            .build()
    }

    #[test]
    fn test_builder_defaults() {
        let record = create_test_record();
        assert_eq!(record.principal_id, PrincipalId::from("alice"));
        assert!(record.is_active());
        assert!(record.last_used_at.is_none());
        assert!(record.revocation_reason.is_none());
        assert!((Utc::now() - record.registered_at).num_seconds() < 2);
    }

    #[test]
    fn test_revoked_record_is_inactive() {
        let record = KeyRecord::builder()
            .public_key("k")
            .principal_id("bob")
            .device_label("phone")
            .revoked_at(Utc::now())
            .revocation_reason("device lost".to_owned())
            .build();
        assert!(!record.is_active());
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_string(&create_test_record()).expect("serialize");
        for field in [
            "\"public_key\":",
            "\"principal_id\":",
            "\"device_label\":",
            "\"registered_at\":",
            "\"last_used_at\":",
            "\"revoked_at\":",
        ] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let json = r#"{
            "public_key": "k",
            "principal_id": "alice",
            "device_label": "laptop",
            "registered_at": "2025-01-15T10:30:00Z",
            "last_used_at": null,
            "revoked_at": null,
            "private_key": "should-never-be-here"
        }"#;
        assert!(serde_json::from_str::<KeyRecord>(json).is_err());
    }

    #[test]
    fn test_deserialize_without_revocation_reason() {
        let json = r#"{
            "public_key": "k",
            "principal_id": "alice",
            "device_label": "laptop",
            "registered_at": "2025-01-15T10:30:00Z",
            "last_used_at": null,
            "revoked_at": null
        }"#;
        let record: KeyRecord = serde_json::from_str(json).expect("deserialize");
        assert!(record.revocation_reason.is_none());
        assert!(record.is_active());
    }
}
