//! Authentication error types.
//!
//! This module defines every way a signed control-plane request can be
//! rejected by the [`RequestAuthenticator`](crate::RequestAuthenticator).

use std::time::Duration;

use sentra_common_storage::StorageError;
use thiserror::Error;

/// Authentication errors.
///
/// Callers outside the trust boundary only ever see [`AuthError::code`]; the
/// `Display` text is for server-side logs.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`. New variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The public key is not registered, or it has been revoked.
    #[error("Unknown or revoked key")]
    UnknownOrRevokedKey,

    /// The envelope timestamp is outside the accepted window.
    #[error("Timestamp outside window: skew {skew_ms}ms exceeds {window_ms}ms")]
    StaleOrFutureTimestamp {
        /// Absolute distance between the envelope timestamp and server time.
        skew_ms: u64,
        /// Configured acceptance window.
        window_ms: u64,
    },

    /// Signature verification failed.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The (public key, nonce) pair was already accepted within the window.
    #[error("Replay detected")]
    ReplayDetected,

    /// The replay guard is at capacity and cannot record another nonce.
    #[error("Replay guard saturated")]
    ReplayGuardSaturated,

    /// The principal exceeded its request budget.
    #[error("Rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited {
        /// Time until the principal's oldest counted request leaves the window.
        retry_after: Duration,
    },

    /// Authenticator configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The envelope could not be decoded.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Key registry error during lookup.
    ///
    /// Wraps the original [`StorageError`] to preserve the full error source
    /// chain for debugging and structured logging.
    #[error("Key storage error: {0}")]
    KeyStorage(
        /// The underlying storage error that caused the key lookup to fail.
        #[source]
        StorageError,
    ),

    /// The audit entry for an otherwise successful authentication could not
    /// be written. The request is denied.
    #[error("Audit write failure: {0}")]
    AuditWriteFailure(
        /// The underlying audit log error.
        #[source]
        StorageError,
    ),
}

impl AuthError {
    /// Creates a new `MalformedEnvelope` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEnvelope(message.into())
    }

    /// Creates a new `InvalidConfig` error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Creates a new `StaleOrFutureTimestamp` error.
    #[must_use]
    pub fn stale_or_future(skew_ms: u64, window_ms: u64) -> Self {
        Self::StaleOrFutureTimestamp { skew_ms, window_ms }
    }

    /// Creates a new `RateLimited` error.
    #[must_use]
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited { retry_after }
    }

    /// Creates a new `KeyStorage` error.
    #[must_use]
    pub fn key_storage(err: StorageError) -> Self {
        Self::KeyStorage(err)
    }

    /// Creates a new `AuditWriteFailure` error.
    #[must_use]
    pub fn audit_write_failure(err: StorageError) -> Self {
        Self::AuditWriteFailure(err)
    }

    /// Stable public error code.
    ///
    /// Unknown and revoked keys share `unknown_or_revoked_key` so the
    /// response does not reveal whether a key was ever enrolled.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownOrRevokedKey => "unknown_or_revoked_key",
            Self::StaleOrFutureTimestamp { .. } => "stale_or_future_timestamp",
            Self::InvalidSignature => "invalid_signature",
            Self::ReplayDetected => "replay_detected",
            Self::ReplayGuardSaturated => "replay_guard_saturated",
            Self::RateLimited { .. } => "rate_limited",
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::InvalidConfig(_) => "invalid_config",
            Self::KeyStorage(_) => "key_storage_error",
            Self::AuditWriteFailure(_) => "audit_write_failure",
        }
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RateLimitExceeded { retry_after } => Self::RateLimited { retry_after },
            other => Self::KeyStorage(other),
        }
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error;

    use rstest::rstest;

    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(AuthError::UnknownOrRevokedKey.to_string(), "Unknown or revoked key");
        assert_eq!(AuthError::InvalidSignature.to_string(), "Invalid signature");
        assert_eq!(
            AuthError::stale_or_future(61_000, 60_000).to_string(),
            "Timestamp outside window: skew 61000ms exceeds 60000ms"
        );
        assert_eq!(
            AuthError::rate_limited(Duration::from_millis(250)).to_string(),
            "Rate limited, retry after 250ms"
        );
        assert_eq!(
            AuthError::malformed("nonce too short").to_string(),
            "Malformed envelope: nonce too short"
        );
    }

    #[rstest]
    #[case(AuthError::UnknownOrRevokedKey, "unknown_or_revoked_key")]
    #[case(AuthError::stale_or_future(1, 0), "stale_or_future_timestamp")]
    #[case(AuthError::InvalidSignature, "invalid_signature")]
    #[case(AuthError::ReplayDetected, "replay_detected")]
    #[case(AuthError::rate_limited(Duration::ZERO), "rate_limited")]
    #[case(AuthError::malformed("x"), "malformed_envelope")]
    #[case(AuthError::key_storage(StorageError::timeout()), "key_storage_error")]
    #[case(AuthError::audit_write_failure(StorageError::io("disk")), "audit_write_failure")]
    fn test_codes_are_stable(#[case] err: AuthError, #[case] code: &str) {
        assert_eq!(err.code(), code);
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: AuthError = StorageError::timeout().into();
        assert!(matches!(err, AuthError::KeyStorage(_)));
        assert_eq!(err.to_string(), "Key storage error: Operation timeout");

        let err: AuthError = StorageError::rate_limit_exceeded(Duration::from_secs(3)).into();
        assert!(
            matches!(err, AuthError::RateLimited { retry_after } if retry_after == Duration::from_secs(3))
        );
    }

    #[test]
    fn test_audit_failure_preserves_source_chain() {
        let io = std::io::Error::other("no space left on device");
        let err = AuthError::audit_write_failure(StorageError::from(io));

        let level_1 = err.source().expect("level 1 source");
        assert!(level_1.to_string().starts_with("I/O error"));
        let level_2 = level_1.source().expect("level 2 source");
        assert_eq!(level_2.to_string(), "no space left on device");
    }
}
