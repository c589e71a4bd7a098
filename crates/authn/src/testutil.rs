//! Shared test utilities for authentication testing.
//!
//! This module provides a ready-wired authenticator over in-memory stores
//! and a pinned clock, helpers for enrolling device keys, and an assertion
//! macro for [`AuthError`](crate::AuthError) variants. It is feature-gated
//! behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! sentra-common-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use sentra_common_authn::testutil::{TestAuthEnv, TEST_NOW_MS};
//! ```

use std::sync::Arc;

use sentra_common_storage::{
    AuditLog, KeyRegistry, audit::MemoryAuditLog, keys::MemoryKeyRegistry, testutil::make_key_record,
};

use crate::{
    authenticator::{AuthenticatorConfig, RequestAuthenticator},
    clock::ManualClock,
    envelope::EnvelopeSigner,
};

/// Fixed "now" used by [`TestAuthEnv`] (2023-11-14T22:13:20Z).
pub const TEST_NOW_MS: i64 = 1_700_000_000_000;

/// An authenticator wired to in-memory stores and a manual clock.
pub struct TestAuthEnv {
    /// The authenticator under test.
    pub authenticator: RequestAuthenticator,
    /// Registry shared with the authenticator.
    pub registry: MemoryKeyRegistry,
    /// Audit log shared with the authenticator.
    pub audit: MemoryAuditLog,
    /// Clock shared with the authenticator, starting at [`TEST_NOW_MS`].
    pub clock: ManualClock,
}

impl TestAuthEnv {
    /// Builds an environment with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the authenticator cannot be built.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(AuthenticatorConfig::default())
    }

    /// Builds an environment with a custom configuration.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid.
    #[must_use]
    pub fn with_config(config: AuthenticatorConfig) -> Self {
        let registry = MemoryKeyRegistry::new();
        let audit = MemoryAuditLog::new();
        Self::with_stores(config, registry, audit.clone(), Arc::new(audit))
    }

    /// Builds an environment whose authenticator writes to `audit_sink`
    /// instead of the in-memory log.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid.
    #[must_use]
    pub fn with_audit_sink(config: AuthenticatorConfig, audit_sink: Arc<dyn AuditLog>) -> Self {
        Self::with_stores(config, MemoryKeyRegistry::new(), MemoryAuditLog::new(), audit_sink)
    }

    fn with_stores(
        config: AuthenticatorConfig,
        registry: MemoryKeyRegistry,
        audit: MemoryAuditLog,
        audit_sink: Arc<dyn AuditLog>,
    ) -> Self {
        let clock = ManualClock::new(TEST_NOW_MS);
        let authenticator = RequestAuthenticator::builder()
            .registry(Arc::new(registry.clone()))
            .audit(audit_sink)
            .config(config)
            .clock(Arc::new(clock.clone()))
            .build()
            .expect("test authenticator config must be valid");
        Self { authenticator, registry, audit, clock }
    }

    /// Generates a device key for `principal` and registers it.
    ///
    /// # Panics
    ///
    /// Panics if registration fails.
    pub async fn enroll(&self, principal: &str) -> EnvelopeSigner {
        let signer = EnvelopeSigner::generate();
        self.registry
            .register(&make_key_record(&signer.public_key_b64(), principal))
            .await
            .expect("enrolling a fresh key must succeed");
        signer
    }
}

impl Default for TestAuthEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Asserts that a [`Result<T, AuthError>`](crate::Result) is an `Err`
/// matching the given [`AuthError`](crate::AuthError) variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use sentra_common_authn::assert_auth_error;
/// use sentra_common_authn::error::AuthError;
///
/// let result: Result<(), AuthError> = Err(AuthError::ReplayDetected);
/// assert_auth_error!(result, ReplayDetected);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::AuthError;

    #[tokio::test]
    async fn test_env_enroll_and_authenticate() {
        let env = TestAuthEnv::new();
        let signer = env.enroll("alice").await;
        let principal = env
            .authenticator
            .authenticate(&signer.sign(json!({}), TEST_NOW_MS))
            .await
            .expect("authenticate");
        assert_eq!(principal.principal_id.as_str(), "alice");
        assert_eq!(env.audit.len(), 1);
    }

    #[test]
    fn test_assert_auth_error_unit_variant() {
        let result: Result<(), AuthError> = Err(AuthError::ReplayDetected);
        assert_auth_error!(result, ReplayDetected);
    }

    #[test]
    fn test_assert_auth_error_tuple_variant_with_message() {
        let result: Result<(), AuthError> = Err(AuthError::malformed("bad nonce"));
        assert_auth_error!(result, MalformedEnvelope, "nonce should be rejected");
    }
}
