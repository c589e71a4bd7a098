//! # Sentra Common Authentication
//!
//! Ed25519 signed-request authentication for Sentra control-plane services.
//!
//! This crate provides:
//! - **Signed envelopes**: canonical signing encoding and a client-side signer
//! - **Request authenticator**: key, timestamp, signature, replay and rate checks
//! - **Replay guard**: per-key nonce tracking with per-entry expiry
//! - **Key cache**: short-TTL read-through cache over the key registry
//!
//! ## Features
//!
//! - Only Ed25519 is supported; envelopes carry no algorithm field
//! - Every authentication decision is written to the audit log
//! - Revocation through the authenticator takes effect immediately
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sentra_common_authn::{EnvelopeSigner, RequestAuthenticator};
//! use sentra_common_storage::{
//!     KeyRegistry, audit::MemoryAuditLog, keys::{KeyRecord, MemoryKeyRegistry},
//! };
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(MemoryKeyRegistry::new());
//! let signer = EnvelopeSigner::generate();
//! registry
//!     .register(
//!         &KeyRecord::builder()
//!             .public_key(signer.public_key_b64())
//!             .principal_id("alice")
//!             .device_label("laptop")
//!             .build(),
//!     )
//!     .await?;
//!
//! let authenticator = RequestAuthenticator::builder()
//!     .registry(registry)
//!     .audit(Arc::new(MemoryAuditLog::new()))
//!     .build()?;
//!
//! let envelope = signer.sign(json!({"op": "deploy"}), chrono::Utc::now().timestamp_millis());
//! let principal = authenticator.authenticate(&envelope).await?;
//! println!("authenticated {}", principal.principal_id);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Signed-request gate.
pub mod authenticator;
/// Time source abstraction.
pub mod clock;
/// Envelope wire type and canonical encoding.
pub mod envelope;
/// Authentication error types.
pub mod error;
/// Key registry cache.
pub mod key_cache;
/// Nonce replay prevention.
pub mod replay;
/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
pub mod testutil;
/// Envelope field decoding and signature verification.
pub mod validation;

// Re-export key types for convenience
pub use authenticator::{AuthenticatedPrincipal, AuthenticatorConfig, DEFAULT_TIMESTAMP_WINDOW, RequestAuthenticator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use envelope::{EnvelopeSigner, SignedEnvelope, canonical_bytes};
pub use error::{AuthError, Result};
pub use key_cache::{DEFAULT_KEY_CACHE_CAPACITY, DEFAULT_KEY_CACHE_TTL, KeyCache};
pub use replay::{InMemoryReplayGuard, ReplayGuard};
