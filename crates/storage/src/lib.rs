//! Shared storage layer for Sentra's trust-boundary services.
//!
//! This crate holds the durable and shared-mutable state that both the
//! request authenticator and the credential broker depend on:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            RequestAuthenticator │ CredentialBroker          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 sentra-common-storage                       │
//! │   KeyRegistry   │     AuditLog      │  SlidingWindowLimiter │
//! ├─────────────────┼───────────────────┼───────────────────────┤
//! │ Memory │ File   │ Memory │ File     │   in-process          │
//! └─────────────────┴───────────────────┴───────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use sentra_common_storage::keys::{KeyRecord, KeyRegistry, MemoryKeyRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = MemoryKeyRegistry::new();
//!
//!     let record = KeyRecord::builder()
//!         .public_key("O2onvM62pC1io6jQKm8Nc2UyFXcd4kOmOsBIoYtZ2ik")
//!         .principal_id("alice")
//!         .device_label("laptop")
//!         .build();
//!     registry.register(&record).await?;
//!
//!     let found = registry.lookup(&record.public_key).await?;
//!     assert!(found.is_some_and(|r| r.is_active()));
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with shared test doubles (fault-injecting audit
//!   log, record factories). Enable this in `[dev-dependencies]` for integration tests.
//! - **`failpoints`**: Compiles the `fail` crate's fail points into the file backends.

#![deny(unsafe_code)]

pub mod audit;
pub mod error;
pub mod keys;
pub mod rate_limiter;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

// Re-export primary types at crate root for convenience
pub use audit::{AuditAction, AuditDecision, AuditEntry, AuditLog, NewAuditEntry};
pub use error::{BoxError, StorageError, StorageResult};
pub use keys::{KeyRecord, KeyRegistry};
pub use rate_limiter::{RateLimitConfig, RateLimiter, SlidingWindowLimiter};
pub use types::{PrincipalId, TaskId, WorkerId};
