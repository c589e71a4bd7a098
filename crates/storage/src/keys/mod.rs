//! Public key registry for signed-request authentication.
//!
//! A principal enrolls a device by registering the device's Ed25519 public
//! key. The registry binds each key to exactly one `(principal, device)` pair
//! and records its revocation state.
//!
//! # Key Lifecycle
//!
//! ```text
//! ┌─────────────┐   touch_last_used   ┌─────────────┐
//! │ Registered  │────────────────────►│   Active    │
//! │             │                     │ (last used) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │              revoke               │
//!        └────────────────┬──────────────────┘
//!                         ▼
//!                  ┌─────────────┐
//!                  │   Revoked   │
//!                  │ (permanent) │
//!                  └─────────────┘
//! ```
//!
//! There is no update of key material and no delete: rotation is modeled as
//! register-new + revoke-old (see [`KeyRegistry::rotate`]), so the device
//! history stays auditable.
//!
//! # Backends
//!
//! - [`MemoryKeyRegistry`] for tests and ephemeral deployments.
//! - [`FileKeyRegistry`] persists a JSON snapshot (write-temp, fsync, rename).
//! - [`AuditedKeyRegistry`] decorates either one and appends lifecycle events to an
//!   [`AuditLog`](crate::audit::AuditLog).

mod audited;
mod file;
mod record;
mod registry;

pub use audited::AuditedKeyRegistry;
pub use file::FileKeyRegistry;
pub use record::KeyRecord;
pub use registry::{KeyRegistry, MemoryKeyRegistry};
