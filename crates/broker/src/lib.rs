//! Host-side credential broker for sandboxed agent workers.
//!
//! Workers never hold service credentials. They ask the broker, over a Unix
//! socket, to perform an operation on their behalf; the broker checks the
//! request against policy, rate limits and the task's budget, optionally
//! waits for an operator, performs the call itself with a freshly fetched
//! host secret and relays only the scrubbed upstream result.
//!
//! ```text
//!  worker ──frame──▶ BrokerServer ──▶ CredentialBroker ──▶ Upstream (HTTP)
//!                        │              │   │   │
//!  operator ◀─approve─▶ ApprovalManager │   │   └─ SecretStore
//!                                       │   └─ PolicyStore (hot reload)
//!                                       └─ AuditLog (written before reply)
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module ([`testutil::MockUpstream`], [`testutil::TestBroker`]).
//! - **`failpoints`**: Compiles the `fail` crate's fail points (`upstream-before-call`,
//!   `retry-before-sleep`).

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Operator approval table.
pub mod approval;
/// The credential request pipeline.
pub mod broker;
/// Per-task call budgets.
pub mod budget;
/// Socket clients.
pub mod client;
/// Broker configuration.
pub mod config;
/// Error types.
pub mod error;
/// Wire frames.
pub mod ipc;
/// Policy documents and the hot-reloading store.
pub mod policy;
/// Retry with backoff.
pub mod retry;
/// Host secrets.
pub mod secrets;
/// Unix socket server.
pub mod server;
/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
pub mod testutil;
/// Upstream calls.
pub mod upstream;

pub use approval::{ApprovalDecision, ApprovalManager, ParkedApproval, PendingApprovalInfo};
pub use broker::{CredentialBroker, CredentialRequest, PeerInfo, RequestState};
pub use client::{BrokerClient, OperatorClient};
pub use config::BrokerConfig;
pub use error::{ClientError, CredentialError, Result};
pub use policy::{Effect, PolicyDocument, PolicyRule, PolicyStore};
pub use server::BrokerServer;
pub use upstream::{ForwardedResult, HttpUpstream, Upstream};
