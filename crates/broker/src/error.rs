//! Broker error types.
//!
//! [`CredentialError`] covers every terminal outcome of a credential request
//! other than success, plus the configuration and I/O failures of the broker
//! process itself. [`ClientError`] is what a worker-side
//! [`BrokerClient`](crate::client::BrokerClient) sees.

use std::{io, path::PathBuf, time::Duration};

use sentra_common_storage::{AuditDecision, StorageError};
use thiserror::Error;

/// Credential broker errors.
///
/// Workers only ever see [`CredentialError::code`]; the `Display` text is for
/// server-side logs and never includes secret material.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`. New variants may be added in
/// future minor releases without a semver-breaking change.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// Policy (or an operator) refused the request.
    #[error("Denied by policy: {reason}")]
    PolicyDenied {
        /// Why the request was refused; logged, never sent to the worker.
        reason: String,
    },

    /// No operator decided within the approval timeout.
    #[error("Approval timed out after {}s", timeout.as_secs())]
    ApprovalTimeout {
        /// The configured approval timeout.
        timeout: Duration,
    },

    /// The task or its worker has used up its privileged-call budget.
    #[error("Budget exceeded for {scope} (limit {limit})")]
    BudgetExceeded {
        /// The exhausted budget, `task <worker>/<task>` or `worker <worker>`.
        scope: String,
        /// That budget's limit.
        limit: u32,
    },

    /// The upstream call did not finish within its timeout.
    #[error("Upstream call timed out after {}ms", timeout.as_millis())]
    UpstreamTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The upstream call failed.
    #[error("Upstream error: {message}")]
    UpstreamError {
        /// Description of the failure (status line or transport error).
        message: String,
        /// Whether a retry may succeed.
        transient: bool,
    },

    /// A per-rule rate limit was exceeded.
    #[error("Rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited {
        /// Time until the oldest counted call leaves the window.
        retry_after: Duration,
    },

    /// The host secret for the service is missing or malformed.
    #[error("Secret unavailable for {service}: {reason}")]
    SecretUnavailable {
        /// The service whose secret was requested.
        service: String,
        /// What went wrong; never includes the secret value.
        reason: String,
    },

    /// The worker disconnected before the request finished.
    #[error("Canceled by caller")]
    CanceledByCaller,

    /// The requested service is not configured.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// The request frame or one of its fields is invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No pending approval exists under the approval id.
    #[error("No pending approval {0}")]
    ApprovalNotFound(String),

    /// The policy document could not be parsed or failed validation.
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Broker configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem or socket failure.
    #[error("I/O error: {message}")]
    Io {
        /// What the broker was doing.
        message: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The audit entry for the request could not be written. The response
    /// is withheld and the request reported as an error.
    #[error("Audit write failure: {0}")]
    AuditWriteFailure(
        /// The underlying audit log error.
        #[source]
        StorageError,
    ),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CredentialError {
    /// Creates a new `PolicyDenied` error.
    #[must_use]
    pub fn policy_denied(reason: impl Into<String>) -> Self {
        Self::PolicyDenied { reason: reason.into() }
    }

    /// Creates a new `BudgetExceeded` error.
    #[must_use]
    pub fn budget_exceeded(scope: impl Into<String>, limit: u32) -> Self {
        Self::BudgetExceeded { scope: scope.into(), limit }
    }

    /// Creates a retryable `UpstreamError`.
    #[must_use]
    pub fn upstream_transient(message: impl Into<String>) -> Self {
        Self::UpstreamError { message: message.into(), transient: true }
    }

    /// Creates a non-retryable `UpstreamError`.
    #[must_use]
    pub fn upstream_permanent(message: impl Into<String>) -> Self {
        Self::UpstreamError { message: message.into(), transient: false }
    }

    /// Creates a new `SecretUnavailable` error.
    #[must_use]
    pub fn secret_unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SecretUnavailable { service: service.into(), reason: reason.into() }
    }

    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Creates a new `InvalidPolicy` error.
    #[must_use]
    pub fn invalid_policy(message: impl Into<String>) -> Self {
        Self::InvalidPolicy(message.into())
    }

    /// Creates a new `InvalidConfig` error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Creates a new `Io` error.
    #[must_use]
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self::Io { message: message.into(), source }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable public error code sent to workers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PolicyDenied { .. } => "policy_denied",
            Self::ApprovalTimeout { .. } => "approval_timeout",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamError { .. } => "upstream_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::SecretUnavailable { .. } => "secret_unavailable",
            Self::CanceledByCaller => "canceled_by_caller",
            Self::UnknownService(_) => "unknown_service",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ApprovalNotFound(_) => "approval_not_found",
            Self::InvalidPolicy(_) => "invalid_policy",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Io { .. } => "io_error",
            Self::AuditWriteFailure(_) => "audit_write_failure",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Returns `true` if the request was refused rather than failed.
    ///
    /// Refusals are reported to the worker as `denied`; everything else is
    /// an `error`.
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::PolicyDenied { .. }
                | Self::ApprovalTimeout { .. }
                | Self::BudgetExceeded { .. }
                | Self::RateLimited { .. }
                | Self::UnknownService(_)
                | Self::InvalidRequest(_)
        )
    }

    /// Returns `true` for errors worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpstreamError { transient: true, .. })
    }

    /// The audit decision recorded for a request that ended with this error.
    #[must_use]
    pub fn audit_decision(&self) -> AuditDecision {
        if self.is_denial() {
            AuditDecision::Denied
        } else if matches!(self, Self::CanceledByCaller) {
            AuditDecision::Canceled
        } else {
            AuditDecision::Failed
        }
    }
}

impl From<StorageError> for CredentialError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RateLimitExceeded { retry_after } => Self::RateLimited { retry_after },
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, CredentialError>;

/// Errors seen by broker clients.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The socket could not be reached.
    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        /// The socket path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The broker did not answer in time.
    #[error("timed out waiting for the broker")]
    Timeout,

    /// The broker closed the connection before a terminal response.
    #[error("connection closed by the broker")]
    ConnectionClosed,

    /// Framing or transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The broker rejected an operator command.
    #[error("broker returned {code}: {message}")]
    Rejected {
        /// Stable error code.
        code: String,
        /// Server-provided description.
        message: String,
    },
}
