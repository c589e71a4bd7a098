//! Newline-delimited JSON frames for the worker and operator sockets.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    approval::PendingApprovalInfo,
    error::CredentialError,
    upstream::ForwardedResult,
};

/// Longest accepted frame, in bytes, excluding the newline.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// A worker's credential request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialRequestFrame {
    /// Caller-chosen id echoed in every response frame.
    pub request_id: String,
    /// Requesting worker.
    pub worker_id: String,
    /// Task to charge; defaults to the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Target service.
    pub service: String,
    /// Operation within the service.
    pub operation: String,
    /// Operation target.
    #[serde(default)]
    pub target: String,
    /// Operation parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Status carried by a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The call was made; `result` holds the upstream response.
    Approved,
    /// Refused; `code` says why.
    Denied,
    /// Waiting for an operator; a terminal frame follows.
    Pending,
    /// Accepted but failed; `code` says why.
    Error,
}

impl ResponseStatus {
    /// Returns `true` for every status except [`Self::Pending`].
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A broker response on the worker socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialResponseFrame {
    /// The request this answers; empty if the request frame was unreadable.
    pub request_id: String,
    /// Outcome.
    pub status: ResponseStatus,
    /// Stable error code for `denied` and `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Upstream result for `approved`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ForwardedResult>,
}

impl CredentialResponseFrame {
    /// A successful response.
    #[must_use]
    pub fn approved(request_id: impl Into<String>, result: ForwardedResult) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Approved,
            code: None,
            result: Some(result),
        }
    }

    /// An interim response for approval-gated requests.
    #[must_use]
    pub fn pending(request_id: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), status: ResponseStatus::Pending, code: None, result: None }
    }

    /// The terminal response for a failed request.
    #[must_use]
    pub fn from_error(request_id: impl Into<String>, err: &CredentialError) -> Self {
        let status = if err.is_denial() { ResponseStatus::Denied } else { ResponseStatus::Error };
        Self {
            request_id: request_id.into(),
            status,
            code: Some(err.code().to_owned()),
            result: None,
        }
    }
}

/// A command on the operator socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum OperatorCommand {
    /// List requests awaiting approval.
    ListPending,
    /// Approve or deny one request.
    Resolve {
        /// Broker-issued id of the pending approval.
        approval_id: String,
        /// `true` to approve.
        approve: bool,
        /// Shown to the audit log on denial.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Who decided.
        operator: String,
    },
}

/// A reply on the operator socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorReply {
    /// Requests awaiting approval, oldest first.
    Pending {
        /// The parked requests.
        requests: Vec<PendingApprovalInfo>,
    },
    /// The decision was delivered.
    Resolved {
        /// The approval that was resolved.
        approval_id: String,
    },
    /// The command failed.
    Error {
        /// Stable error code.
        code: String,
        /// Description.
        message: String,
    },
}

impl From<&CredentialError> for OperatorReply {
    fn from(err: &CredentialError) -> Self {
        Self::Error { code: err.code().to_owned(), message: err.to_string() }
    }
}
