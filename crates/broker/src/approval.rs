//! Operator approval for `require_approval` requests.
//!
//! A request whose policy effect is [`Effect::RequireApproval`](crate::policy::Effect)
//! is parked in an explicit pending table under a broker-issued approval id;
//! worker-chosen request ids are carried as metadata only, so one worker
//! cannot address another worker's approval. The waiting request holds the
//! receiving half of a oneshot channel; an operator resolves it out-of-band
//! through the operator socket. Only the parked request suspends, and it is
//! denied if nobody decides within the timeout.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use sentra_common_storage::{AuditAction, AuditDecision, AuditLog, NewAuditEntry, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{CredentialError, Result};

/// Default timeout for pending approvals (5 minutes).
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// What an operator sees about a parked request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[builder(on(String, into))]
pub struct PendingApprovalInfo {
    /// Id operators resolve the approval by.
    #[builder(default = uuid::Uuid::new_v4().to_string())]
    pub approval_id: String,
    /// Worker-chosen id of the request awaiting a decision.
    pub request_id: String,
    /// Worker that issued it.
    #[builder(into)]
    pub worker_id: WorkerId,
    /// Task it is charged to, if the worker named one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub task_id: Option<TaskId>,
    /// Role the policy was evaluated for.
    pub role: String,
    /// Target service.
    pub service: String,
    /// Requested operation.
    pub operation: String,
    /// Operation target (repository, resource).
    #[builder(default)]
    pub target: String,
    /// When the request was parked.
    #[builder(default = Utc::now())]
    pub requested_at: DateTime<Utc>,
}

/// A request parked by [`ApprovalManager::park`].
#[derive(Debug)]
pub struct ParkedApproval {
    approval_id: String,
    rx: oneshot::Receiver<ApprovalDecision>,
}

impl ParkedApproval {
    /// Id the approval is pending under.
    #[must_use]
    pub fn approval_id(&self) -> &str {
        &self.approval_id
    }
}

/// An operator's decision on a parked request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Approved for execution.
    Approved {
        /// Operator who approved.
        operator: String,
    },
    /// Denied, with an optional reason.
    Denied {
        /// Operator who denied.
        operator: String,
        /// Why the request was denied.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ApprovalDecision {
    /// Creates an approved decision.
    #[must_use]
    pub fn approved(operator: impl Into<String>) -> Self {
        Self::Approved { operator: operator.into() }
    }

    /// Creates a denied decision.
    #[must_use]
    pub fn denied(operator: impl Into<String>, reason: Option<String>) -> Self {
        Self::Denied { operator: operator.into(), reason }
    }

    /// Returns `true` if the request may proceed.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    /// The operator who decided.
    #[must_use]
    pub fn operator(&self) -> &str {
        match self {
            Self::Approved { operator } | Self::Denied { operator, .. } => operator,
        }
    }
}

#[derive(Debug)]
struct PendingApproval {
    info: PendingApprovalInfo,
    created_at: Instant,
    response_tx: oneshot::Sender<ApprovalDecision>,
}

/// Table of requests waiting for an operator.
pub struct ApprovalManager {
    pending: DashMap<String, PendingApproval>,
    audit: Arc<dyn AuditLog>,
    timeout: Duration,
}

impl std::fmt::Debug for ApprovalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalManager")
            .field("pending", &self.pending.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ApprovalManager {
    /// Creates a manager recording requests and resolutions to `audit`.
    #[must_use]
    pub fn new(audit: Arc<dyn AuditLog>) -> Self {
        Self { pending: DashMap::new(), audit, timeout: DEFAULT_APPROVAL_TIMEOUT }
    }

    /// Sets the approval timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the approval timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Parks a request until an operator decides it.
    ///
    /// An `approval_requested` entry is written before the request becomes
    /// visible to operators.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::InvalidRequest`] if the approval id is already pending
    /// - [`CredentialError::AuditWriteFailure`] if the audit entry could not be written
    #[tracing::instrument(
        skip(self, info),
        fields(approval_id = %info.approval_id, request_id = %info.request_id)
    )]
    pub async fn park(&self, info: PendingApprovalInfo) -> Result<ParkedApproval> {
        if self.pending.contains_key(&info.approval_id) {
            return Err(CredentialError::invalid_request("duplicate approval id"));
        }

        let entry = NewAuditEntry::builder()
            .actor(info.worker_id.as_str())
            .action(AuditAction::ApprovalRequested)
            .decision(AuditDecision::Pending)
            .reason_code("require_approval")
            .build();
        self.audit
            .append(with_request_metadata(entry, &info))
            .await
            .map_err(CredentialError::AuditWriteFailure)?;

        let (response_tx, rx) = oneshot::channel();
        let approval_id = info.approval_id.clone();
        match self.pending.entry(approval_id.clone()) {
            Entry::Occupied(_) => Err(CredentialError::invalid_request("duplicate approval id")),
            Entry::Vacant(slot) => {
                tracing::info!(
                    worker_id = %info.worker_id,
                    service = %info.service,
                    operation = %info.operation,
                    "request awaiting operator approval"
                );
                slot.insert(PendingApproval { info, created_at: Instant::now(), response_tx });
                Ok(ParkedApproval { approval_id, rx })
            },
        }
    }

    /// Waits for the decision on a parked request.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::ApprovalTimeout`] if no decision arrives
    /// within the timeout; the request is removed from the table.
    pub async fn wait(&self, parked: ParkedApproval) -> Result<ApprovalDecision> {
        let ParkedApproval { approval_id, rx } = parked;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => Ok(decision),
            // Sender dropped by evict_expired
            Ok(Err(_)) => Err(CredentialError::ApprovalTimeout { timeout: self.timeout }),
            Err(_) => {
                self.withdraw(&approval_id);
                tracing::warn!(
                    approval_id = %approval_id,
                    timeout_secs = self.timeout.as_secs(),
                    "approval timed out"
                );
                Err(CredentialError::ApprovalTimeout { timeout: self.timeout })
            },
        }
    }

    /// Delivers an operator's decision.
    ///
    /// The resolution is audited before it is delivered; if that audit write
    /// fails the request is denied instead.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::ApprovalNotFound`] if nothing is pending under `approval_id`
    /// - [`CredentialError::AuditWriteFailure`] if the resolution could not be audited
    /// - [`CredentialError::Internal`] if the requester stopped waiting
    #[tracing::instrument(skip(self, decision), fields(operator = decision.operator()))]
    pub async fn resolve(&self, approval_id: &str, decision: ApprovalDecision) -> Result<()> {
        let (_, pending) = self
            .pending
            .remove(approval_id)
            .ok_or_else(|| CredentialError::ApprovalNotFound(approval_id.to_owned()))?;

        let (audit_decision, reason_code) = if decision.is_approved() {
            (AuditDecision::Allowed, "operator_approved")
        } else {
            (AuditDecision::Denied, "operator_denied")
        };
        let mut entry = NewAuditEntry::builder()
            .actor(decision.operator())
            .action(AuditAction::ApprovalResolved)
            .decision(audit_decision)
            .reason_code(reason_code)
            .build();
        if let ApprovalDecision::Denied { reason: Some(reason), .. } = &decision {
            entry = entry.with_metadata("reason", reason.clone());
        }

        if let Err(e) = self.audit.append(with_request_metadata(entry, &pending.info)).await {
            tracing::error!(error = %e, "failed to audit approval resolution, denying request");
            let _ = pending.response_tx.send(ApprovalDecision::denied(
                decision.operator(),
                Some("approval could not be audited".to_owned()),
            ));
            return Err(CredentialError::AuditWriteFailure(e));
        }

        let approved = decision.is_approved();
        pending
            .response_tx
            .send(decision)
            .map_err(|_| CredentialError::internal("requester is no longer waiting"))?;
        tracing::info!(approved, "approval resolved");
        Ok(())
    }

    /// Removes a parked request without deciding it.
    ///
    /// Returns `true` if an entry was removed.
    pub fn withdraw(&self, approval_id: &str) -> bool {
        self.pending.remove(approval_id).is_some()
    }

    /// Lists parked requests, oldest first.
    #[must_use]
    pub fn list_pending(&self) -> Vec<PendingApprovalInfo> {
        let mut items: Vec<_> = self.pending.iter().map(|p| p.info.clone()).collect();
        items.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        items
    }

    /// Number of parked requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drops entries older than the timeout whose waiter is gone.
    ///
    /// Returns the number of entries removed.
    pub fn evict_expired(&self) -> usize {
        let before = self.pending.len();
        let timeout = self.timeout;
        self.pending.retain(|_, p| p.created_at.elapsed() < timeout && !p.response_tx.is_closed());
        before.saturating_sub(self.pending.len())
    }
}

fn with_request_metadata(entry: NewAuditEntry, info: &PendingApprovalInfo) -> NewAuditEntry {
    let entry = entry
        .with_metadata("approval_id", info.approval_id.clone())
        .with_metadata("request_id", info.request_id.clone())
        .with_metadata("worker_id", info.worker_id.to_string())
        .with_metadata("role", info.role.clone())
        .with_metadata("service", info.service.clone())
        .with_metadata("operation", info.operation.clone())
        .with_metadata("target", info.target.clone());
    match &info.task_id {
        Some(task) => entry.with_metadata("task_id", task.to_string()),
        None => entry,
    }
}
