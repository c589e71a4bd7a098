//! The credential request pipeline.
//!
//! ```text
//! Received → Validating ─┬→ Approved → Executing → Completed
//!                        ├→ Denied
//!                        └→ ApprovalPending ─┬→ Approved
//!                                            └→ Denied
//! ```
//!
//! `Validating` checks, in order: the service/operation/target exist, the
//! worker has a role, the policy effect, the matching rule's rate limit and
//! the task budget. Any non-terminal state may also end in `Failed` or
//! `Canceled`.
//!
//! Every terminal state is audited before [`CredentialBroker::request_credential`]
//! returns. If that audit write fails the caller gets
//! [`CredentialError::AuditWriteFailure`], never the upstream result.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use fail::fail_point;
use sentra_common_storage::{
    AuditAction, AuditDecision, AuditLog, NewAuditEntry, RateLimitConfig, SlidingWindowLimiter,
    TaskId, WorkerId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    approval::{ApprovalDecision, ApprovalManager, DEFAULT_APPROVAL_TIMEOUT, PendingApprovalInfo},
    budget::{DEFAULT_TASK_BUDGET, DEFAULT_TASK_IDLE_TTL, TaskBudgets},
    config::DEFAULT_UPSTREAM_TIMEOUT,
    error::{CredentialError, Result},
    policy::{Effect, PolicyStore},
    retry::{RetryConfig, with_retry},
    secrets::SecretStore,
    upstream::{ForwardedResult, Upstream, UpstreamCall},
};

/// Lifecycle of one credential request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Frame decoded, nothing checked yet.
    Received,
    /// Policy, rate limit and budget checks.
    Validating,
    /// Parked until an operator decides.
    ApprovalPending,
    /// Cleared to execute.
    Approved,
    /// Upstream call in flight.
    Executing,
    /// Upstream call finished and the result was released.
    Completed,
    /// Refused by policy, limits or an operator.
    Denied,
    /// Failed after being accepted.
    Failed,
    /// The worker went away.
    Canceled,
}

impl RequestState {
    /// Returns `true` for states a request never leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Denied | Self::Failed | Self::Canceled)
    }

    /// Returns `true` if moving from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use RequestState::{
            Approved, ApprovalPending, Canceled, Completed, Denied, Executing, Failed, Received,
            Validating,
        };
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Received, Validating)
                | (Validating, ApprovalPending | Approved | Denied)
                | (ApprovalPending, Approved | Denied)
                | (Approved, Executing)
                | (Executing, Completed)
                | (_, Failed | Canceled)
        )
    }

    /// Lower-case state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validating => "validating",
            Self::ApprovalPending => "approval_pending",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Denied => "denied",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    fn terminal_for(outcome: &Result<ForwardedResult>) -> Self {
        match outcome {
            Ok(_) => Self::Completed,
            Err(e) => match e.audit_decision() {
                AuditDecision::Denied => Self::Denied,
                AuditDecision::Canceled => Self::Canceled,
                _ => Self::Failed,
            },
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials of the process on the other end of the worker socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Process id, when the platform reports it.
    pub pid: Option<i32>,
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
}

/// One credential request. Never persisted beyond its audit entry.
#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct CredentialRequest {
    /// Caller-chosen id echoed in response frames. Not trusted for lookups:
    /// two workers may send the same id.
    #[builder(into, default = uuid::Uuid::new_v4().to_string())]
    pub request_id: String,
    /// Worker that sent the request.
    #[builder(into)]
    pub worker_id: WorkerId,
    /// Task the call is charged to; defaults to the worker. Budgets are
    /// kept per worker, so the same task id from two workers is two tasks.
    #[builder(into)]
    pub task_id: Option<TaskId>,
    /// Role from the worker map; `None` for unknown workers.
    #[builder(into)]
    pub caller_role: Option<String>,
    /// Target service.
    #[builder(into)]
    pub service: String,
    /// Operation within the service.
    #[builder(into)]
    pub operation: String,
    /// Operation target.
    #[builder(into, default)]
    pub target: String,
    /// Operation parameters.
    pub params: Option<Value>,
    /// When the broker received the request.
    #[builder(default = Utc::now())]
    pub issued_at: DateTime<Utc>,
    /// Socket peer credentials.
    pub peer: Option<PeerInfo>,
}

impl CredentialRequest {
    /// Key the per-task budget is charged under.
    #[must_use]
    pub fn budget_key(&self) -> TaskId {
        self.task_id.clone().unwrap_or_else(|| TaskId::from(self.worker_id.as_str()))
    }

    fn upstream_call(&self) -> UpstreamCall<'_> {
        UpstreamCall {
            service: &self.service,
            operation: &self.operation,
            target: &self.target,
            params: self.params.as_ref(),
        }
    }

    fn audit_entry(&self, decision: AuditDecision, reason_code: &str) -> NewAuditEntry {
        let mut entry = NewAuditEntry::builder()
            .actor(self.worker_id.as_str())
            .action(AuditAction::CredentialRequest)
            .decision(decision)
            .reason_code(reason_code)
            .build()
            .with_metadata("request_id", self.request_id.clone())
            .with_metadata("worker_id", self.worker_id.to_string())
            .with_metadata("task_id", self.budget_key().to_string())
            .with_metadata("service", self.service.clone())
            .with_metadata("operation", self.operation.clone())
            .with_metadata("target", self.target.clone());
        if let Some(role) = &self.caller_role {
            entry = entry.with_metadata("role", role.clone());
        }
        if let Some(peer) = &self.peer {
            entry = entry.with_metadata("peer_uid", peer.uid.to_string());
            if let Some(pid) = peer.pid {
                entry = entry.with_metadata("peer_pid", pid.to_string());
            }
        }
        entry
    }
}

/// Tracks and traces state transitions for one request.
struct Progress<'a> {
    request_id: &'a str,
    state: RequestState,
    /// Set once this request is parked for approval.
    approval_id: Option<String>,
}

impl Progress<'_> {
    fn advance(&mut self, next: RequestState) {
        if self.state.can_transition_to(next) {
            tracing::debug!(request_id = self.request_id, from = %self.state, to = %next, "request state");
        } else {
            tracing::error!(
                request_id = self.request_id,
                from = %self.state,
                to = %next,
                "unexpected request state transition"
            );
        }
        self.state = next;
    }
}

/// Validates, executes and audits credential requests.
pub struct CredentialBroker {
    policy: Arc<PolicyStore>,
    secrets: Arc<dyn SecretStore>,
    upstream: Arc<dyn Upstream>,
    audit: Arc<dyn AuditLog>,
    approvals: Arc<ApprovalManager>,
    budgets: TaskBudgets,
    limiter: SlidingWindowLimiter,
    retry: RetryConfig,
    upstream_timeout: Duration,
}

impl fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("approvals", &self.approvals)
            .field("budgets", &self.budgets)
            .field("retry", &self.retry)
            .field("upstream_timeout", &self.upstream_timeout)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl CredentialBroker {
    /// Creates a broker.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidConfig`] for a zero task or worker budget or
    /// timeout, or an invalid retry policy.
    #[builder]
    pub fn new(
        policy: Arc<PolicyStore>,
        secrets: Arc<dyn SecretStore>,
        upstream: Arc<dyn Upstream>,
        audit: Arc<dyn AuditLog>,
        #[builder(default = DEFAULT_TASK_BUDGET)] task_budget: u32,
        worker_budget: Option<u32>,
        #[builder(default = DEFAULT_APPROVAL_TIMEOUT)] approval_timeout: Duration,
        #[builder(default = DEFAULT_UPSTREAM_TIMEOUT)] upstream_timeout: Duration,
        #[builder(default)] retry: RetryConfig,
    ) -> Result<Self> {
        retry.validate()?;
        if approval_timeout.is_zero() {
            return Err(CredentialError::invalid_config("approval_timeout must be non-zero"));
        }
        if upstream_timeout.is_zero() {
            return Err(CredentialError::invalid_config("upstream_timeout must be non-zero"));
        }
        let mut budgets = TaskBudgets::new(task_budget)?;
        if let Some(limit) = worker_budget {
            budgets = budgets.with_worker_limit(limit)?;
        }
        let approvals =
            Arc::new(ApprovalManager::new(Arc::clone(&audit)).with_timeout(approval_timeout));
        Ok(Self {
            policy,
            secrets,
            upstream,
            audit,
            approvals,
            budgets,
            limiter: SlidingWindowLimiter::new(RateLimitConfig::default()),
            retry,
            upstream_timeout,
        })
    }

    /// The pending-approval table.
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }

    /// The active policy.
    #[must_use]
    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    /// Per-task budgets.
    #[must_use]
    pub fn budgets(&self) -> &TaskBudgets {
        &self.budgets
    }

    /// Runs a request to completion.
    ///
    /// Cancelling `cancel` (the worker disconnected) drops any in-flight
    /// upstream call; upstream side effects already made are not undone.
    ///
    /// # Errors
    ///
    /// Returns the reason the request did not complete; see [`CredentialError`].
    pub async fn request_credential(
        &self,
        request: CredentialRequest,
        cancel: CancellationToken,
    ) -> Result<ForwardedResult> {
        self.request_credential_notify(request, cancel, None).await
    }

    /// Like [`Self::request_credential`], signalling `on_pending` once the
    /// request is parked for operator approval.
    ///
    /// # Errors
    ///
    /// Returns the reason the request did not complete; see [`CredentialError`].
    #[tracing::instrument(
        skip_all,
        fields(
            request_id = %request.request_id,
            worker_id = %request.worker_id,
            service = %request.service,
            operation = %request.operation,
        )
    )]
    pub async fn request_credential_notify(
        &self,
        request: CredentialRequest,
        cancel: CancellationToken,
        on_pending: Option<oneshot::Sender<()>>,
    ) -> Result<ForwardedResult> {
        let mut progress =
            Progress { request_id: &request.request_id, state: RequestState::Received, approval_id: None };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CredentialError::CanceledByCaller),
            result = self.execute(&request, &mut progress, on_pending) => result,
        };

        if matches!(outcome, Err(CredentialError::CanceledByCaller)) {
            if let Some(approval_id) = &progress.approval_id {
                self.approvals.withdraw(approval_id);
            }
            tracing::info!(state = %progress.state, "request canceled by caller");
        }
        progress.advance(RequestState::terminal_for(&outcome));

        let entry = match &outcome {
            Ok(result) => request
                .audit_entry(AuditDecision::Completed, "ok")
                .with_metadata("status", result.status.to_string()),
            Err(e) => request.audit_entry(e.audit_decision(), e.code()),
        };
        if let Err(e) = self.audit.append(entry).await {
            tracing::error!(error = %e, "failed to audit credential request, withholding response");
            return Err(CredentialError::AuditWriteFailure(e));
        }

        match &outcome {
            Ok(result) => tracing::info!(status = result.status, "credential request completed"),
            Err(e) if e.is_denial() => tracing::info!(code = e.code(), reason = %e, "credential request denied"),
            Err(e) => tracing::warn!(code = e.code(), error = %e, "credential request failed"),
        }
        outcome
    }

    async fn execute(
        &self,
        request: &CredentialRequest,
        progress: &mut Progress<'_>,
        on_pending: Option<oneshot::Sender<()>>,
    ) -> Result<ForwardedResult> {
        progress.advance(RequestState::Validating);
        let call = request.upstream_call();
        self.upstream.validate(&call)?;

        let role = request.caller_role.as_deref().ok_or_else(|| {
            CredentialError::policy_denied(format!("worker {} has no role", request.worker_id))
        })?;

        let decision = self.policy.decide(role, &request.service, &request.operation);
        let rule = match (decision.effect, decision.rule) {
            (Effect::Deny, Some(rule)) => {
                return Err(CredentialError::policy_denied(format!("denied by rule {}", rule.key())));
            },
            (Effect::Deny, None) => {
                return Err(CredentialError::policy_denied("no matching rule"));
            },
            (_, rule) => rule,
        };

        if let Some(rule) = &rule
            && let Some(limit) = rule.rate_limit
        {
            self.limiter.check_with_limit(&format!("{}#{}", rule.key(), request.worker_id), limit)?;
        }

        let remaining = self.budgets.charge(&request.worker_id, &request.budget_key())?;
        tracing::debug!(remaining, "task budget charged");

        if decision.effect == Effect::RequireApproval {
            progress.advance(RequestState::ApprovalPending);
            let parked = self
                .approvals
                .park(
                    PendingApprovalInfo::builder()
                        .request_id(request.request_id.clone())
                        .worker_id(request.worker_id.clone())
                        .maybe_task_id(request.task_id.clone())
                        .role(role)
                        .service(request.service.clone())
                        .operation(request.operation.clone())
                        .target(request.target.clone())
                        .requested_at(request.issued_at)
                        .build(),
                )
                .await?;
            progress.approval_id = Some(parked.approval_id().to_owned());
            if let Some(tx) = on_pending {
                let _ = tx.send(());
            }

            match self.approvals.wait(parked).await? {
                ApprovalDecision::Approved { operator } => {
                    tracing::info!(operator = %operator, "request approved by operator");
                },
                ApprovalDecision::Denied { operator, reason } => {
                    return Err(CredentialError::policy_denied(format!(
                        "denied by operator {operator}: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    )));
                },
            }
        }

        progress.advance(RequestState::Approved);
        let secret = self.secrets.fetch(&request.service).await?;

        progress.advance(RequestState::Executing);
        let timeout = self.upstream.timeout_for(&call).unwrap_or(self.upstream_timeout);
        let upstream = &self.upstream;
        let (call_ref, secret_ref) = (&call, &secret);
        let attempt = move || async move {
            fail_point!("upstream-before-call", |_| {
                Err(CredentialError::upstream_permanent("injected upstream failure"))
            });
            upstream.call(call_ref, secret_ref).await
        };

        let mut result = tokio::time::timeout(timeout, with_retry(&self.retry, &request.operation, attempt))
            .await
            .map_err(|_| CredentialError::UpstreamTimeout { timeout })??;

        let redacted = secret.redact_from(&mut result.body);
        if redacted > 0 {
            tracing::warn!(redacted, "upstream response echoed the secret, redacted");
        }
        Ok(result)
    }

    /// Drops idle rate-limit windows, abandoned approvals and idle task
    /// budgets.
    pub fn sweep(&self) {
        let windows = self.limiter.sweep();
        let approvals = self.approvals.evict_expired();
        let tasks = self.budgets.evict_idle(DEFAULT_TASK_IDLE_TTL);
        if windows > 0 || approvals > 0 || tasks > 0 {
            tracing::debug!(windows, approvals, tasks, "broker maintenance sweep");
        }
    }
}
