#![allow(clippy::expect_used, clippy::panic)]
//! End-to-end request pipeline tests over in-memory doubles.
//!
//! ```bash
//! cargo test -p sentra-broker --features testutil --test credential_flow
//! ```

use std::{sync::Arc, time::Duration};

use sentra_broker::{
    ApprovalDecision, CredentialError, CredentialRequest, ForwardedResult,
    assert_credential_error,
    testutil::{
        MockReply, TEST_GITHUB_TOKEN, TestBroker, TestBrokerOptions, contains_secret,
    },
};
use sentra_common_storage::{AuditAction, AuditDecision, AuditEntry};
use serde_json::json;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

const POLICY: &str = r"
version: 1
rules:
  - { role: ci, service: github, operation: read, effect: allow }
  - { role: ci, service: github, operation: create_issue, effect: require_approval }
  - { role: ci, service: github, operation: delete_repo, effect: deny }
  - { role: '*', service: github, operation: delete_repo, effect: allow }
  - role: ci
    service: anthropic
    operation: messages
    effect: allow
    rate_limit: { max_requests: 2, per: 1m }
";

fn credential_entries(entries: &[AuditEntry]) -> Vec<&AuditEntry> {
    entries.iter().filter(|e| e.action() == AuditAction::CredentialRequest).collect()
}

fn last_credential_entry(broker: &TestBroker) -> AuditEntry {
    broker
        .audit
        .entries()
        .into_iter()
        .rev()
        .find(|e| e.action() == AuditAction::CredentialRequest)
        .expect("no credential request was audited")
}

/// Approval id of the single pending request.
fn sole_approval_id(broker: &TestBroker) -> String {
    let pending = broker.broker.approvals().list_pending();
    assert_eq!(pending.len(), 1, "expected exactly one pending approval");
    pending[0].approval_id.clone()
}

/// Starts an approval-gated request and waits until it is parked.
async fn park(
    broker: &TestBroker,
    request: CredentialRequest,
    cancel: CancellationToken,
) -> JoinHandle<Result<ForwardedResult, CredentialError>> {
    let inner = Arc::clone(&broker.broker);
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        inner.request_credential_notify(request, cancel, Some(tx)).await
    });
    rx.await.expect("request finished before it was parked");
    handle
}

#[tokio::test]
async fn allowed_request_completes_and_is_audited() {
    let broker = TestBroker::new(POLICY);
    let request = broker.request("w1", "ci", "github", "read");
    let request_id = request.request_id.clone();

    let result = broker
        .broker
        .request_credential(request, CancellationToken::new())
        .await
        .expect("allowed request should complete");

    assert_eq!(result.status, 200);
    assert_eq!(result.body, json!({"ok": true}));
    assert_eq!(broker.upstream.calls(), 1);
    assert_eq!(broker.upstream.secrets_seen(), vec![TEST_GITHUB_TOKEN.to_owned()]);

    let entry = last_credential_entry(&broker);
    assert_eq!(entry.decision(), AuditDecision::Completed);
    assert_eq!(entry.reason_code(), "ok");
    assert_eq!(entry.actor(), "w1");
    let metadata = entry.metadata();
    assert_eq!(metadata.get("request_id"), Some(&request_id));
    assert_eq!(metadata.get("service").map(String::as_str), Some("github"));
    assert_eq!(metadata.get("operation").map(String::as_str), Some("read"));
    assert_eq!(metadata.get("role").map(String::as_str), Some("ci"));
    assert_eq!(metadata.get("status").map(String::as_str), Some("200"));
}

#[tokio::test]
async fn unmatched_request_is_denied_by_default() {
    let broker = TestBroker::new(POLICY);
    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "write"), CancellationToken::new())
        .await;

    assert_credential_error!(result, PolicyDenied);
    assert_eq!(broker.upstream.calls(), 0);

    let entry = last_credential_entry(&broker);
    assert_eq!(entry.decision(), AuditDecision::Denied);
    assert_eq!(entry.reason_code(), "policy_denied");
}

#[tokio::test]
async fn specific_deny_beats_wildcard_allow() {
    let broker = TestBroker::new(POLICY);

    let denied = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "delete_repo"), CancellationToken::new())
        .await;
    assert_credential_error!(denied, PolicyDenied);

    let allowed = broker
        .broker
        .request_credential(broker.request("w2", "admin", "github", "delete_repo"), CancellationToken::new())
        .await;
    assert!(allowed.is_ok(), "wildcard rule should admit other roles: {allowed:?}");
}

#[tokio::test]
async fn worker_without_role_is_denied() {
    let broker = TestBroker::new(POLICY);
    let request = CredentialRequest::builder()
        .worker_id("stranger")
        .service("github")
        .operation("read")
        .build();

    let result = broker.broker.request_credential(request, CancellationToken::new()).await;
    assert_credential_error!(result, PolicyDenied);
    assert_eq!(broker.upstream.calls(), 0);
}

#[tokio::test]
async fn unknown_service_is_rejected_before_policy() {
    let broker = TestBroker::new(POLICY);
    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "slack", "post"), CancellationToken::new())
        .await;

    assert_credential_error!(result, UnknownService);
    let entry = last_credential_entry(&broker);
    assert_eq!(entry.decision(), AuditDecision::Denied);
    assert_eq!(entry.reason_code(), "unknown_service");
}

#[tokio::test]
async fn audit_failure_withholds_the_result() {
    let broker = TestBroker::new(POLICY);
    broker.audit.set_failing(true);

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await;

    assert_credential_error!(result, AuditWriteFailure);
    assert_eq!(broker.upstream.calls(), 1);
    assert!(broker.audit.rejected() >= 1);
    assert!(broker.audit.entries().is_empty());
}

#[tokio::test]
async fn echoed_secret_is_redacted() {
    let broker = TestBroker::new(POLICY);
    broker.upstream.push(MockReply::EchoSecret);

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await
        .expect("request should complete");

    assert_eq!(result.status, 200);
    assert!(!contains_secret(&result.body, TEST_GITHUB_TOKEN), "secret leaked: {}", result.body);
    assert_eq!(result.body["service"], json!("github"));
}

#[tokio::test]
async fn missing_secret_fails_without_calling_upstream() {
    let broker = TestBroker::new(POLICY);
    broker.secrets.remove("github");

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await;

    assert_credential_error!(result, SecretUnavailable);
    assert_eq!(broker.upstream.calls(), 0);
    assert_eq!(last_credential_entry(&broker).decision(), AuditDecision::Failed);
}

#[tokio::test]
async fn budget_exhaustion_is_sticky() {
    let options = TestBrokerOptions::builder().task_budget(2).build();
    let broker = TestBroker::with_options(POLICY, options);

    for _ in 0..2 {
        broker
            .broker
            .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
            .await
            .expect("request within budget should complete");
    }

    for _ in 0..2 {
        let result = broker
            .broker
            .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
            .await;
        assert_credential_error!(result, BudgetExceeded);
    }
    assert_eq!(broker.upstream.calls(), 2);
    assert_eq!(last_credential_entry(&broker).reason_code(), "budget_exceeded");

    let other = broker
        .broker
        .request_credential(broker.request("w2", "ci", "github", "read"), CancellationToken::new())
        .await;
    assert!(other.is_ok(), "budgets are per task: {other:?}");
}

#[tokio::test]
async fn denied_requests_do_not_consume_budget() {
    let options = TestBrokerOptions::builder().task_budget(1).build();
    let broker = TestBroker::with_options(POLICY, options);

    for _ in 0..3 {
        let result = broker
            .broker
            .request_credential(broker.request("w1", "ci", "github", "write"), CancellationToken::new())
            .await;
        assert_credential_error!(result, PolicyDenied);
    }

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await;
    assert!(result.is_ok(), "policy denials must not charge the budget: {result:?}");
}

fn task_request(worker: &str, task: &str) -> CredentialRequest {
    CredentialRequest::builder()
        .worker_id(worker)
        .task_id(task)
        .caller_role("ci")
        .service("github")
        .operation("read")
        .target("acme/widgets")
        .build()
}

#[tokio::test]
async fn explicit_task_id_is_charged() {
    let options = TestBrokerOptions::builder().task_budget(1).worker_budget(10).build();
    let broker = TestBroker::with_options(POLICY, options);

    let ok = broker.broker.request_credential(task_request("w1", "task-7"), CancellationToken::new()).await;
    assert!(ok.is_ok(), "{ok:?}");
    let result =
        broker.broker.request_credential(task_request("w1", "task-7"), CancellationToken::new()).await;
    assert_credential_error!(result, BudgetExceeded);

    let budgets = broker.broker.budgets();
    assert_eq!(budgets.used(&"w1".into(), &"task-7".into()), 1);
    assert!(budgets.is_exhausted(&"w1".into(), &"task-7".into()));

    let next_task =
        broker.broker.request_credential(task_request("w1", "task-8"), CancellationToken::new()).await;
    assert!(next_task.is_ok(), "another task has its own budget: {next_task:?}");
}

#[tokio::test]
async fn fresh_task_ids_do_not_bypass_the_budget() {
    let options = TestBrokerOptions::builder().task_budget(2).build();
    let broker = TestBroker::with_options(POLICY, options);

    let mut completed = 0;
    for i in 0..10 {
        let request = task_request("w1", &format!("t{i}"));
        if broker.broker.request_credential(request, CancellationToken::new()).await.is_ok() {
            completed += 1;
        }
    }

    assert_eq!(completed, 2);
    assert_eq!(broker.upstream.calls(), 2);
    assert!(broker.broker.budgets().is_worker_exhausted(&"w1".into()));
    assert_eq!(last_credential_entry(&broker).reason_code(), "budget_exceeded");
}

#[tokio::test]
async fn task_ids_do_not_cross_workers() {
    let options = TestBrokerOptions::builder().task_budget(1).build();
    let broker = TestBroker::with_options(POLICY, options);

    let victim = broker.broker.request_credential(task_request("w1", "task-7"), CancellationToken::new()).await;
    assert!(victim.is_ok(), "{victim:?}");
    // Another worker naming the same task id charges its own counter
    let other = broker.broker.request_credential(task_request("w2", "task-7"), CancellationToken::new()).await;
    assert!(other.is_ok(), "{other:?}");

    assert_eq!(broker.broker.budgets().used(&"w1".into(), &"task-7".into()), 1);
    assert_eq!(broker.broker.budgets().used(&"w2".into(), &"task-7".into()), 1);
}

#[tokio::test]
async fn rule_rate_limit_applies_per_worker() {
    let broker = TestBroker::new(POLICY);

    for _ in 0..2 {
        broker
            .broker
            .request_credential(broker.request("w1", "ci", "anthropic", "messages"), CancellationToken::new())
            .await
            .expect("request within rate limit should complete");
    }

    let limited = broker
        .broker
        .request_credential(broker.request("w1", "ci", "anthropic", "messages"), CancellationToken::new())
        .await;
    assert_credential_error!(limited, RateLimited);
    assert_eq!(last_credential_entry(&broker).reason_code(), "rate_limited");

    let other_worker = broker
        .broker
        .request_credential(broker.request("w2", "ci", "anthropic", "messages"), CancellationToken::new())
        .await;
    assert!(other_worker.is_ok(), "limits are per worker: {other_worker:?}");
}

#[tokio::test]
async fn transient_upstream_failure_is_retried() {
    let broker = TestBroker::new(POLICY);
    broker.upstream.push(MockReply::Fail(CredentialError::upstream_transient("503")));

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await
        .expect("retry should succeed");

    assert_eq!(result.status, 200);
    assert_eq!(broker.upstream.calls(), 2);
}

#[tokio::test]
async fn permanent_upstream_failure_is_not_retried() {
    let broker = TestBroker::new(POLICY);
    broker.upstream.push(MockReply::Fail(CredentialError::upstream_permanent("bad gateway config")));

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await;

    assert_credential_error!(result, UpstreamError);
    assert_eq!(broker.upstream.calls(), 1);
    assert_eq!(last_credential_entry(&broker).decision(), AuditDecision::Failed);
}

#[tokio::test]
async fn retries_stop_after_max_attempts() {
    let broker = TestBroker::new(POLICY);
    for _ in 0..5 {
        broker.upstream.push(MockReply::Fail(CredentialError::upstream_transient("503")));
    }

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await;

    assert_credential_error!(result, UpstreamError);
    assert_eq!(broker.upstream.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_upstream_times_out() {
    let options = TestBrokerOptions::builder().upstream_timeout(Duration::from_millis(100)).build();
    let broker = TestBroker::with_options(POLICY, options);
    broker.upstream.push(MockReply::Delay(Duration::from_secs(10)));

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await;

    assert_credential_error!(result, UpstreamTimeout);
    let entry = last_credential_entry(&broker);
    assert_eq!(entry.decision(), AuditDecision::Failed);
    assert_eq!(entry.reason_code(), "upstream_timeout");
}

#[tokio::test]
async fn approved_request_runs_after_operator_decision() {
    let broker = TestBroker::new(POLICY);
    let request = broker.request("w1", "ci", "github", "create_issue");
    let request_id = request.request_id.clone();

    let handle = park(&broker, request, CancellationToken::new()).await;
    assert_eq!(broker.upstream.calls(), 0);

    let pending = broker.broker.approvals().list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, request_id);
    assert_eq!(pending[0].role, "ci");
    assert_ne!(pending[0].approval_id, request_id);

    broker
        .broker
        .approvals()
        .resolve(&pending[0].approval_id, ApprovalDecision::approved("ops"))
        .await
        .expect("resolve should succeed");

    let result = handle.await.expect("task panicked").expect("approved request should complete");
    assert_eq!(result.status, 200);
    assert_eq!(broker.upstream.calls(), 1);

    let actions: Vec<_> = broker.audit.entries().iter().map(AuditEntry::action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::ApprovalRequested,
            AuditAction::ApprovalResolved,
            AuditAction::CredentialRequest,
        ]
    );
    assert_eq!(last_credential_entry(&broker).decision(), AuditDecision::Completed);
}

#[tokio::test]
async fn operator_denial_is_a_policy_denial() {
    let broker = TestBroker::new(POLICY);
    let request = broker.request("w1", "ci", "github", "create_issue");

    let handle = park(&broker, request, CancellationToken::new()).await;
    broker
        .broker
        .approvals()
        .resolve(&sole_approval_id(&broker), ApprovalDecision::denied("ops", Some("change freeze".into())))
        .await
        .expect("resolve should succeed");

    let result = handle.await.expect("task panicked");
    assert_credential_error!(result, PolicyDenied);
    assert_eq!(broker.upstream.calls(), 0);

    let entries = broker.audit.entries();
    let resolved = entries
        .iter()
        .find(|e| e.action() == AuditAction::ApprovalResolved)
        .expect("resolution should be audited");
    assert_eq!(resolved.decision(), AuditDecision::Denied);
    assert_eq!(resolved.metadata().get("reason").map(String::as_str), Some("change freeze"));
    assert_eq!(credential_entries(&entries).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_approval_times_out() {
    let options = TestBrokerOptions::builder().approval_timeout(Duration::from_millis(50)).build();
    let broker = TestBroker::with_options(POLICY, options);

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "create_issue"), CancellationToken::new())
        .await;

    assert_credential_error!(result, ApprovalTimeout);
    assert_eq!(broker.broker.approvals().pending_count(), 0);
    assert_eq!(last_credential_entry(&broker).reason_code(), "approval_timeout");
}

#[tokio::test]
async fn resolving_unknown_request_fails() {
    let broker = TestBroker::new(POLICY);
    let result = broker.broker.approvals().resolve("nope", ApprovalDecision::approved("ops")).await;
    assert_credential_error!(result, ApprovalNotFound);
}

#[tokio::test]
async fn caller_cancel_withdraws_pending_approval() {
    let broker = TestBroker::new(POLICY);
    let cancel = CancellationToken::new();
    let request = broker.request("w1", "ci", "github", "create_issue");

    let handle = park(&broker, request, cancel.clone()).await;
    let approval_id = sole_approval_id(&broker);

    cancel.cancel();
    let result = handle.await.expect("task panicked");
    assert_credential_error!(result, CanceledByCaller);
    assert_eq!(broker.broker.approvals().pending_count(), 0);

    let entry = last_credential_entry(&broker);
    assert_eq!(entry.decision(), AuditDecision::Canceled);
    assert_eq!(entry.reason_code(), "canceled_by_caller");

    let late = broker.broker.approvals().resolve(&approval_id, ApprovalDecision::approved("ops")).await;
    assert_credential_error!(late, ApprovalNotFound);
    assert_eq!(broker.upstream.calls(), 0);
}

#[tokio::test]
async fn canceled_request_leaves_other_workers_approval_alone() {
    let broker = TestBroker::new(POLICY);
    let waiting = CredentialRequest::builder()
        .request_id("r-1")
        .worker_id("w1")
        .caller_role("ci")
        .service("github")
        .operation("create_issue")
        .target("acme/widgets")
        .build();
    let handle = park(&broker, waiting, CancellationToken::new()).await;
    let approval_id = sole_approval_id(&broker);

    // Same request id from another worker, canceled before it runs
    let canceled = CancellationToken::new();
    canceled.cancel();
    let colliding = CredentialRequest::builder()
        .request_id("r-1")
        .worker_id("w2")
        .caller_role("ci")
        .service("github")
        .operation("read")
        .target("acme/widgets")
        .build();
    let result = broker.broker.request_credential(colliding, canceled).await;
    assert_credential_error!(result, CanceledByCaller);

    assert_eq!(broker.broker.approvals().pending_count(), 1);
    broker
        .broker
        .approvals()
        .resolve(&approval_id, ApprovalDecision::approved("ops"))
        .await
        .expect("the parked approval should still be pending");
    let outcome = handle.await.expect("task panicked");
    assert!(outcome.is_ok(), "parked request should run after approval: {outcome:?}");
}

#[tokio::test]
async fn colliding_request_ids_park_separately() {
    let broker = TestBroker::new(POLICY);
    let request = |worker: &str| {
        CredentialRequest::builder()
            .request_id("r-1")
            .worker_id(worker)
            .caller_role("ci")
            .service("github")
            .operation("create_issue")
            .target("acme/widgets")
            .build()
    };

    let first = park(&broker, request("w1"), CancellationToken::new()).await;
    let second = park(&broker, request("w2"), CancellationToken::new()).await;
    let pending = broker.broker.approvals().list_pending();
    assert_eq!(pending.len(), 2);

    let for_w2 = pending.iter().find(|p| p.worker_id.as_str() == "w2").expect("w2 pending");
    broker
        .broker
        .approvals()
        .resolve(&for_w2.approval_id, ApprovalDecision::denied("ops", None))
        .await
        .expect("resolve should succeed");
    let denied = second.await.expect("task panicked");
    assert_credential_error!(denied, PolicyDenied);
    assert_eq!(broker.broker.approvals().list_pending()[0].worker_id.as_str(), "w1");

    let for_w1 = sole_approval_id(&broker);
    broker
        .broker
        .approvals()
        .resolve(&for_w1, ApprovalDecision::approved("ops"))
        .await
        .expect("resolve should succeed");
    assert!(first.await.expect("task panicked").is_ok());
}

#[tokio::test]
async fn forwarded_error_status_is_a_completed_request() {
    let broker = TestBroker::new(POLICY);
    broker.upstream.push(MockReply::Respond(ForwardedResult {
        status: 404,
        body: json!({"message": "Not Found"}),
    }));

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await
        .expect("non-transient statuses are forwarded");

    assert_eq!(result.status, 404);
    let entry = last_credential_entry(&broker);
    assert_eq!(entry.decision(), AuditDecision::Completed);
    assert_eq!(entry.metadata().get("status").map(String::as_str), Some("404"));
}
