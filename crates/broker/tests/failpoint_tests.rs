#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection in the broker crate.
//!
//! These tests require both `failpoints` and `testutil` features:
//! ```bash
//! cargo test -p sentra-broker --features failpoints,testutil --test failpoint_tests
//! ```

use sentra_broker::{assert_credential_error, testutil::TestBroker};
use sentra_common_storage::{AuditAction, AuditDecision};
use tokio_util::sync::CancellationToken;

const POLICY: &str = r"
version: 1
rules:
  - { role: ci, service: github, operation: read, effect: allow }
";

#[tokio::test]
async fn upstream_failpoint_fails_request_and_is_audited() {
    let scenario = fail::FailScenario::setup();
    let broker = TestBroker::new(POLICY);

    // Enable fail point: every upstream attempt fails before the call is made
    fail::cfg("upstream-before-call", "return").expect("failed to configure fail point");

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await;
    assert_credential_error!(result, UpstreamError);
    assert_eq!(broker.upstream.calls(), 0);

    let entries = broker.audit.entries();
    let entry = entries
        .iter()
        .find(|e| e.action() == AuditAction::CredentialRequest)
        .expect("request should be audited");
    assert_eq!(entry.decision(), AuditDecision::Failed);
    assert_eq!(entry.reason_code(), "upstream_error");

    scenario.teardown();
}

#[tokio::test]
async fn upstream_failpoint_fires_once() {
    let scenario = fail::FailScenario::setup();
    let broker = TestBroker::new(POLICY);

    fail::cfg("upstream-before-call", "1*return->off").expect("failed to configure fail point");

    let first = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await;
    assert_credential_error!(first, UpstreamError);

    let second = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await
        .expect("request after the fail point is exhausted should succeed");
    assert_eq!(second.status, 200);
    assert_eq!(broker.upstream.calls(), 1);

    scenario.teardown();
}

#[tokio::test]
async fn upstream_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    let broker = TestBroker::new(POLICY);

    let result = broker
        .broker
        .request_credential(broker.request("w1", "ci", "github", "read"), CancellationToken::new())
        .await;
    assert!(result.is_ok(), "request should succeed without fail point: {result:?}");

    scenario.teardown();
}
