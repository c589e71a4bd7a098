//! Shared test utilities for broker testing.
//!
//! Provides a scriptable [`MockUpstream`] and a [`TestBroker`] wired to an
//! in-memory secret store, a fault-injectable audit log and a policy given
//! as YAML. It is feature-gated behind `testutil` to prevent leaking into
//! production builds.
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use sentra_broker::testutil::{MockUpstream, TestBroker};
//! ```

use std::{
    collections::{BTreeSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use sentra_common_storage::testutil::FailingAuditLog;
use serde_json::{Value, json};

use crate::{
    broker::{CredentialBroker, CredentialRequest},
    error::{CredentialError, Result},
    policy::{PolicyDocument, PolicyStore},
    retry::RetryConfig,
    secrets::{MemorySecretStore, Secret},
    upstream::{ForwardedResult, Upstream, UpstreamCall},
};

/// GitHub token held by [`TestBroker`]'s secret store.
pub const TEST_GITHUB_TOKEN: &str = "ghp_testhostsecret000";

/// Anthropic key held by [`TestBroker`]'s secret store.
pub const TEST_ANTHROPIC_KEY: &str = "sk-ant-testhostkey000";

/// One scripted upstream reply.
#[derive(Debug)]
pub enum MockReply {
    /// Return this result.
    Respond(ForwardedResult),
    /// Return a 200 whose body contains the secret the call was made with.
    EchoSecret,
    /// Fail with this error.
    Fail(CredentialError),
    /// Sleep, then return the default reply.
    Delay(Duration),
}

/// Upstream double recording calls and replaying scripted replies.
///
/// Unscripted calls return `200 {"ok": true}`.
#[derive(Debug)]
pub struct MockUpstream {
    services: BTreeSet<String>,
    replies: Mutex<VecDeque<MockReply>>,
    calls: AtomicU32,
    secrets_seen: Mutex<Vec<String>>,
}

impl MockUpstream {
    /// Creates a mock that knows `services`.
    #[must_use]
    pub fn new<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            services: services.into_iter().map(Into::into).collect(),
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            secrets_seen: Mutex::new(Vec::new()),
        }
    }

    /// Queues a reply for the next unanswered call.
    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// Number of call attempts made.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Secrets the calls were made with, in order.
    #[must_use]
    pub fn secrets_seen(&self) -> Vec<String> {
        self.secrets_seen.lock().clone()
    }
}

fn default_reply() -> ForwardedResult {
    ForwardedResult { status: 200, body: json!({"ok": true}) }
}

#[async_trait]
impl Upstream for MockUpstream {
    fn validate(&self, call: &UpstreamCall<'_>) -> Result<()> {
        if self.services.contains(call.service) {
            Ok(())
        } else {
            Err(CredentialError::UnknownService(call.service.to_owned()))
        }
    }

    async fn call(&self, call: &UpstreamCall<'_>, secret: &Secret) -> Result<ForwardedResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.secrets_seen.lock().push(secret.expose().to_owned());
        let reply = self.replies.lock().pop_front();
        match reply {
            None => Ok(default_reply()),
            Some(MockReply::Respond(result)) => Ok(result),
            Some(MockReply::EchoSecret) => Ok(ForwardedResult {
                status: 200,
                body: json!({
                    "service": call.service,
                    "headers": {"authorization": format!("Bearer {}", secret.expose())},
                    "echo": [secret.expose()],
                }),
            }),
            Some(MockReply::Fail(err)) => Err(err),
            Some(MockReply::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(default_reply())
            },
        }
    }
}

/// A broker over test doubles.
pub struct TestBroker {
    /// The broker under test.
    pub broker: Arc<CredentialBroker>,
    /// Audit log shared with the broker; can be switched to failing.
    pub audit: FailingAuditLog,
    /// Upstream double shared with the broker.
    pub upstream: Arc<MockUpstream>,
    /// Secret store shared with the broker.
    pub secrets: Arc<MemorySecretStore>,
}

/// Options for [`TestBroker::with_options`].
#[derive(Debug, Clone, bon::Builder)]
pub struct TestBrokerOptions {
    /// Per-task budget.
    #[builder(default = 100)]
    pub task_budget: u32,
    /// Per-worker cap; defaults to the task budget.
    pub worker_budget: Option<u32>,
    /// Approval timeout.
    #[builder(default = Duration::from_secs(300))]
    pub approval_timeout: Duration,
    /// Upstream timeout.
    #[builder(default = Duration::from_secs(30))]
    pub upstream_timeout: Duration,
    /// Retries after the first attempt, with 1 ms backoff.
    #[builder(default = 2)]
    pub max_retries: u32,
}

impl TestBroker {
    /// Builds a broker with default options over `policy_yaml`.
    ///
    /// # Panics
    ///
    /// Panics if the policy is invalid.
    #[must_use]
    pub fn new(policy_yaml: &str) -> Self {
        Self::with_options(policy_yaml, TestBrokerOptions::builder().build())
    }

    /// Builds a broker with custom options.
    ///
    /// # Panics
    ///
    /// Panics if the policy or options are invalid.
    #[must_use]
    pub fn with_options(policy_yaml: &str, options: TestBrokerOptions) -> Self {
        let document = PolicyDocument::from_yaml(policy_yaml).expect("test policy must be valid");
        let audit = FailingAuditLog::new();
        let upstream = Arc::new(MockUpstream::new(["github", "anthropic"]));
        let secrets = Arc::new(MemorySecretStore::new());
        secrets.insert("github", TEST_GITHUB_TOKEN);
        secrets.insert("anthropic", TEST_ANTHROPIC_KEY);

        let retry = RetryConfig::builder()
            .max_retries(options.max_retries)
            .initial_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(5))
            .build()
            .expect("test retry config must be valid");

        let broker = CredentialBroker::builder()
            .policy(Arc::new(PolicyStore::new(document)))
            .secrets(Arc::clone(&secrets) as _)
            .upstream(Arc::clone(&upstream) as _)
            .audit(Arc::new(audit.clone()))
            .task_budget(options.task_budget)
            .maybe_worker_budget(options.worker_budget)
            .approval_timeout(options.approval_timeout)
            .upstream_timeout(options.upstream_timeout)
            .retry(retry)
            .build()
            .expect("test broker options must be valid");

        Self { broker: Arc::new(broker), audit, upstream, secrets }
    }

    /// A request from `worker` acting as `role`.
    #[must_use]
    pub fn request(&self, worker: &str, role: &str, service: &str, operation: &str) -> CredentialRequest {
        CredentialRequest::builder()
            .worker_id(worker)
            .caller_role(role)
            .service(service)
            .operation(operation)
            .target("acme/widgets")
            .build()
    }
}

/// Returns `true` if `secret` appears anywhere in `value`.
#[must_use]
pub fn contains_secret(value: &Value, secret: &str) -> bool {
    match value {
        Value::String(s) => s.contains(secret),
        Value::Array(items) => items.iter().any(|v| contains_secret(v, secret)),
        Value::Object(map) => {
            map.iter().any(|(k, v)| k.contains(secret) || contains_secret(v, secret))
        },
        _ => false,
    }
}

/// Assert that a broker result is a specific [`CredentialError`] variant.
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use sentra_broker::{assert_credential_error, error::CredentialError};
///
/// let result: Result<(), CredentialError> = Err(CredentialError::CanceledByCaller);
/// assert_credential_error!(result, CanceledByCaller);
/// ```
#[macro_export]
macro_rules! assert_credential_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::CredentialError::$variant { .. })),
            "expected CredentialError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
}
