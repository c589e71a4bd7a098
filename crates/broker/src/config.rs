//! Broker configuration.
//!
//! Loaded from a YAML file, then overridden by `SENTRA_*` environment
//! variables, then validated. Nothing the broker needs at runtime is
//! hardcoded: sockets, store paths, timeouts, budgets, the worker→role map
//! and every service definition come from here.
//!
//! ```yaml
//! worker_socket: /run/sentra/broker.sock
//! operator_socket: /run/sentra/operator.sock
//! policy_path: /etc/sentra/policy.yaml
//! task_budget: 50
//! worker_budget: 200
//! approval_timeout: 5m
//! workers:
//!   worker-1: agent
//! services:
//!   github:
//!     base_url: https://api.github.com
//!     secret:
//!       env: GITHUB_TOKEN
//!     operations:
//!       read:
//!         method: GET
//!         path: /repos/{target}
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    time::Duration,
};

use sentra_common_authn::AuthenticatorConfig;
use serde::{Deserialize, Serialize};

use crate::{
    approval::DEFAULT_APPROVAL_TIMEOUT,
    budget::DEFAULT_TASK_BUDGET,
    error::{CredentialError, Result},
    policy::DEFAULT_POLICY_RELOAD_INTERVAL,
    retry::RetryConfig,
    secrets::{SecretSource, SecretSpec, default_prefixes},
};

/// Default worker socket path.
pub const DEFAULT_WORKER_SOCKET: &str = "/run/sentra/broker.sock";

/// Default operator socket path.
pub const DEFAULT_OPERATOR_SOCKET: &str = "/run/sentra/operator.sock";

/// Default policy document path.
pub const DEFAULT_POLICY_PATH: &str = "/etc/sentra/policy.yaml";

/// Default audit log path.
pub const DEFAULT_AUDIT_PATH: &str = "/var/lib/sentra/audit.log";

/// Default key registry snapshot path.
pub const DEFAULT_KEY_REGISTRY_PATH: &str = "/var/lib/sentra/keys.json";

/// Default maximum concurrent connections across both sockets.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Default bound on one privileged call, retries included.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default header carrying the service secret.
pub const DEFAULT_AUTH_HEADER: &str = "authorization";

/// Default scheme prefixed to the secret in the auth header.
pub const DEFAULT_AUTH_SCHEME: &str = "Bearer";

/// HTTP methods an operation may use.
pub const SUPPORTED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

/// Placeholder replaced by the request target in an operation path.
pub const TARGET_PLACEHOLDER: &str = "{target}";

/// Top-level broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Socket workers send credential requests to.
    #[serde(default = "default_worker_socket")]
    #[builder(default = default_worker_socket())]
    pub worker_socket: PathBuf,

    /// Socket operators resolve approvals on.
    #[serde(default = "default_operator_socket")]
    #[builder(default = default_operator_socket())]
    pub operator_socket: PathBuf,

    /// Policy document, polled for changes.
    #[serde(default = "default_policy_path")]
    #[builder(default = default_policy_path())]
    pub policy_path: PathBuf,

    /// Line-delimited audit log.
    #[serde(default = "default_audit_path")]
    #[builder(default = default_audit_path())]
    pub audit_path: PathBuf,

    /// Key registry snapshot used by the `keys` and `auth` commands.
    #[serde(default = "default_key_registry_path")]
    #[builder(default = default_key_registry_path())]
    pub key_registry_path: PathBuf,

    /// Maximum concurrent connections.
    #[serde(default = "default_max_connections")]
    #[builder(default = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Privileged calls allowed per task.
    #[serde(default = "default_task_budget")]
    #[builder(default = DEFAULT_TASK_BUDGET)]
    pub task_budget: u32,

    /// Privileged calls one worker may make across all of its tasks.
    /// Defaults to `task_budget`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_budget: Option<u32>,

    /// How long a request waits for an operator.
    #[serde(with = "humantime_serde", default = "default_approval_timeout")]
    #[builder(default = DEFAULT_APPROVAL_TIMEOUT)]
    pub approval_timeout: Duration,

    /// Bound on one privileged call unless the operation sets its own.
    #[serde(with = "humantime_serde", default = "default_upstream_timeout")]
    #[builder(default = DEFAULT_UPSTREAM_TIMEOUT)]
    pub upstream_timeout: Duration,

    /// How often the policy file is checked for changes.
    #[serde(with = "humantime_serde", default = "default_policy_reload_interval")]
    #[builder(default = DEFAULT_POLICY_RELOAD_INTERVAL)]
    pub policy_reload_interval: Duration,

    /// Retry policy for transient upstream failures.
    #[serde(default)]
    #[builder(default)]
    pub retry: RetryConfig,

    /// Signed-request authentication settings.
    #[serde(default)]
    #[builder(default)]
    pub authn: AuthenticatorConfig,

    /// Worker id → policy role.
    #[serde(default)]
    #[builder(default)]
    pub workers: BTreeMap<String, String>,

    /// Services the broker can call on a worker's behalf.
    #[serde(default)]
    #[builder(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

/// One upstream service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Scheme, host and optional path prefix (`https://api.github.com`).
    pub base_url: String,

    /// Where the host secret is read from.
    pub secret: SecretSource,

    /// Accepted secret prefixes; defaults depend on the service name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_prefixes: Option<Vec<String>>,

    /// Header the secret is sent in.
    #[serde(default = "default_auth_header")]
    pub auth_header: String,

    /// Scheme prepended to the secret; `null` sends the bare secret.
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: Option<String>,

    /// Extra headers sent with every call.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Operation name → HTTP mapping.
    #[serde(default)]
    pub operations: BTreeMap<String, OperationConfig>,
}

/// HTTP mapping for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationConfig {
    /// Upper-case HTTP method.
    pub method: String,

    /// Path appended to the base URL; may contain `{target}`.
    pub path: String,

    /// Overrides the broker-wide upstream timeout.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

fn default_worker_socket() -> PathBuf {
    PathBuf::from(DEFAULT_WORKER_SOCKET)
}

fn default_operator_socket() -> PathBuf {
    PathBuf::from(DEFAULT_OPERATOR_SOCKET)
}

fn default_policy_path() -> PathBuf {
    PathBuf::from(DEFAULT_POLICY_PATH)
}

fn default_audit_path() -> PathBuf {
    PathBuf::from(DEFAULT_AUDIT_PATH)
}

fn default_key_registry_path() -> PathBuf {
    PathBuf::from(DEFAULT_KEY_REGISTRY_PATH)
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_task_budget() -> u32 {
    DEFAULT_TASK_BUDGET
}

fn default_approval_timeout() -> Duration {
    DEFAULT_APPROVAL_TIMEOUT
}

fn default_upstream_timeout() -> Duration {
    DEFAULT_UPSTREAM_TIMEOUT
}

fn default_policy_reload_interval() -> Duration {
    DEFAULT_POLICY_RELOAD_INTERVAL
}

fn default_auth_header() -> String {
    DEFAULT_AUTH_HEADER.to_owned()
}

#[allow(clippy::unnecessary_wraps)]
fn default_auth_scheme() -> Option<String> {
    Some(DEFAULT_AUTH_SCHEME.to_owned())
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BrokerConfig {
    /// Parses a YAML document without validating it.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidConfig`] on malformed YAML or
    /// unknown fields.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CredentialError::invalid_config(format!("parse error: {e}")))
    }

    /// Loads `path`, applies `SENTRA_*` overrides from the process
    /// environment and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] if the file cannot be read and
    /// [`CredentialError::InvalidConfig`] if it is invalid.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CredentialError::io(format!("reading {}", path.display()), e))?;
        let mut config = Self::from_yaml(&raw)?;
        config.apply_env_overrides(|name: &str| std::env::var(name).ok())?;
        config.validate()?;
        tracing::debug!(path = %path.display(), services = config.services.len(), "configuration loaded");
        Ok(config)
    }

    /// Applies `SENTRA_*` overrides using `lookup` to read variables.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidConfig`] if a variable cannot be
    /// parsed.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SENTRA_WORKER_SOCKET") {
            self.worker_socket = PathBuf::from(v);
        }
        if let Some(v) = lookup("SENTRA_OPERATOR_SOCKET") {
            self.operator_socket = PathBuf::from(v);
        }
        if let Some(v) = lookup("SENTRA_POLICY_PATH") {
            self.policy_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SENTRA_AUDIT_PATH") {
            self.audit_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SENTRA_KEY_REGISTRY_PATH") {
            self.key_registry_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SENTRA_MAX_CONNECTIONS") {
            self.max_connections = parse_number("SENTRA_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("SENTRA_TASK_BUDGET") {
            self.task_budget = parse_number("SENTRA_TASK_BUDGET", &v)?;
        }
        if let Some(v) = lookup("SENTRA_WORKER_BUDGET") {
            self.worker_budget = Some(parse_number("SENTRA_WORKER_BUDGET", &v)?);
        }
        if let Some(v) = lookup("SENTRA_APPROVAL_TIMEOUT") {
            self.approval_timeout = parse_duration("SENTRA_APPROVAL_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("SENTRA_UPSTREAM_TIMEOUT") {
            self.upstream_timeout = parse_duration("SENTRA_UPSTREAM_TIMEOUT", &v)?;
        }
        Ok(())
    }

    /// Validates the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(CredentialError::invalid_config("max_connections must be at least 1"));
        }
        if self.task_budget == 0 {
            return Err(CredentialError::invalid_config("task_budget must be at least 1"));
        }
        if self.worker_budget == Some(0) {
            return Err(CredentialError::invalid_config("worker_budget must be at least 1"));
        }
        if self.approval_timeout.is_zero() {
            return Err(CredentialError::invalid_config("approval_timeout must be non-zero"));
        }
        if self.upstream_timeout.is_zero() {
            return Err(CredentialError::invalid_config("upstream_timeout must be non-zero"));
        }
        if self.policy_reload_interval.is_zero() {
            return Err(CredentialError::invalid_config("policy_reload_interval must be non-zero"));
        }
        if self.worker_socket == self.operator_socket {
            return Err(CredentialError::invalid_config(
                "worker_socket and operator_socket must differ",
            ));
        }
        self.retry.validate()?;
        self.authn
            .validate()
            .map_err(|e| CredentialError::invalid_config(format!("authn: {e}")))?;

        for (worker, role) in &self.workers {
            if role.trim().is_empty() {
                return Err(CredentialError::invalid_config(format!(
                    "worker {worker}: role must not be empty"
                )));
            }
        }
        for (name, service) in &self.services {
            service
                .validate()
                .map_err(|e| CredentialError::invalid_config(format!("service {name}: {e}")))?;
        }
        Ok(())
    }

    /// Policy role for `worker_id`, if the worker is known.
    #[must_use]
    pub fn role_for(&self, worker_id: &str) -> Option<&str> {
        self.workers.get(worker_id).map(String::as_str)
    }

    /// Secret definitions for [`HostSecretStore`](crate::secrets::HostSecretStore).
    #[must_use]
    pub fn secret_specs(&self) -> HashMap<String, SecretSpec> {
        self.services
            .iter()
            .map(|(name, service)| {
                let prefixes =
                    service.secret_prefixes.clone().unwrap_or_else(|| default_prefixes(name));
                (name.clone(), SecretSpec { source: service.secret.clone(), prefixes })
            })
            .collect()
    }
}

impl ServiceConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err("base_url must start with http:// or https://".to_owned());
        }
        if self.auth_header.trim().is_empty() {
            return Err("auth_header must not be empty".to_owned());
        }
        if self.operations.is_empty() {
            return Err("at least one operation is required".to_owned());
        }
        for (name, op) in &self.operations {
            if !SUPPORTED_METHODS.contains(&op.method.as_str()) {
                return Err(format!("operation {name}: unsupported method {}", op.method));
            }
            if !op.path.starts_with('/') {
                return Err(format!("operation {name}: path must start with '/'"));
            }
            if op.timeout.is_some_and(|t| t.is_zero()) {
                return Err(format!("operation {name}: timeout must be non-zero"));
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CredentialError::invalid_config(format!("{name}: expected a number, got {value:?}")))
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime_serde::re::humantime::parse_duration(value.trim())
        .map_err(|e| CredentialError::invalid_config(format!("{name}: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    const SAMPLE: &str = r"
worker_socket: /tmp/sentra/w.sock
operator_socket: /tmp/sentra/o.sock
task_budget: 5
worker_budget: 20
approval_timeout: 90s
retry:
  max_retries: 1
workers:
  worker-1: agent
services:
  github:
    base_url: https://api.github.com
    secret:
      env: GITHUB_TOKEN
    headers:
      accept: application/vnd.github+json
    operations:
      read:
        method: GET
        path: /repos/{target}
      create_pr:
        method: POST
        path: /repos/{target}/pulls
        timeout: 10s
  anthropic:
    base_url: https://api.anthropic.com
    secret:
      file: /etc/sentra/anthropic.key
    auth_header: x-api-key
    auth_scheme: null
    operations:
      api_call:
        method: POST
        path: /v1/messages
";

    #[test]
    fn test_parse_sample() {
        let config = BrokerConfig::from_yaml(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.task_budget, 5);
        assert_eq!(config.worker_budget, Some(20));
        assert_eq!(config.approval_timeout, Duration::from_secs(90));
        assert_eq!(config.upstream_timeout, DEFAULT_UPSTREAM_TIMEOUT);
        assert_eq!(config.retry.max_retries(), 1);
        assert_eq!(config.role_for("worker-1"), Some("agent"));
        assert_eq!(config.role_for("stranger"), None);

        let github = &config.services["github"];
        assert_eq!(github.auth_header, "authorization");
        assert_eq!(github.auth_scheme.as_deref(), Some("Bearer"));
        assert_eq!(github.operations["create_pr"].timeout, Some(Duration::from_secs(10)));

        let anthropic = &config.services["anthropic"];
        assert_eq!(anthropic.auth_scheme, None);
        assert_eq!(anthropic.secret, SecretSource::File("/etc/sentra/anthropic.key".into()));
    }

    #[test]
    fn test_secret_specs_use_service_defaults() {
        let config = BrokerConfig::from_yaml(SAMPLE).unwrap();
        let specs = config.secret_specs();
        assert!(specs["github"].prefixes.iter().any(|p| p == "ghp_"));
        assert_eq!(specs["anthropic"].prefixes, vec!["sk-ant-".to_owned()]);
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = BrokerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.approval_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            BrokerConfig::from_yaml("bogus: 1"),
            Err(CredentialError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BrokerConfig::from_yaml(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("SENTRA_WORKER_SOCKET", "/run/x/w.sock"),
            ("SENTRA_TASK_BUDGET", "9"),
            ("SENTRA_WORKER_BUDGET", "30"),
            ("SENTRA_APPROVAL_TIMEOUT", "2m"),
            ("SENTRA_UPSTREAM_TIMEOUT", "1500ms"),
        ]
        .into_iter()
        .collect();

        config.apply_env_overrides(|name: &str| env.get(name).map(|v| (*v).to_owned())).unwrap();

        assert_eq!(config.worker_socket, PathBuf::from("/run/x/w.sock"));
        assert_eq!(config.task_budget, 9);
        assert_eq!(config.worker_budget, Some(30));
        assert_eq!(config.approval_timeout, Duration::from_secs(120));
        assert_eq!(config.upstream_timeout, Duration::from_millis(1500));
        assert_eq!(config.operator_socket, PathBuf::from("/tmp/sentra/o.sock"));
    }

    #[test]
    fn test_bad_env_override_rejected() {
        let mut config = BrokerConfig::default();
        let result = config.apply_env_overrides(|name: &str| {
            (name == "SENTRA_MAX_CONNECTIONS").then(|| "lots".to_owned())
        });
        assert!(matches!(result, Err(CredentialError::InvalidConfig(_))));
    }

    #[rstest]
    #[case("task_budget: 0", "task_budget")]
    #[case("worker_budget: 0", "worker_budget")]
    #[case("max_connections: 0", "max_connections")]
    #[case("approval_timeout: 0s", "approval_timeout")]
    #[case("worker_socket: /a\noperator_socket: /a", "must differ")]
    #[case("workers:\n  w1: ''", "role must not be empty")]
    #[case(
        "services:\n  github:\n    base_url: ftp://x\n    secret: {env: T}\n    operations:\n      read: {method: GET, path: /x}",
        "base_url"
    )]
    #[case(
        "services:\n  github:\n    base_url: https://x\n    secret: {env: T}\n    operations:\n      read: {method: FETCH, path: /x}",
        "unsupported method"
    )]
    #[case(
        "services:\n  github:\n    base_url: https://x\n    secret: {env: T}\n    operations: {}",
        "at least one operation"
    )]
    fn test_validation_failures(#[case] yaml: &str, #[case] needle: &str) {
        let config = BrokerConfig::from_yaml(yaml).unwrap();
        match config.validate() {
            Err(CredentialError::InvalidConfig(msg)) => {
                assert!(msg.contains(needle), "{msg} should mention {needle}");
            },
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.yaml");
        tokio::fs::write(&path, SAMPLE).await.unwrap();

        let config = BrokerConfig::load(&path).await.unwrap();
        assert_eq!(config.services.len(), 2);
    }
}
