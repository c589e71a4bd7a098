//! Host secrets.
//!
//! Secrets are fetched fresh for every approved call and dropped (and
//! zeroized) as soon as the upstream response is in hand. They never cross
//! the IPC boundary and never appear in `Debug` output, errors or logs.

use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::error::{CredentialError, Result};

/// Accepted GitHub token prefixes (classic, OAuth, user, server, refresh).
pub const GITHUB_TOKEN_PREFIXES: &[&str] = &["ghp_", "gho_", "ghu_", "ghs_", "ghr_"];

/// Accepted Anthropic API key prefix.
pub const ANTHROPIC_KEY_PREFIX: &str = "sk-ant-";

/// Replacement written over secret occurrences in forwarded results.
pub const REDACTED: &str = "[REDACTED]";

/// A secret value held only in broker memory.
pub struct Secret(Zeroizing<String>);

impl Secret {
    /// Wraps a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Returns the secret for use in an outgoing upstream request.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Replaces every occurrence of the secret in the string values and
    /// object keys of `value`.
    ///
    /// Returns the number of strings that were rewritten.
    pub fn redact_from(&self, value: &mut Value) -> usize {
        if self.0.is_empty() {
            return 0;
        }
        redact_value(value, &self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

fn redact_value(value: &mut Value, secret: &str) -> usize {
    match value {
        Value::String(s) if s.contains(secret) => {
            *s = s.replace(secret, REDACTED);
            1
        },
        Value::Array(items) => items.iter_mut().map(|v| redact_value(v, secret)).sum(),
        Value::Object(map) => {
            let mut rewritten = 0;
            let tainted: Vec<String> = map.keys().filter(|k| k.contains(secret)).cloned().collect();
            for key in tainted {
                if let Some(v) = map.remove(&key) {
                    map.insert(key.replace(secret, REDACTED), v);
                    rewritten += 1;
                }
            }
            rewritten + map.values_mut().map(|v| redact_value(v, secret)).sum::<usize>()
        },
        _ => 0,
    }
}

/// Where a service's secret lives on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    /// An environment variable of the broker process.
    Env(String),
    /// A file readable by the broker; surrounding whitespace is trimmed.
    File(PathBuf),
}

/// Source and expected shape of one service's secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    /// Where to read the secret from.
    pub source: SecretSource,
    /// Accepted prefixes; empty accepts any non-empty value.
    pub prefixes: Vec<String>,
}

/// Prefixes enforced for well-known services when none are configured.
#[must_use]
pub fn default_prefixes(service: &str) -> Vec<String> {
    match service {
        "github" => GITHUB_TOKEN_PREFIXES.iter().map(|p| (*p).to_owned()).collect(),
        "anthropic" => vec![ANTHROPIC_KEY_PREFIX.to_owned()],
        _ => Vec::new(),
    }
}

/// Checks a secret against the accepted prefixes.
///
/// # Errors
///
/// Returns [`CredentialError::SecretUnavailable`] if the value is empty or
/// matches none of `prefixes`.
pub fn validate_format(service: &str, value: &str, prefixes: &[String]) -> Result<()> {
    if value.is_empty() {
        return Err(CredentialError::secret_unavailable(service, "secret is empty"));
    }
    if !prefixes.is_empty() && !prefixes.iter().any(|p| value.starts_with(p.as_str())) {
        return Err(CredentialError::secret_unavailable(service, "unexpected secret format"));
    }
    Ok(())
}

/// Supplies secrets to the broker.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetches the current secret for `service`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::SecretUnavailable`] if the secret is
    /// missing, unreadable or has the wrong shape.
    async fn fetch(&self, service: &str) -> Result<Secret>;
}

#[async_trait]
impl<S: SecretStore + ?Sized> SecretStore for Arc<S> {
    async fn fetch(&self, service: &str) -> Result<Secret> {
        (**self).fetch(service).await
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads secrets from the broker's environment or from host files.
pub struct HostSecretStore {
    specs: HashMap<String, SecretSpec>,
    env: EnvLookup,
}

impl HostSecretStore {
    /// Creates a store reading the process environment.
    #[must_use]
    pub fn new(specs: HashMap<String, SecretSpec>) -> Self {
        Self::with_env_lookup(specs, Arc::new(|name: &str| std::env::var(name).ok()))
    }

    /// Creates a store that resolves environment variables through `env`.
    #[must_use]
    pub fn with_env_lookup(specs: HashMap<String, SecretSpec>, env: EnvLookup) -> Self {
        Self { specs, env }
    }

    /// Returns `true` if a secret source is configured for `service`.
    #[must_use]
    pub fn has_service(&self, service: &str) -> bool {
        self.specs.contains_key(service)
    }
}

impl fmt::Debug for HostSecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSecretStore").field("services", &self.specs.keys()).finish()
    }
}

#[async_trait]
impl SecretStore for HostSecretStore {
    #[tracing::instrument(skip(self))]
    async fn fetch(&self, service: &str) -> Result<Secret> {
        let spec = self
            .specs
            .get(service)
            .ok_or_else(|| CredentialError::secret_unavailable(service, "no secret configured"))?;

        let raw: Zeroizing<String> = match &spec.source {
            SecretSource::Env(var) => match (self.env)(var) {
                Some(value) => Zeroizing::new(value),
                None => {
                    tracing::warn!(service, var = %var, "secret environment variable is not set");
                    return Err(CredentialError::secret_unavailable(service, "secret not set"));
                },
            },
            SecretSource::File(path) => match tokio::fs::read_to_string(path).await {
                Ok(contents) => Zeroizing::new(contents),
                Err(e) => {
                    tracing::warn!(service, path = %path.display(), error = %e, "secret file unreadable");
                    return Err(CredentialError::secret_unavailable(service, "secret file unreadable"));
                },
            },
        };

        let value = raw.trim();
        if let Err(e) = validate_format(service, value, &spec.prefixes) {
            tracing::error!(service, "secret failed format validation");
            return Err(e);
        }
        Ok(Secret::new(value))
    }
}

/// In-memory secret store for tests and embedding.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: DashMap<String, Zeroizing<String>>,
}

impl MemorySecretStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the secret for `service`.
    pub fn insert(&self, service: impl Into<String>, value: impl Into<String>) {
        self.secrets.insert(service.into(), Zeroizing::new(value.into()));
    }

    /// Removes the secret for `service`.
    pub fn remove(&self, service: &str) {
        self.secrets.remove(service);
    }
}

impl fmt::Debug for MemorySecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySecretStore").field("services", &self.secrets.len()).finish()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn fetch(&self, service: &str) -> Result<Secret> {
        self.secrets
            .get(service)
            .map(|s| Secret::new(s.as_str()))
            .ok_or_else(|| CredentialError::secret_unavailable(service, "no secret configured"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::io::Write;

    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn env_store(service: &str, var: &str, value: Option<&'static str>) -> HostSecretStore {
        let mut specs = HashMap::new();
        specs.insert(
            service.to_owned(),
            SecretSpec { source: SecretSource::Env(var.to_owned()), prefixes: default_prefixes(service) },
        );
        let var = var.to_owned();
        HostSecretStore::with_env_lookup(
            specs,
            Arc::new(move |name: &str| if name == var { value.map(str::to_owned) } else { None }),
        )
    }

    #[test]
    fn test_debug_never_shows_value() {
        let secret = Secret::new("ghp_supersecret");
        assert_eq!(format!("{secret:?}"), "Secret([REDACTED])");
    }

    #[rstest]
    #[case("github", "ghp_abc123", true)]
    #[case("github", "gho_abc123", true)]
    #[case("github", "ghu_abc123", true)]
    #[case("github", "ghs_abc123", true)]
    #[case("github", "ghr_abc123", true)]
    #[case("github", "github_pat_abc", false)]
    #[case("github", "sk-ant-abc", false)]
    #[case("anthropic", "sk-ant-api03-xyz", true)]
    #[case("anthropic", "sk-proj-xyz", false)]
    #[case("anthropic", "", false)]
    #[case("internal", "anything-goes", true)]
    fn test_prefix_validation(#[case] service: &str, #[case] value: &str, #[case] ok: bool) {
        let result = validate_format(service, value, &default_prefixes(service));
        assert_eq!(result.is_ok(), ok, "{service} / {value}");
        if let Err(e) = result {
            assert_eq!(e.code(), "secret_unavailable");
        }
    }

    #[tokio::test]
    async fn test_env_store_fetches_valid_secret() {
        let store = env_store("github", "GITHUB_TOKEN", Some("ghp_valid"));
        let secret = store.fetch("github").await.unwrap();
        assert_eq!(secret.expose(), "ghp_valid");
    }

    #[tokio::test]
    async fn test_env_store_rejects_wrong_shape() {
        let store = env_store("github", "GITHUB_TOKEN", Some("not-a-token"));
        let err = store.fetch("github").await.unwrap_err();
        assert!(matches!(err, CredentialError::SecretUnavailable { .. }));
        assert!(!err.to_string().contains("not-a-token"));
    }

    #[tokio::test]
    async fn test_env_store_missing_variable() {
        let store = env_store("anthropic", "ANTHROPIC_API_KEY", None);
        assert!(matches!(
            store.fetch("anthropic").await,
            Err(CredentialError::SecretUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_service_is_unavailable() {
        let store = env_store("github", "GITHUB_TOKEN", Some("ghp_valid"));
        assert!(!store.has_service("anthropic"));
        assert!(store.fetch("anthropic").await.is_err());
    }

    #[tokio::test]
    async fn test_file_source_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  sk-ant-from-file  ").unwrap();

        let mut specs = HashMap::new();
        specs.insert(
            "anthropic".to_owned(),
            SecretSpec {
                source: SecretSource::File(file.path().to_path_buf()),
                prefixes: default_prefixes("anthropic"),
            },
        );
        let store = HostSecretStore::new(specs);
        assert_eq!(store.fetch("anthropic").await.unwrap().expose(), "sk-ant-from-file");
    }

    #[test]
    fn test_redact_nested_values_and_keys() {
        let secret = Secret::new("ghp_leak");
        let mut body = json!({
            "message": "token ghp_leak rejected",
            "items": ["ok", "ghp_leak"],
            "ghp_leak": {"nested": "Bearer ghp_leak"},
            "count": 3
        });

        let rewritten = secret.redact_from(&mut body);
        assert_eq!(rewritten, 4);
        let text = body.to_string();
        assert!(!text.contains("ghp_leak"));
        assert_eq!(body["message"], "token [REDACTED] rejected");
        assert_eq!(body["[REDACTED]"]["nested"], "Bearer [REDACTED]");
    }

    #[test]
    fn test_secret_source_yaml_shape() {
        let env: SecretSource = serde_yaml::from_str("env: GITHUB_TOKEN").unwrap();
        assert_eq!(env, SecretSource::Env("GITHUB_TOKEN".into()));
        let file: SecretSource = serde_yaml::from_str("file: /run/secrets/anthropic").unwrap();
        assert_eq!(file, SecretSource::File("/run/secrets/anthropic".into()));
    }
}
