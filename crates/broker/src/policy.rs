//! Default-deny credential policy.
//!
//! A [`PolicyDocument`] is a versioned list of [`PolicyRule`]s mapping
//! `(role, service, operation)` to an [`Effect`]. The [`PolicyStore`] holds
//! the active document behind an atomically swapped snapshot, so evaluation
//! never blocks on a reload.
//!
//! # Rule selection
//!
//! - A field set to `*` matches any value.
//! - Among matching rules, the one with the most non-wildcard fields wins.
//! - Ties between equally specific rules resolve toward the stricter effect: `deny` over
//!   `require_approval` over `allow`.
//! - No matching rule means [`Effect::Deny`].
//!
//! # Example
//!
//! ```
//! use sentra_broker::policy::{Effect, PolicyDocument, PolicyStore};
//!
//! let doc = PolicyDocument::from_yaml(
//!     r#"
//! version: 1
//! rules:
//!   - { role: "*", service: github, operation: "*", effect: require_approval }
//!   - { role: ci, service: github, operation: read, effect: allow }
//! "#,
//! )
//! .unwrap();
//! let store = PolicyStore::new(doc);
//!
//! assert_eq!(store.evaluate("ci", "github", "read"), Effect::Allow);
//! assert_eq!(store.evaluate("ci", "github", "push"), Effect::RequireApproval);
//! assert_eq!(store.evaluate("ci", "anthropic", "api_call"), Effect::Deny);
//! ```

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use arc_swap::ArcSwap;
use sentra_common_storage::{AuditAction, AuditDecision, AuditLog, NewAuditEntry, RateLimitConfig};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CredentialError, Result};

/// Policy document version understood by this broker.
pub const SUPPORTED_POLICY_VERSION: u32 = 1;

/// Default interval between policy file modification checks.
pub const DEFAULT_POLICY_RELOAD_INTERVAL: Duration = Duration::from_secs(2);

/// Field value matching anything.
pub const WILDCARD: &str = "*";

/// What the broker does with a matching request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Perform the call.
    Allow,
    /// Refuse the call.
    Deny,
    /// Park the call until an operator decides.
    RequireApproval,
}

impl Effect {
    /// Tie-break rank; higher is stricter.
    fn strictness(self) -> u8 {
        match self {
            Self::Allow => 0,
            Self::RequireApproval => 1,
            Self::Deny => 2,
        }
    }

    /// Returns the wire name of the effect.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::RequireApproval => "require_approval",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(role, service, operation) -> effect` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    /// Worker role, or `*`.
    pub role: String,
    /// Service name, or `*`.
    pub service: String,
    /// Operation name, or `*`.
    pub operation: String,
    /// Outcome for matching requests.
    pub effect: Effect,
    /// Optional per-worker rate limit for calls admitted by this rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

impl PolicyRule {
    fn field_matches(pattern: &str, value: &str) -> bool {
        pattern == WILDCARD || pattern == value
    }

    /// Returns `true` if the rule applies to the triple.
    #[must_use]
    pub fn matches(&self, role: &str, service: &str, operation: &str) -> bool {
        Self::field_matches(&self.role, role)
            && Self::field_matches(&self.service, service)
            && Self::field_matches(&self.operation, operation)
    }

    /// Number of non-wildcard fields.
    #[must_use]
    pub fn specificity(&self) -> u8 {
        [&self.role, &self.service, &self.operation]
            .into_iter()
            .map(|f| u8::from(f != WILDCARD))
            .sum()
    }

    /// Stable identifier used to namespace the rule's rate-limit counters.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.role, self.service, self.operation)
    }
}

/// Result of evaluating a request against a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// The effect to apply.
    pub effect: Effect,
    /// The rule that produced it; `None` for the default deny.
    pub rule: Option<PolicyRule>,
}

/// A versioned set of policy rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    /// Document format version.
    pub version: u32,
    /// Rules in document order; order does not affect evaluation.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl PolicyDocument {
    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidPolicy`] if the YAML is malformed or
    /// the document fails [`Self::validate`].
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let doc: Self = serde_yaml::from_str(yaml)
            .map_err(|e| CredentialError::invalid_policy(format!("parse error: {e}")))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Checks the version, rule fields and rule rate limits.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidPolicy`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.version != SUPPORTED_POLICY_VERSION {
            return Err(CredentialError::invalid_policy(format!(
                "unsupported policy version {} (expected {SUPPORTED_POLICY_VERSION})",
                self.version
            )));
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.role.is_empty() || rule.service.is_empty() || rule.operation.is_empty() {
                return Err(CredentialError::invalid_policy(format!(
                    "rule {index}: role, service and operation must be non-empty"
                )));
            }
            if let Some(limit) = &rule.rate_limit {
                limit.validate().map_err(|e| {
                    CredentialError::invalid_policy(format!("rule {index}: {e}"))
                })?;
            }
        }
        Ok(())
    }

    /// Evaluates a request, returning the winning rule.
    #[must_use]
    pub fn decide(&self, role: &str, service: &str, operation: &str) -> PolicyDecision {
        let winner = self
            .rules
            .iter()
            .filter(|rule| rule.matches(role, service, operation))
            .max_by_key(|rule| (rule.specificity(), rule.effect.strictness()));

        match winner {
            Some(rule) => PolicyDecision { effect: rule.effect, rule: Some(rule.clone()) },
            None => PolicyDecision { effect: Effect::Deny, rule: None },
        }
    }
}

#[derive(Debug)]
struct PolicySnapshot {
    document: PolicyDocument,
    modified: Option<SystemTime>,
}

/// Holds the active policy and reloads it from disk.
pub struct PolicyStore {
    current: ArcSwap<PolicySnapshot>,
    path: Option<PathBuf>,
    audit: Option<Arc<dyn AuditLog>>,
}

impl fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyStore")
            .field("path", &self.path)
            .field("rules", &self.current.load().document.rules.len())
            .finish_non_exhaustive()
    }
}

impl PolicyStore {
    /// Creates a store over a fixed, in-memory document.
    #[must_use]
    pub fn new(document: PolicyDocument) -> Self {
        Self {
            current: ArcSwap::from_pointee(PolicySnapshot { document, modified: None }),
            path: None,
            audit: None,
        }
    }

    /// Loads the document at `path`; later reloads re-read the same file.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] if the file cannot be read, or
    /// [`CredentialError::InvalidPolicy`] if it does not validate.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (document, modified) = read_document(&path).await?;
        tracing::info!(
            path = %path.display(),
            version = document.version,
            rules = document.rules.len(),
            "policy loaded"
        );
        Ok(Self {
            current: ArcSwap::from_pointee(PolicySnapshot { document, modified }),
            path: Some(path),
            audit: None,
        })
    }

    /// Records policy reloads to `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Evaluates a request against the active document.
    #[must_use]
    pub fn evaluate(&self, role: &str, service: &str, operation: &str) -> Effect {
        self.decide(role, service, operation).effect
    }

    /// Evaluates a request, returning the winning rule.
    #[must_use]
    pub fn decide(&self, role: &str, service: &str, operation: &str) -> PolicyDecision {
        self.current.load().document.decide(role, service, operation)
    }

    /// Returns a copy of the active document.
    #[must_use]
    pub fn document(&self) -> PolicyDocument {
        self.current.load().document.clone()
    }

    /// Atomically replaces the active document.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidPolicy`] if `document` does not
    /// validate; the active document is kept.
    pub fn replace(&self, document: PolicyDocument) -> Result<()> {
        document.validate()?;
        self.current.store(Arc::new(PolicySnapshot { document, modified: None }));
        Ok(())
    }

    /// Reloads the policy file if its modification time changed.
    ///
    /// Returns `Ok(true)` when a new document was installed. A document that
    /// fails to parse or validate leaves the active one in place.
    ///
    /// # Errors
    ///
    /// Returns the read or validation error; the store is unchanged.
    pub async fn reload_if_changed(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };

        let modified = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| CredentialError::io(format!("failed to stat {}", path.display()), e))?;
        if self.current.load().modified == Some(modified) {
            return Ok(false);
        }

        let installed = match read_document(path).await {
            Ok((document, modified)) => {
                let summary = (document.version, document.rules.len());
                self.current.store(Arc::new(PolicySnapshot { document, modified }));
                Ok(summary)
            },
            Err(e) => {
                // Remember the bad revision so it is not re-parsed every tick
                let document = self.current.load().document.clone();
                self.current.store(Arc::new(PolicySnapshot { document, modified: Some(modified) }));
                Err(e)
            },
        };

        match installed {
            Ok((version, rules)) => {
                tracing::info!(path = %path.display(), version, rules, "policy reloaded");
                self.audit_reload(AuditDecision::Completed, "ok", version, rules).await;
                Ok(true)
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "policy reload rejected, keeping previous");
                let current = self.current.load();
                self.audit_reload(
                    AuditDecision::Failed,
                    e.code(),
                    current.document.version,
                    current.document.rules.len(),
                )
                .await;
                Err(e)
            },
        }
    }

    async fn audit_reload(&self, decision: AuditDecision, reason: &str, version: u32, rules: usize) {
        let Some(audit) = &self.audit else {
            return;
        };
        let mut entry = NewAuditEntry::builder()
            .actor("policy")
            .action(AuditAction::PolicyReload)
            .decision(decision)
            .reason_code(reason)
            .build()
            .with_metadata("version", version.to_string())
            .with_metadata("rules", rules.to_string());
        if let Some(path) = &self.path {
            entry = entry.with_metadata("path", path.display().to_string());
        }
        if let Err(e) = audit.append(entry).await {
            tracing::error!(error = %e, "failed to audit policy reload");
        }
    }

    /// Spawns a task that polls the policy file every `interval` until
    /// `cancel` fires.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the file was just loaded.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::info!("policy watcher shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = store.reload_if_changed().await {
                            tracing::debug!(error = %e, "policy reload check failed");
                        }
                    }
                }
            }
        })
    }
}

async fn read_document(path: &Path) -> Result<(PolicyDocument, Option<SystemTime>)> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| CredentialError::io(format!("failed to stat {}", path.display()), e))?;
    let yaml = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CredentialError::io(format!("failed to read {}", path.display()), e))?;
    let document = PolicyDocument::from_yaml(&yaml)?;
    Ok((document, metadata.modified().ok()))
}
