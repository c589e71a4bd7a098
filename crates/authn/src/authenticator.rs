//! The single gate for control-plane requests.
//!
//! [`RequestAuthenticator::authenticate`] runs the checks below in order and
//! stops at the first failure:
//!
//! ```text
//! 1. key       registered and not revoked      UnknownOrRevokedKey
//! 2. timestamp |now - ts| <= window            StaleOrFutureTimestamp
//! 3. signature Ed25519 over canonical bytes    InvalidSignature
//! 4. replay    (public_key, nonce) unseen      ReplayDetected
//! 5. rate      principal under its limit       RateLimited
//! ```
//!
//! Nothing is recorded in the replay guard or the rate limiter until the
//! signature has verified, so unauthenticated traffic cannot burn another
//! principal's nonces or budget. Every decision is appended to the audit log;
//! a success whose audit entry cannot be written is turned into
//! [`AuthError::AuditWriteFailure`].

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sentra_common_storage::{
    AuditAction, AuditDecision, AuditLog, KeyRecord, KeyRegistry, NewAuditEntry, PrincipalId,
    RateLimitConfig, RateLimiter, SlidingWindowLimiter,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    clock::{Clock, SystemClock},
    envelope::SignedEnvelope,
    error::{AuthError, Result},
    key_cache::{DEFAULT_KEY_CACHE_CAPACITY, DEFAULT_KEY_CACHE_TTL, KeyCache},
    replay::{DEFAULT_REPLAY_CAPACITY, InMemoryReplayGuard, ReplayGuard},
    validation::{decode_nonce, decode_public_key, decode_signature, verify_signature},
};

/// Default acceptance window for envelope timestamps.
pub const DEFAULT_TIMESTAMP_WINDOW: Duration = Duration::from_secs(60);

fn default_timestamp_window() -> Duration {
    DEFAULT_TIMESTAMP_WINDOW
}

fn default_key_cache_ttl() -> Duration {
    DEFAULT_KEY_CACHE_TTL
}

fn default_key_cache_capacity() -> u64 {
    DEFAULT_KEY_CACHE_CAPACITY
}

fn default_replay_capacity() -> u64 {
    DEFAULT_REPLAY_CAPACITY
}

/// Authenticator tuning.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sentra_common_authn::AuthenticatorConfig;
///
/// let config = AuthenticatorConfig::builder()
///     .timestamp_window(Duration::from_secs(30))
///     .build()
///     .expect("valid config");
/// assert_eq!(config.timestamp_window(), Duration::from_secs(30));
/// assert_eq!(config.rate_limit().max_requests(), 1000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthenticatorConfig {
    /// Maximum accepted distance between envelope and server time.
    #[serde(with = "humantime_serde", default = "default_timestamp_window")]
    timestamp_window: Duration,
    /// Per-principal request limit.
    #[serde(default)]
    rate_limit: RateLimitConfig,
    /// How long a key lookup is served from memory.
    #[serde(with = "humantime_serde", default = "default_key_cache_ttl")]
    key_cache_ttl: Duration,
    /// Maximum cached key records.
    #[serde(default = "default_key_cache_capacity")]
    key_cache_capacity: u64,
    /// Maximum nonces tracked by the default replay guard.
    #[serde(default = "default_replay_capacity")]
    replay_capacity: u64,
}

#[bon::bon]
impl AuthenticatorConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if the window, cache TTL or
    /// capacities are zero, or if the rate limit is invalid.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_TIMESTAMP_WINDOW)] timestamp_window: Duration,
        #[builder(default)] rate_limit: RateLimitConfig,
        #[builder(default = DEFAULT_KEY_CACHE_TTL)] key_cache_ttl: Duration,
        #[builder(default = DEFAULT_KEY_CACHE_CAPACITY)] key_cache_capacity: u64,
        #[builder(default = DEFAULT_REPLAY_CAPACITY)] replay_capacity: u64,
    ) -> Result<Self> {
        let config =
            Self { timestamp_window, rate_limit, key_cache_ttl, key_cache_capacity, replay_capacity };
        config.validate()?;
        Ok(config)
    }

    /// Validates a configuration, including one produced by deserialization.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.timestamp_window.is_zero() {
            return Err(AuthError::invalid_config("timestamp_window must be non-zero"));
        }
        if i64::try_from(self.timestamp_window.as_millis()).is_err() {
            return Err(AuthError::invalid_config("timestamp_window is too large"));
        }
        if self.key_cache_ttl.is_zero() {
            return Err(AuthError::invalid_config("key_cache_ttl must be non-zero"));
        }
        if self.key_cache_capacity == 0 {
            return Err(AuthError::invalid_config("key_cache_capacity must be at least 1"));
        }
        if self.replay_capacity == 0 {
            return Err(AuthError::invalid_config("replay_capacity must be at least 1"));
        }
        self.rate_limit.validate().map_err(|e| AuthError::invalid_config(e.to_string()))
    }

    /// Returns the timestamp acceptance window.
    #[must_use]
    pub fn timestamp_window(&self) -> Duration {
        self.timestamp_window
    }

    /// Returns the per-principal rate limit.
    #[must_use]
    pub fn rate_limit(&self) -> RateLimitConfig {
        self.rate_limit
    }

    /// Returns the key cache TTL.
    #[must_use]
    pub fn key_cache_ttl(&self) -> Duration {
        self.key_cache_ttl
    }

    /// Returns the key cache capacity.
    #[must_use]
    pub fn key_cache_capacity(&self) -> u64 {
        self.key_cache_capacity
    }

    /// Returns the replay guard capacity.
    #[must_use]
    pub fn replay_capacity(&self) -> u64 {
        self.replay_capacity
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.timestamp_window.as_millis()).unwrap_or(i64::MAX)
    }
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        Self {
            timestamp_window: DEFAULT_TIMESTAMP_WINDOW,
            rate_limit: RateLimitConfig::default(),
            key_cache_ttl: DEFAULT_KEY_CACHE_TTL,
            key_cache_capacity: DEFAULT_KEY_CACHE_CAPACITY,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
        }
    }
}

/// The identity behind an accepted envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedPrincipal {
    /// Owner of the signing key.
    pub principal_id: PrincipalId,
    /// The key that signed the request.
    pub public_key: String,
    /// Device the key was enrolled from.
    pub device_label: String,
    /// The verified request body.
    pub payload: Value,
}

/// Verifies signed control-plane requests.
///
/// All collaborators are injected; there is no global state.
pub struct RequestAuthenticator {
    keys: KeyCache,
    audit: Arc<dyn AuditLog>,
    replay: Arc<dyn ReplayGuard>,
    limiter: Arc<dyn RateLimiter>,
    clock: Arc<dyn Clock>,
    config: AuthenticatorConfig,
}

impl std::fmt::Debug for RequestAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestAuthenticator")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl RequestAuthenticator {
    /// Creates an authenticator.
    ///
    /// `replay`, `limiter` and `clock` default to an in-memory replay guard,
    /// a sliding-window limiter using `config.rate_limit` and the system
    /// clock.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if `config` fails validation.
    #[builder]
    pub fn new(
        registry: Arc<dyn KeyRegistry>,
        audit: Arc<dyn AuditLog>,
        #[builder(default)] config: AuthenticatorConfig,
        replay: Option<Arc<dyn ReplayGuard>>,
        limiter: Option<Arc<dyn RateLimiter>>,
        clock: Option<Arc<dyn Clock>>,
    ) -> Result<Self> {
        config.validate()?;
        let keys = KeyCache::with_capacity(registry, config.key_cache_ttl, config.key_cache_capacity);
        let replay =
            replay.unwrap_or_else(|| Arc::new(InMemoryReplayGuard::new(config.replay_capacity)));
        let limiter = limiter.unwrap_or_else(|| Arc::new(SlidingWindowLimiter::new(config.rate_limit)));
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        Ok(Self { keys, audit, replay, limiter, clock, config })
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &AuthenticatorConfig {
        &self.config
    }

    /// Returns the key cache.
    #[must_use]
    pub fn key_cache(&self) -> &KeyCache {
        &self.keys
    }

    /// Authenticates a signed envelope.
    ///
    /// # Errors
    ///
    /// Returns the first failed check (see the module docs), or
    /// [`AuthError::AuditWriteFailure`] if the success could not be audited.
    #[tracing::instrument(skip(self, envelope), fields(public_key = %envelope.public_key))]
    pub async fn authenticate(&self, envelope: &SignedEnvelope) -> Result<AuthenticatedPrincipal> {
        let now_ms = self.clock.now_unix_ms();
        let (record, outcome) = self.run_checks(envelope, now_ms).await;

        match (record, outcome) {
            (Some(record), Ok(())) => {
                self.audit
                    .append(self.audit_entry(envelope, Some(&record), now_ms, AuditDecision::Allowed, "ok"))
                    .await
                    .map_err(|err| {
                        tracing::error!(error = %err, "audit write failed, denying authenticated request");
                        AuthError::audit_write_failure(err)
                    })?;

                let at = DateTime::from_timestamp_millis(now_ms).unwrap_or_else(Utc::now);
                if let Err(err) = self.keys.registry().touch_last_used(&record.public_key, at).await {
                    tracing::warn!(error = %err, "failed to record key last use");
                }

                tracing::debug!(principal = %record.principal_id, "request authenticated");
                Ok(AuthenticatedPrincipal {
                    principal_id: record.principal_id.clone(),
                    public_key: record.public_key.clone(),
                    device_label: record.device_label.clone(),
                    payload: envelope.payload.clone(),
                })
            },
            (record, outcome) => {
                let err = match outcome {
                    Err(err) => err,
                    Ok(()) => AuthError::UnknownOrRevokedKey,
                };
                let decision = match err {
                    AuthError::KeyStorage(_) | AuthError::ReplayGuardSaturated => AuditDecision::Failed,
                    _ => AuditDecision::Denied,
                };
                let entry = self.audit_entry(envelope, record.as_deref(), now_ms, decision, err.code());
                if let Err(audit_err) = self.audit.append(entry).await {
                    tracing::error!(error = %audit_err, "audit write failed for rejected request");
                }
                tracing::warn!(reason = err.code(), error = %err, "request rejected");
                Err(err)
            },
        }
    }

    async fn run_checks(
        &self,
        envelope: &SignedEnvelope,
        now_ms: i64,
    ) -> (Option<Arc<KeyRecord>>, Result<()>) {
        let record = match self.check_key(&envelope.public_key).await {
            Ok(record) => record,
            Err(err) => return (None, Err(err)),
        };

        let outcome = async {
            self.check_timestamp(envelope.timestamp, now_ms)?;
            self.check_signature(envelope)?;
            self.check_replay(envelope, now_ms).await?;
            self.check_rate_limit(&record.principal_id)
        }
        .await;

        (Some(record), outcome)
    }

    /// Looks up the envelope's key.
    ///
    /// # Errors
    ///
    /// - [`AuthError::UnknownOrRevokedKey`] if the key is unknown or revoked
    /// - [`AuthError::KeyStorage`] if the registry lookup fails
    pub async fn check_key(&self, public_key: &str) -> Result<Arc<KeyRecord>> {
        match self.keys.get(public_key).await? {
            Some(record) if record.is_active() => Ok(record),
            _ => Err(AuthError::UnknownOrRevokedKey),
        }
    }

    /// Checks that `timestamp` is within the window around `now_ms`.
    /// The boundary is inclusive.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::StaleOrFutureTimestamp`] outside the window.
    pub fn check_timestamp(&self, timestamp: i64, now_ms: i64) -> Result<()> {
        let skew = now_ms.abs_diff(timestamp);
        let window = self.config.window_ms().unsigned_abs();
        if skew <= window { Ok(()) } else { Err(AuthError::stale_or_future(skew, window)) }
    }

    /// Verifies the envelope signature against its public key.
    ///
    /// # Errors
    ///
    /// - [`AuthError::MalformedEnvelope`] if the key or nonce cannot be decoded
    /// - [`AuthError::InvalidSignature`] if the signature does not verify
    pub fn check_signature(&self, envelope: &SignedEnvelope) -> Result<()> {
        let key = decode_public_key(&envelope.public_key)?;
        let nonce = decode_nonce(&envelope.nonce)?;
        let signature = decode_signature(&envelope.signature)?;
        verify_signature(&key, &envelope.payload, envelope.timestamp, &nonce, &signature)
    }

    /// Records the envelope nonce, rejecting replays.
    ///
    /// The nonce is remembered until one millisecond past the point where
    /// the timestamp check would reject the envelope on its own.
    ///
    /// # Errors
    ///
    /// - [`AuthError::ReplayDetected`] if the nonce was already accepted
    /// - [`AuthError::ReplayGuardSaturated`] if the guard is full
    pub async fn check_replay(&self, envelope: &SignedEnvelope, now_ms: i64) -> Result<()> {
        let remaining_ms = envelope
            .timestamp
            .saturating_add(self.config.window_ms())
            .saturating_sub(now_ms)
            .max(0)
            .unsigned_abs()
            .saturating_add(1);
        self.replay
            .check_and_mark(&envelope.public_key, &envelope.nonce, Duration::from_millis(remaining_ms))
            .await
    }

    /// Counts one request against the principal's limit.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RateLimited`] when the principal is over its limit.
    pub fn check_rate_limit(&self, principal: &PrincipalId) -> Result<()> {
        self.limiter.check(principal.as_str()).map_err(AuthError::from)
    }

    /// Revokes a key and drops it from the key cache immediately.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyStorage`] if the registry refuses the
    /// revocation (for example, the key was never registered).
    #[tracing::instrument(skip(self))]
    pub async fn revoke_key(&self, public_key: &str, reason: Option<&str>) -> Result<()> {
        let result = self.keys.registry().revoke(public_key, reason).await;
        // Invalidate even on failure; the cached record may be stale either way
        self.keys.invalidate(public_key).await;
        result.map_err(AuthError::key_storage)
    }

    fn audit_entry(
        &self,
        envelope: &SignedEnvelope,
        record: Option<&KeyRecord>,
        now_ms: i64,
        decision: AuditDecision,
        reason_code: &str,
    ) -> NewAuditEntry {
        let actor = record.map_or_else(|| envelope.public_key.clone(), |r| r.principal_id.to_string());
        let mut entry = NewAuditEntry::builder()
            .actor(actor)
            .action(AuditAction::Authenticate)
            .decision(decision)
            .reason_code(reason_code)
            .timestamp(DateTime::from_timestamp_millis(now_ms).unwrap_or_else(Utc::now))
            .build()
            .with_metadata("public_key", envelope.public_key.clone())
            .with_metadata("envelope_timestamp", envelope.timestamp.to_string());
        if let Some(record) = record {
            entry = entry.with_metadata("device", record.device_label.clone());
        }
        entry
    }
}
