//! Offline analysis of an audit trail.
//!
//! Groups credential decisions by service and operation and flags actor
//! behaviour worth an operator's attention.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{AuditAction, AuditDecision, AuditEntry};

/// Denials by one actor at or above which [`SuspiciousPattern::RepeatedDenials`] is reported.
pub const DEFAULT_DENIAL_THRESHOLD: u64 = 5;

/// Decision tallies for one group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecisionCounts {
    /// Requests that passed every check (including completed calls).
    pub granted: u64,
    /// Requests rejected by policy, budget, rate limit or an operator.
    pub denied: u64,
    /// Requests that failed operationally (upstream, secrets, audit).
    pub failed: u64,
    /// Requests abandoned by the caller.
    pub canceled: u64,
}

impl DecisionCounts {
    fn record(&mut self, decision: AuditDecision) {
        match decision {
            AuditDecision::Allowed | AuditDecision::Completed => self.granted += 1,
            AuditDecision::Denied => self.denied += 1,
            AuditDecision::Failed => self.failed += 1,
            AuditDecision::Canceled => self.canceled += 1,
            AuditDecision::Pending => {},
        }
    }

    /// Total terminal decisions counted.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.granted + self.denied + self.failed + self.canceled
    }
}

/// Behaviour flagged by [`AuditSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuspiciousPattern {
    /// An actor was denied at least the configured threshold of times.
    RepeatedDenials {
        /// The actor.
        actor: String,
        /// Number of denials.
        count: u64,
    },
    /// An actor hit a rate limit.
    RateLimitHits {
        /// The actor.
        actor: String,
        /// Number of rate-limited requests.
        count: u64,
    },
    /// Signed requests from an actor were replayed.
    ReplayAttempts {
        /// The actor (public key or principal).
        actor: String,
        /// Number of replays detected.
        count: u64,
    },
}

/// Aggregated view of an audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    /// Entries examined.
    pub total_entries: u64,
    /// Credential decisions keyed by `service` then `operation`.
    pub by_service: BTreeMap<String, BTreeMap<String, DecisionCounts>>,
    /// Authentication decisions.
    pub authentication: DecisionCounts,
    /// Flagged behaviour, in actor order.
    pub suspicious: Vec<SuspiciousPattern>,
}

impl AuditSummary {
    /// Summarizes `entries` with the default denial threshold.
    #[must_use]
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a AuditEntry>) -> Self {
        Self::with_threshold(entries, DEFAULT_DENIAL_THRESHOLD)
    }

    /// Summarizes `entries`, flagging actors with at least
    /// `denial_threshold` denials.
    #[must_use]
    pub fn with_threshold<'a>(
        entries: impl IntoIterator<Item = &'a AuditEntry>,
        denial_threshold: u64,
    ) -> Self {
        let mut summary = Self::default();
        let mut denials: BTreeMap<&str, u64> = BTreeMap::new();
        let mut rate_limited: BTreeMap<&str, u64> = BTreeMap::new();
        let mut replays: BTreeMap<&str, u64> = BTreeMap::new();

        for entry in entries {
            summary.total_entries += 1;

            match entry.action() {
                AuditAction::CredentialRequest | AuditAction::ApprovalResolved => {
                    let service =
                        entry.metadata().get("service").map_or("unknown", String::as_str);
                    let operation =
                        entry.metadata().get("operation").map_or("unknown", String::as_str);
                    summary
                        .by_service
                        .entry(service.to_owned())
                        .or_default()
                        .entry(operation.to_owned())
                        .or_default()
                        .record(entry.decision());
                },
                AuditAction::Authenticate => summary.authentication.record(entry.decision()),
                _ => continue,
            }

            if entry.decision() == AuditDecision::Denied {
                *denials.entry(entry.actor()).or_default() += 1;
            }
            match entry.reason_code() {
                "rate_limited" => *rate_limited.entry(entry.actor()).or_default() += 1,
                "replay_detected" => *replays.entry(entry.actor()).or_default() += 1,
                _ => {},
            }
        }

        for (actor, count) in denials {
            if count >= denial_threshold {
                summary
                    .suspicious
                    .push(SuspiciousPattern::RepeatedDenials { actor: actor.to_owned(), count });
            }
        }
        for (actor, count) in rate_limited {
            summary
                .suspicious
                .push(SuspiciousPattern::RateLimitHits { actor: actor.to_owned(), count });
        }
        for (actor, count) in replays {
            summary
                .suspicious
                .push(SuspiciousPattern::ReplayAttempts { actor: actor.to_owned(), count });
        }

        summary
    }
}
