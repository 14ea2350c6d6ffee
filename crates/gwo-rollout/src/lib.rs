// SPDX-License-Identifier: MIT OR Apache-2.0
//! gwo-rollout
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The rollout / judge gate. Observed metrics are held against a budget;
//! a breach yields a `rollback` verdict and a rollback proof signed by the
//! active key so the decision can be verified offline. The judge wraps
//! verdicts into a small signed envelope bound to a manifest hash. A
//! canary tracker models the deployment state machine and trips on error
//! rate or repeated health-check failures.

use chrono::{DateTime, Utc};
use gwo_config::RolloutBudget;
use gwo_core::canonical_json;
use gwo_keyring::{KeyAlgorithm, Keyring, KeyringError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Errors from gate operations.
#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    /// Signing failed (usually: no active key).
    #[error("rollout signing: {0}")]
    Keyring(#[from] KeyringError),
    /// A payload could not be canonicalized.
    #[error("rollout serde: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One observed metrics window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutMetrics {
    /// Requests observed in the window.
    pub requests: u64,
    /// Errors observed in the window.
    pub errors: u64,
    /// Window length in seconds.
    #[serde(default)]
    pub window_s: u64,
    /// Optional namespace label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns: Option<String>,
}

impl RolloutMetrics {
    /// Errors over requests; a zero-request window counts as one request.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        self.errors as f64 / self.requests.max(1) as f64
    }
}

/// Gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Budget holds; the rollout continues.
    Proceed,
    /// Budget breached; roll back.
    Rollback,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proceed => f.write_str("proceed"),
            Self::Rollback => f.write_str("rollback"),
        }
    }
}

/// Hold `metrics` against `budget`.
///
/// `proceed` requires both enough observed traffic and an error rate
/// within budget; anything else rolls back.
#[must_use]
pub fn evaluate(metrics: &RolloutMetrics, budget: &RolloutBudget) -> Verdict {
    if metrics.requests >= budget.min_requests && metrics.error_rate() <= budget.error_budget {
        Verdict::Proceed
    } else {
        Verdict::Rollback
    }
}

// ---------------------------------------------------------------------------
// Signed artifacts
// ---------------------------------------------------------------------------

/// Offline-verifiable evidence that a rollback verdict was issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackProof {
    /// Hash of the manifest the rollback applies to.
    pub manifest_hash: String,
    /// The metrics window that breached the budget.
    pub metrics: RolloutMetrics,
    /// When the verdict was issued.
    pub ts: DateTime<Utc>,
    /// Signing algorithm.
    pub alg: KeyAlgorithm,
    /// Key that signed the proof.
    pub key_id: String,
    /// Signature over the canonical payload, URL-safe base64 no-pad.
    pub sig: String,
}

fn proof_payload(
    manifest_hash: &str,
    metrics: &RolloutMetrics,
    ts: DateTime<Utc>,
) -> Result<Vec<u8>, serde_json::Error> {
    canonical_json(&serde_json::json!({
        "manifest_hash": manifest_hash,
        "metrics": metrics,
        "ts": ts,
    }))
}

/// Build and sign a rollback proof with the active HMAC key.
///
/// # Errors
///
/// [`RolloutError::Keyring`] when no active key can sign.
pub fn build_rollback_proof(
    manifest_hash: impl Into<String>,
    metrics: RolloutMetrics,
    keyring: &Keyring,
) -> Result<RollbackProof, RolloutError> {
    let manifest_hash = manifest_hash.into();
    let ts = Utc::now();
    let payload = proof_payload(&manifest_hash, &metrics, ts)?;
    let envelope = keyring.sign(&payload)?;
    Ok(RollbackProof {
        manifest_hash,
        metrics,
        ts,
        alg: envelope.alg,
        key_id: envelope.key_id,
        sig: envelope.sig,
    })
}

impl RollbackProof {
    /// Verify the proof against the keyring under its named key.
    #[must_use]
    pub fn verify(&self, keyring: &Keyring) -> bool {
        match proof_payload(&self.manifest_hash, &self.metrics, self.ts) {
            Ok(payload) => keyring.verify(&payload, &self.sig, Some(&self.key_id)),
            Err(_) => false,
        }
    }

    /// Verify the proof against an explicitly named key.
    #[must_use]
    pub fn verify_with_key(&self, keyring: &Keyring, key_id: &str) -> bool {
        match proof_payload(&self.manifest_hash, &self.metrics, self.ts) {
            Ok(payload) => keyring.verify(&payload, &self.sig, Some(key_id)),
            Err(_) => false,
        }
    }
}

/// A judge's signed wrapper around a verdict, bound to a manifest hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeEnvelope {
    /// Signing algorithm.
    pub alg: KeyAlgorithm,
    /// Key that signed the envelope.
    pub kid: String,
    /// Canonical JSON payload string (`manifest_hash`, `metrics`, `ts`).
    pub payload: String,
    /// Signature over the payload bytes.
    pub sig: String,
}

/// Issue a signed judge envelope for a manifest hash and metrics window.
///
/// # Errors
///
/// [`RolloutError::Keyring`] when no active key can sign.
pub fn judge_envelope(
    manifest_hash: &str,
    metrics: &RolloutMetrics,
    keyring: &Keyring,
) -> Result<JudgeEnvelope, RolloutError> {
    let payload = proof_payload(manifest_hash, metrics, Utc::now())?;
    let envelope = keyring.sign(&payload)?;
    Ok(JudgeEnvelope {
        alg: envelope.alg,
        kid: envelope.key_id,
        payload: String::from_utf8_lossy(&payload).into_owned(),
        sig: envelope.sig,
    })
}

impl JudgeEnvelope {
    /// Verify the envelope's signature under its named key.
    #[must_use]
    pub fn verify(&self, keyring: &Keyring) -> bool {
        keyring.verify(self.payload.as_bytes(), &self.sig, Some(&self.kid))
    }
}

// ---------------------------------------------------------------------------
// Canary state machine
// ---------------------------------------------------------------------------

/// Deployment phase of a tracked canary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryState {
    /// Nothing deployed.
    Idle,
    /// Canary serving a slice of traffic.
    Canary,
    /// Traffic share being increased.
    Advancing,
    /// Fully rolled out.
    Complete,
    /// Aborted; traffic restored to the stable version.
    RolledBack,
}

/// How many recent health checks the tracker remembers.
const HEALTH_WINDOW: usize = 10;

/// Minimum checks before the failure-majority rule can trip.
const HEALTH_MIN_CHECKS: usize = 3;

/// Tracks one canary deployment through
/// `idle → canary → (advancing → canary)* → (complete | rolled_back)`.
///
/// Rollback trips when the observed error rate breaches the budget or when
/// more than half of the last `HEALTH_MIN_CHECKS`-or-more health checks
/// failed.
#[derive(Debug, Clone)]
pub struct CanaryTracker {
    state: CanaryState,
    budget: RolloutBudget,
    health: VecDeque<bool>,
}

impl CanaryTracker {
    /// New idle tracker with the given budget.
    #[must_use]
    pub fn new(budget: RolloutBudget) -> Self {
        Self {
            state: CanaryState::Idle,
            budget,
            health: VecDeque::with_capacity(HEALTH_WINDOW),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> CanaryState {
        self.state
    }

    /// Start a canary. Only valid from `idle`; returns whether the
    /// transition applied.
    pub fn begin(&mut self) -> bool {
        if self.state != CanaryState::Idle {
            return false;
        }
        self.state = CanaryState::Canary;
        self.health.clear();
        true
    }

    /// Begin increasing the traffic share. Only valid from `canary`;
    /// returns whether the transition applied.
    pub fn advance(&mut self) -> bool {
        if self.state != CanaryState::Canary {
            return false;
        }
        self.state = CanaryState::Advancing;
        true
    }

    /// Finish an advance step, returning to `canary`; returns whether the
    /// transition applied.
    pub fn settle(&mut self) -> bool {
        if self.state != CanaryState::Advancing {
            return false;
        }
        self.state = CanaryState::Canary;
        true
    }

    /// Declare the rollout complete. Only valid from `canary`; returns
    /// whether the transition applied.
    pub fn complete(&mut self) -> bool {
        if self.state != CanaryState::Canary {
            return false;
        }
        self.state = CanaryState::Complete;
        true
    }

    /// Record a health check. Returns the state after applying the
    /// failure-majority rule.
    pub fn record_health(&mut self, healthy: bool) -> CanaryState {
        if self.health.len() == HEALTH_WINDOW {
            self.health.pop_front();
        }
        self.health.push_back(healthy);

        if self.in_flight() && self.health.len() >= HEALTH_MIN_CHECKS {
            let failures = self.health.iter().filter(|h| !**h).count();
            if failures * 2 > self.health.len() {
                self.state = CanaryState::RolledBack;
            }
        }
        self.state
    }

    /// Record a metrics window. An error-rate breach rolls the canary
    /// back.
    pub fn record_metrics(&mut self, metrics: &RolloutMetrics) -> CanaryState {
        if self.in_flight() && metrics.error_rate() > self.budget.error_budget {
            self.state = CanaryState::RolledBack;
        }
        self.state
    }

    fn in_flight(&self) -> bool {
        matches!(self.state, CanaryState::Canary | CanaryState::Advancing)
    }
}
