// SPDX-License-Identifier: MIT OR Apache-2.0
//! gwo-config
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Orchestrator configuration: tenant quotas, queue backend selection,
//! engine sizing, file locations, and the rollout budget. Loaded from TOML
//! with validation; every field has a sensible default so an empty file is
//! a working configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Errors from configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found or unreadable.
    #[error("config file not readable: {path}: {source}")]
    Io {
        /// Path that was requested.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    Validation {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Per-tenant admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Maximum runs executing concurrently for the tenant.
    pub max_concurrent: u32,
    /// Maximum admissions inside any 60-second window.
    pub per_minute: u32,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            per_minute: 30,
        }
    }
}

/// Which queue backend the engine drains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum QueueBackend {
    /// Ephemeral in-memory priority queue. Contents are lost on shutdown.
    #[default]
    Memory,
    /// Named append-only stream on disk; survives restarts.
    Stream {
        /// Stream file path. The consumer cursor lives alongside it.
        path: PathBuf,
    },
}

/// Rollout gate budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RolloutBudget {
    /// Maximum tolerated error rate.
    pub error_budget: f64,
    /// Minimum observed requests before the gate can proceed.
    pub min_requests: u64,
}

impl Default for RolloutBudget {
    fn default() -> Self {
        Self {
            error_budget: 0.01,
            min_requests: 200,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Engine sizing and timeouts.
    pub engine: EngineConfig,
    /// Queue backend selection.
    pub queue: QueueBackend,
    /// Event bus capacity.
    pub bus: BusConfig,
    /// Audit log location and rotation.
    pub audit: AuditConfig,
    /// Keyring persistence and request signing.
    pub keys: KeyConfig,
    /// Rollout gate budget.
    pub rollout: RolloutBudget,
    /// Optional webhook sink for engine events.
    pub webhook: WebhookConfig,
    /// Tenant name → quota. Unknown tenants fall back to the `public` entry
    /// or, failing that, to [`Quota::default`].
    pub tenants: BTreeMap<String, Quota>,
}

/// Engine sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker tasks. Bounds total concurrency.
    pub workers: usize,
    /// Queue drain wait per poll, in milliseconds.
    pub drain_timeout_ms: u64,
    /// Delay before re-enqueueing a job that admission refused, in
    /// milliseconds.
    pub requeue_delay_ms: u64,
    /// Optional per-run chain export file (`{prev, current, meta}` lines).
    pub chain_export: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            drain_timeout_ms: 500,
            requeue_delay_ms: 250,
            chain_export: None,
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Ring buffer and per-subscriber channel capacity.
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Audit log location and rotation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Audit log path.
    pub path: PathBuf,
    /// Rotate once the file exceeds this many bytes.
    pub rotate_bytes: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("audit.jsonl"),
            rotate_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Keyring persistence and request-signature enforcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Keyring document path.
    pub path: PathBuf,
    /// Rotation ledger path.
    pub ledger_path: PathBuf,
    /// Require `X-Codex-Sig` on signed endpoints.
    pub require_signatures: bool,
    /// Opaque admission token expected in `X-Auth`, when set.
    pub auth_token: Option<String>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("keyring.json"),
            ledger_path: PathBuf::from("keyring.ledger.jsonl"),
            require_signatures: false,
            auth_token: None,
        }
    }
}

/// Webhook sink settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    /// Destination URL. Empty disables the sink.
    pub url: Option<String>,
    /// Delivery timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl OrchestratorConfig {
    /// Load and validate a TOML configuration file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read,
    /// [`ConfigError::Parse`] on malformed TOML, and
    /// [`ConfigError::Validation`] when limits are out of range.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Self = toml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate semantic constraints.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] listing every failed constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();
        if self.engine.workers == 0 {
            reasons.push("engine.workers must be at least 1".to_string());
        }
        if self.bus.capacity == 0 {
            reasons.push("bus.capacity must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.rollout.error_budget) {
            reasons.push("rollout.error_budget must be within [0, 1]".to_string());
        }
        for (tenant, q) in &self.tenants {
            if q.max_concurrent == 0 {
                reasons.push(format!("tenants.{tenant}.max_concurrent must be at least 1"));
            }
            if q.per_minute == 0 {
                reasons.push(format!("tenants.{tenant}.per_minute must be at least 1"));
            }
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation { reasons })
        }
    }

    /// Quota for a tenant, falling back to `public` and then the default.
    #[must_use]
    pub fn quota(&self, tenant: &str) -> Quota {
        self.tenants
            .get(tenant)
            .or_else(|| self.tenants.get("public"))
            .copied()
            .unwrap_or_default()
    }
}
