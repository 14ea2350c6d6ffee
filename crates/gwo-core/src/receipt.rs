// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-step receipts: the atomic unit of the chain.

use crate::canonical::{canonical_json, sha256_hex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record of one completed task attempt.
///
/// Receipts are emitted for every completed attempt, pass or fail; a task
/// that is retried leaves one receipt per attempt. The receipt digests the
/// attempt's output and captured log bytes rather than embedding them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReceipt {
    /// Task name within the run's DAG.
    pub task: String,
    /// When the attempt started.
    pub started_ts: DateTime<Utc>,
    /// When the attempt ended.
    pub ended_ts: DateTime<Utc>,
    /// Whether the attempt succeeded.
    pub ok: bool,
    /// SHA-256 of the canonical output bytes (zero digest when none).
    pub output_digest: String,
    /// SHA-256 of the captured log bytes.
    pub log_digest: String,
    /// Brief machine code describing the failure, when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepReceipt {
    /// SHA-256 over this receipt's canonical serialization.
    #[must_use]
    pub fn digest(&self) -> String {
        let bytes = canonical_json(self).unwrap_or_default();
        sha256_hex(&bytes)
    }
}
