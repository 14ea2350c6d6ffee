// SPDX-License-Identifier: MIT OR Apache-2.0
//! The event union shared by the bus, the audit log, and the webhook sink.
//!
//! Events are a closed set of variants rather than free-form maps: each
//! message type declares its fields, and the envelope adds the timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A timestamped orchestration event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event was produced.
    pub ts: DateTime<Utc>,
    /// The typed payload.
    #[serde(flatten)]
    pub body: EventBody,
}

impl Event {
    /// Wrap a payload with the current time.
    #[must_use]
    pub fn now(body: EventBody) -> Self {
        Self {
            ts: Utc::now(),
            body,
        }
    }

    /// The run this event concerns, if any.
    #[must_use]
    pub fn run_id(&self) -> Option<Uuid> {
        match &self.body {
            EventBody::RunEnqueued { run_id, .. }
            | EventBody::RunStart { run_id, .. }
            | EventBody::Step { run_id, .. }
            | EventBody::RunDone { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }
}

/// Discriminated union of every event the orchestrator emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    /// A run was accepted and placed on the queue.
    RunEnqueued {
        /// Run identifier.
        run_id: Uuid,
        /// Owning tenant.
        tenant: String,
        /// Queue priority at submission.
        prio: u8,
    },
    /// A worker picked the run up and admission accepted it.
    RunStart {
        /// Run identifier.
        run_id: Uuid,
        /// Owning tenant.
        tenant: String,
    },
    /// One task attempt completed.
    Step {
        /// Run identifier.
        run_id: Uuid,
        /// Owning tenant.
        tenant: String,
        /// Task name within the DAG.
        task: String,
        /// Digest of the appended receipt.
        digest: String,
        /// Whether the attempt succeeded.
        ok: bool,
    },
    /// The run reached a terminal state.
    RunDone {
        /// Run identifier.
        run_id: Uuid,
        /// Owning tenant.
        tenant: String,
        /// `true` only for `succeeded`.
        ok: bool,
        /// Final chain head over the run's receipts.
        head: String,
        /// Failure or cancellation reason, when not ok.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A glyph program was compiled (audit trail of the compile surface).
    Glyph {
        /// Digest of the compiled DAG, when compilation succeeded.
        #[serde(skip_serializing_if = "Option::is_none")]
        dag_digest: Option<String>,
        /// Whether the program was accepted.
        ok: bool,
    },
    /// A rollout budget evaluation was performed.
    RolloutEvaluate {
        /// Observed error rate.
        error_rate: f64,
        /// Observed request count.
        requests: u64,
        /// `proceed` or `rollback`.
        verdict: String,
    },
    /// A judge envelope was issued.
    JudgeVerdict {
        /// Manifest hash the envelope is bound to.
        manifest_hash: String,
    },
    /// The keyring rotated an active key.
    KeyRotated {
        /// New active key id.
        key_id: String,
        /// Signing algorithm.
        alg: String,
    },
    /// A webhook delivery attempt finished.
    Webhook {
        /// Whether the sink accepted the payload.
        ok: bool,
    },
    /// A streaming subscriber fell behind and was disconnected.
    SubscriberDropped {
        /// Number of events the subscriber missed before the drop.
        lagged: u64,
    },
}
