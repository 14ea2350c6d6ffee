// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run records, the run state machine, and the receipt chain head.

use crate::canonical::{ZERO_DIGEST, sha256_hex};
use crate::receipt::StepReceipt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a run. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Waiting in the queue.
    Queued,
    /// Currently executing.
    Running,
    /// All tasks completed successfully.
    Succeeded,
    /// A task exhausted its retries, or a plugin was missing.
    Failed,
    /// Cancelled cooperatively before completion.
    Canceled,
}

impl RunState {
    /// `true` for `succeeded`, `failed`, and `canceled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// `true` if `self → next` is a legal transition. A queued run may
    /// start or be cancelled; a running run may only end; terminal states
    /// absorb everything.
    #[must_use]
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running | Self::Canceled)
                | (Self::Running, Self::Succeeded | Self::Failed | Self::Canceled)
        )
    }
}

/// One submitted workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Digest of the DAG this run executes.
    pub dag_digest: String,
    /// Owning tenant.
    pub tenant: String,
    /// Current lifecycle state.
    pub state: RunState,
    /// Receipts in append order, one per completed task attempt.
    pub receipts: Vec<StepReceipt>,
    /// When the run was created.
    pub created_ts: DateTime<Utc>,
}

impl Run {
    /// Create a freshly-queued run.
    pub fn new(dag_digest: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            dag_digest: dag_digest.into(),
            tenant: tenant.into(),
            state: RunState::Queued,
            receipts: Vec::new(),
            created_ts: Utc::now(),
        }
    }

    /// Apply `next` if the transition is legal, returning whether the
    /// state changed. Every state write goes through here so an illegal
    /// transition (double-finish, revive-after-cancel) is a no-op instead
    /// of corruption.
    pub fn transition(&mut self, next: RunState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// The current chain head over this run's receipts.
    #[must_use]
    pub fn head(&self) -> String {
        chain_head(&self.receipts)
    }
}

/// Fold the receipt chain: `H₀` is the zero digest, and each receipt
/// extends the head as `SHA-256(hex(prev) ‖ hex(digest(receipt)))` over the
/// concatenated lowercase-hex strings.
///
/// The head is append-only by construction: the head after `n` receipts is
/// an intermediate value of the head after `n + 1`.
#[must_use]
pub fn chain_head(receipts: &[StepReceipt]) -> String {
    let mut head = ZERO_DIGEST.to_string();
    for r in receipts {
        let mut buf = String::with_capacity(128);
        buf.push_str(&head);
        buf.push_str(&r.digest());
        head = sha256_hex(buf.as_bytes());
    }
    head
}
