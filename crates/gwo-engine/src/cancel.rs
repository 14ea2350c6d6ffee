// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative run cancellation.
//!
//! A run's cancel token records *why* the run is being stopped, and that
//! reason travels into the terminal `run_done` event. Cancellation is
//! cooperative: the engine consults the token between tasks, never
//! mid-task.

use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Why a run is being cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// An operator or API caller asked for the run to stop.
    UserRequested,
    /// The engine is shutting down; no further tasks may start.
    Shutdown,
}

impl CancelReason {
    /// Machine code reported in `run_done` events and receipts.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::UserRequested => "canceled",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Cloneable cancellation handle shared between a run's owner and the
/// worker executing it.
///
/// The first recorded reason wins; later calls still wake waiters but do
/// not overwrite it.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenState>,
}

#[derive(Default)]
struct TokenState {
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

impl CancelToken {
    /// A fresh token with no cancellation recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation for the given reason.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut slot = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.notify.notify_waiters();
    }

    /// The recorded reason, if cancellation was requested.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        *self.inner.reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Wait until cancellation is requested, yielding the reason.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            if let Some(reason) = self.reason() {
                return reason;
            }
            self.inner.notify.notified().await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}
