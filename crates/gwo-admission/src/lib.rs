// SPDX-License-Identifier: MIT OR Apache-2.0
//! gwo-admission
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The per-tenant admission gate evaluated when a worker pops a job:
//! a concurrency cap plus a sliding per-minute rate window. Decisions are
//! atomic under one mutex; a denied job is the caller's to re-enqueue, not
//! the gate's to hold.

use gwo_config::Quota;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The tenant may start a run now.
    Admitted,
    /// The tenant is at its concurrency cap.
    DeniedConcurrency,
    /// The tenant exhausted its per-minute window.
    DeniedRate,
}

impl AdmissionDecision {
    /// `true` only for [`AdmissionDecision::Admitted`].
    #[must_use]
    pub fn is_admitted(self) -> bool {
        self == Self::Admitted
    }
}

struct State {
    running: BTreeMap<String, u32>,
    window: BTreeMap<String, VecDeque<Instant>>,
}

struct Inner {
    tenants: BTreeMap<String, Quota>,
    window_len: Duration,
    state: Mutex<State>,
}

/// Shared, cloneable admission gate.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    /// Create a gate over the configured tenant quotas. Unknown tenants
    /// fall back to the `public` entry, then to [`Quota::default`].
    #[must_use]
    pub fn new(tenants: BTreeMap<String, Quota>) -> Self {
        Self::with_window(tenants, Duration::from_secs(60))
    }

    /// Create a gate with a custom rate-window length (tests shorten it).
    #[must_use]
    pub fn with_window(tenants: BTreeMap<String, Quota>, window_len: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                tenants,
                window_len,
                state: Mutex::new(State {
                    running: BTreeMap::new(),
                    window: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Quota applied to `tenant`.
    #[must_use]
    pub fn quota(&self, tenant: &str) -> Quota {
        self.inner
            .tenants
            .get(tenant)
            .or_else(|| self.inner.tenants.get("public"))
            .copied()
            .unwrap_or_default()
    }

    /// Atomically decide whether `tenant` may start a run now, counting it
    /// if so. Every `Admitted` must be paired with [`mark_done`].
    ///
    /// [`mark_done`]: Self::mark_done
    pub fn allow_start(&self, tenant: &str) -> AdmissionDecision {
        let quota = self.quota(tenant);
        let now = Instant::now();
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());

        let running = state.running.entry(tenant.to_string()).or_insert(0);
        if *running >= quota.max_concurrent {
            return AdmissionDecision::DeniedConcurrency;
        }

        let window_len = self.inner.window_len;
        let window = state.window.entry(tenant.to_string()).or_default();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > window_len)
        {
            window.pop_front();
        }
        if window.len() >= quota.per_minute as usize {
            return AdmissionDecision::DeniedRate;
        }

        window.push_back(now);
        *state.running.entry(tenant.to_string()).or_insert(0) += 1;
        AdmissionDecision::Admitted
    }

    /// Release one admitted run for `tenant`.
    pub fn mark_done(&self, tenant: &str) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = state.running.get_mut(tenant) {
            *running = running.saturating_sub(1);
        }
    }

    /// [`allow_start`] wrapped in a permit that releases on drop.
    ///
    /// [`allow_start`]: Self::allow_start
    pub fn permit(&self, tenant: &str) -> Result<AdmissionPermit, AdmissionDecision> {
        match self.allow_start(tenant) {
            AdmissionDecision::Admitted => Ok(AdmissionPermit {
                controller: self.clone(),
                tenant: tenant.to_string(),
            }),
            denied => Err(denied),
        }
    }

    /// Non-mutating check of the tenant's rate window, used at submission
    /// time. Pop-time admission remains authoritative.
    #[must_use]
    pub fn rate_available(&self, tenant: &str) -> bool {
        let quota = self.quota(tenant);
        let now = Instant::now();
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let in_window = state
            .window
            .get(tenant)
            .map(|w| {
                w.iter()
                    .filter(|t| now.duration_since(**t) <= self.inner.window_len)
                    .count()
            })
            .unwrap_or(0);
        in_window < quota.per_minute as usize
    }

    /// Currently admitted run count for `tenant`.
    #[must_use]
    pub fn running(&self, tenant: &str) -> u32 {
        self.inner
            .state
            .lock()
            .map(|s| s.running.get(tenant).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

/// An admitted slot; dropping it releases the tenant's concurrency count.
pub struct AdmissionPermit {
    controller: AdmissionController,
    tenant: String,
}

impl AdmissionPermit {
    /// The tenant this permit admits.
    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.mark_done(&self.tenant);
    }
}
