// SPDX-License-Identifier: MIT OR Apache-2.0
//! gwo-engine
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The execution engine. An [`Orchestrator`] owns the event bus, the
//! admission gate, the audit log, a handle to the active queue, and the
//! keyring, and drives a pool of workers that pop jobs, pass admission,
//! and execute DAG tasks in topological order with timeouts, linear-backoff
//! retries, cooperative cancellation, and per-attempt receipts. Multiple
//! orchestrators in one process are independent; nothing here is global.

/// Cooperative cancellation token.
pub mod cancel;
/// Webhook sink and chain export.
pub mod sink;

use crate::cancel::{CancelReason, CancelToken};
use crate::sink::{ChainExporter, WebhookSink, output_digest};
use chrono::Utc;
use gwo_admission::AdmissionController;
use gwo_audit::{AuditError, AuditLog};
use gwo_bus::EventBus;
use gwo_config::{OrchestratorConfig, QueueBackend};
use gwo_core::{Dag, Event, EventBody, Run, RunState, StepReceipt, sha256_hex};
use gwo_glyph::GlyphError;
use gwo_keyring::Keyring;
use gwo_plugins::Runner;
use gwo_queue::{Job, JobQueue, MemoryQueue, QueueError, StreamQueue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors from engine construction.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The audit log could not be opened.
    #[error(transparent)]
    Audit(#[from] AuditError),
    /// The queue backend could not be opened.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors from run submission.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The glyph program was rejected by the compiler.
    #[error(transparent)]
    InvalidGlyph(#[from] GlyphError),
    /// The tenant's per-minute window is already full.
    #[error("tenant {tenant} exceeded its per-minute quota")]
    QuotaExceeded {
        /// The limited tenant.
        tenant: String,
    },
    /// The queue refused the job.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors from run cancellation.
#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    /// No run with the given id.
    #[error("run not found")]
    NotFound,
    /// The run already reached a terminal state.
    #[error("run is already terminal")]
    AlreadyTerminal {
        /// The state the run is in.
        state: RunState,
    },
}

struct RunEntry {
    run: Run,
    cancel: CancelToken,
}

struct Inner {
    cfg: OrchestratorConfig,
    queue: Arc<dyn JobQueue>,
    admission: AdmissionController,
    bus: Arc<EventBus>,
    audit: Arc<AuditLog>,
    keyring: Arc<RwLock<Keyring>>,
    runner: Arc<dyn Runner>,
    runs: tokio::sync::RwLock<HashMap<Uuid, RunEntry>>,
    shutdown: CancelToken,
    webhook: Option<WebhookSink>,
    chain: Option<ChainExporter>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// The orchestrator: submission surface plus worker pool.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build an orchestrator from configuration.
    ///
    /// # Errors
    ///
    /// [`EngineError`] when the audit log or stream queue cannot be opened.
    pub fn new(
        cfg: OrchestratorConfig,
        runner: Arc<dyn Runner>,
        keyring: Arc<RwLock<Keyring>>,
    ) -> Result<Self, EngineError> {
        let queue: Arc<dyn JobQueue> = match &cfg.queue {
            QueueBackend::Memory => Arc::new(MemoryQueue::new()),
            QueueBackend::Stream { path } => Arc::new(StreamQueue::open(path.clone())?),
        };
        let audit = Arc::new(AuditLog::open(cfg.audit.path.clone(), cfg.audit.rotate_bytes)?);
        let bus = Arc::new(EventBus::with_capacity(cfg.bus.capacity));
        let admission = AdmissionController::new(cfg.tenants.clone());
        let webhook = cfg
            .webhook
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .map(|url| WebhookSink::new(url, Arc::clone(&keyring), cfg.webhook.timeout_ms));
        let chain = cfg.engine.chain_export.clone().map(ChainExporter::new);

        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                queue,
                admission,
                bus,
                audit,
                keyring,
                runner,
                runs: tokio::sync::RwLock::new(HashMap::new()),
                shutdown: CancelToken::new(),
                webhook,
                chain,
                workers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawn the configured number of workers.
    pub fn start(&self) {
        let n = self.inner.cfg.engine.workers.max(1);
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for worker_id in 0..n {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(worker_loop(inner, worker_id)));
        }
        info!(workers = n, "engine started");
    }

    /// Stop fetching new jobs, let in-flight tasks finish, and join the
    /// workers. Runs interrupted mid-DAG end `canceled` with a `shutdown`
    /// reason.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel(CancelReason::Shutdown);
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self
                .inner
                .workers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for h in handles {
            let _ = h.await;
        }
        info!("engine stopped");
    }

    /// Compile a glyph program and enqueue a run for it.
    ///
    /// # Errors
    ///
    /// [`SubmitError::InvalidGlyph`] for a rejected program,
    /// [`SubmitError::QuotaExceeded`] when the tenant's window is full,
    /// [`SubmitError::Queue`] when the queue refuses the job.
    pub async fn submit(
        &self,
        glyph: &str,
        tenant: &str,
        prio: u8,
    ) -> Result<Run, SubmitError> {
        let dag = gwo_glyph::compile_to_dag(glyph)?;
        self.submit_dag(dag, tenant, prio).await
    }

    /// Enqueue a run for an already-built DAG.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit) (minus glyph compilation).
    pub async fn submit_dag(
        &self,
        dag: Dag,
        tenant: &str,
        prio: u8,
    ) -> Result<Run, SubmitError> {
        if !self.inner.admission.rate_available(tenant) {
            return Err(SubmitError::QuotaExceeded {
                tenant: tenant.to_string(),
            });
        }
        let run = Run::new(dag.digest(), tenant);
        {
            let mut runs = self.inner.runs.write().await;
            runs.insert(
                run.run_id,
                RunEntry {
                    run: run.clone(),
                    cancel: CancelToken::new(),
                },
            );
        }
        self.inner.queue.enqueue(
            Job {
                run: run.clone(),
                dag,
                prio,
            },
            prio,
        )?;
        self.inner.emit(EventBody::RunEnqueued {
            run_id: run.run_id,
            tenant: tenant.to_string(),
            prio,
        });
        Ok(run)
    }

    /// Snapshot of a run's current record.
    pub async fn run_snapshot(&self, run_id: Uuid) -> Option<Run> {
        self.inner
            .runs
            .read()
            .await
            .get(&run_id)
            .map(|e| e.run.clone())
    }

    /// Cancel a run. Queued runs cancel immediately; running runs cancel
    /// cooperatively between tasks. Returns the state observed at the time
    /// of the request.
    ///
    /// # Errors
    ///
    /// [`CancelError::NotFound`] for an unknown id,
    /// [`CancelError::AlreadyTerminal`] once the run has finished.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<RunState, CancelError> {
        let (state, head, tenant) = {
            let mut runs = self.inner.runs.write().await;
            let entry = runs.get_mut(&run_id).ok_or(CancelError::NotFound)?;
            if entry.run.state.is_terminal() {
                return Err(CancelError::AlreadyTerminal {
                    state: entry.run.state,
                });
            }
            entry.cancel.cancel(CancelReason::UserRequested);
            let observed = entry.run.state;
            // A queued run never reaches a worker; it cancels right here.
            // Running runs cancel cooperatively when the worker next looks
            // at the token.
            if observed == RunState::Queued && entry.run.transition(RunState::Canceled) {
                (observed, entry.run.head(), entry.run.tenant.clone())
            } else {
                (observed, String::new(), String::new())
            }
        };
        if state == RunState::Queued {
            self.inner.emit(EventBody::RunDone {
                run_id,
                tenant,
                ok: false,
                head,
                reason: Some(CancelReason::UserRequested.code().into()),
            });
        }
        Ok(state)
    }

    /// Publish an event to the bus, the audit log, and the webhook sink.
    pub fn emit(&self, body: EventBody) {
        self.inner.emit(body);
    }

    /// The engine's event bus.
    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.bus)
    }

    /// The engine's audit log.
    #[must_use]
    pub fn audit(&self) -> Arc<AuditLog> {
        Arc::clone(&self.inner.audit)
    }

    /// The engine's admission gate.
    #[must_use]
    pub fn admission(&self) -> AdmissionController {
        self.inner.admission.clone()
    }

    /// The shared keyring handle.
    #[must_use]
    pub fn keyring(&self) -> Arc<RwLock<Keyring>> {
        Arc::clone(&self.inner.keyring)
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.cfg
    }

    /// Jobs currently waiting in the queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }
}

impl Inner {
    fn emit(self: &Arc<Self>, body: EventBody) {
        let event = Event::now(body);
        self.bus.publish(event.clone());
        if let Err(e) = self.audit.append(&event) {
            warn!(error = %e, "audit append failed");
        }
        // The webhook sink never sees its own delivery reports.
        if self.webhook.is_some() && !matches!(event.body, EventBody::Webhook { .. }) {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if let Some(sink) = &inner.webhook {
                    if !sink.deliver(&event).await {
                        inner.bus.publish(Event::now(EventBody::Webhook { ok: false }));
                    }
                }
            });
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, worker_id: usize) {
    let drain_timeout = Duration::from_millis(inner.cfg.engine.drain_timeout_ms.max(10));
    let requeue_delay = Duration::from_millis(inner.cfg.engine.requeue_delay_ms);
    debug!(worker_id, "worker online");

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        let job = tokio::select! {
            job = inner.queue.drain(drain_timeout) => job,
            _ = inner.shutdown.cancelled() => break,
        };
        let Some(job) = job else { continue };

        // A run cancelled while queued is consumed silently; its terminal
        // event was already emitted.
        let already_terminal = inner
            .runs
            .read()
            .await
            .get(&job.run.run_id)
            .map(|e| e.run.state.is_terminal())
            .unwrap_or(false);
        if already_terminal {
            continue;
        }

        match inner.admission.permit(&job.run.tenant) {
            Err(decision) => {
                debug!(
                    worker_id,
                    tenant = %job.run.tenant,
                    ?decision,
                    "admission refused, re-enqueueing"
                );
                let requeue = Arc::clone(&inner);
                tokio::spawn(async move {
                    tokio::time::sleep(requeue_delay).await;
                    let prio = job.prio;
                    if let Err(e) = requeue.queue.enqueue(job, prio) {
                        warn!(error = %e, "re-enqueue after admission denial failed");
                    }
                });
            }
            Ok(permit) => {
                execute_job(&inner, job).await;
                // Dropping the permit is the guaranteed admission release.
                drop(permit);
            }
        }
    }
    debug!(worker_id, "worker offline");
}

async fn execute_job(inner: &Arc<Inner>, job: Job) {
    let run_id = job.run.run_id;
    let tenant = job.run.tenant.clone();

    let cancel = {
        let mut runs = inner.runs.write().await;
        let entry = runs.entry(run_id).or_insert_with(|| RunEntry {
            run: job.run.clone(),
            cancel: CancelToken::new(),
        });
        // The transition gate also filters runs cancelled while queued.
        if !entry.run.transition(RunState::Running) {
            return;
        }
        entry.cancel.clone()
    };
    inner.emit(EventBody::RunStart {
        run_id,
        tenant: tenant.clone(),
    });

    let order = match job.dag.topo() {
        Ok(order) => order,
        Err(e) => {
            warn!(%run_id, error = %e, "rejecting unschedulable DAG");
            finish(inner, run_id, &tenant, RunState::Failed, Some("cycle".into())).await;
            return;
        }
    };

    let mut failure: Option<(RunState, String)> = None;
    'tasks: for name in order {
        // Run-level cancellation and engine shutdown both stop the run
        // between tasks; the in-flight task always ran to completion.
        if let Some(reason) = cancel.reason().or_else(|| inner.shutdown.reason()) {
            failure = Some((RunState::Canceled, reason.code().into()));
            break;
        }
        let Some(task) = job.dag.tasks.get(&name) else {
            failure = Some((RunState::Failed, "unknown_task".into()));
            break;
        };

        let mut attempt: u32 = 0;
        loop {
            let started_ts = Utc::now();
            let outcome = inner.runner.run(task).await;
            let ended_ts = Utc::now();

            let receipt = StepReceipt {
                task: name.clone(),
                started_ts,
                ended_ts,
                ok: outcome.is_ok(),
                output_digest: output_digest(outcome.output.as_ref()),
                log_digest: sha256_hex(&outcome.log),
                error: outcome.error.clone(),
            };
            let digest = receipt.digest();
            {
                let mut runs = inner.runs.write().await;
                if let Some(entry) = runs.get_mut(&run_id) {
                    let prev = entry.run.head();
                    entry.run.receipts.push(receipt);
                    if let Some(chain) = &inner.chain {
                        chain.export(&prev, &entry.run.head(), &run_id.to_string(), &name);
                    }
                }
            }
            inner.emit(EventBody::Step {
                run_id,
                tenant: tenant.clone(),
                task: name.clone(),
                digest,
                ok: outcome.is_ok(),
            });

            if outcome.is_ok() {
                break;
            }
            if outcome.is_missing_plugin() {
                failure = Some((RunState::Failed, gwo_plugins::MISSING_PLUGIN.into()));
                break 'tasks;
            }
            if attempt >= task.max_retries {
                let reason = outcome.error.unwrap_or_else(|| "runner_error".into());
                failure = Some((RunState::Failed, reason));
                break 'tasks;
            }
            attempt += 1;
            tokio::time::sleep(task.backoff(attempt)).await;
        }
    }

    match failure {
        None => finish(inner, run_id, &tenant, RunState::Succeeded, None).await,
        Some((state, reason)) => finish(inner, run_id, &tenant, state, Some(reason)).await,
    }
}

async fn finish(
    inner: &Arc<Inner>,
    run_id: Uuid,
    tenant: &str,
    state: RunState,
    reason: Option<String>,
) {
    let head = {
        let mut runs = inner.runs.write().await;
        match runs.get_mut(&run_id) {
            Some(entry) => {
                // Gated: if the run was already finished elsewhere this
                // write is a no-op and we only re-report the head.
                entry.run.transition(state);
                entry.run.head()
            }
            None => return,
        }
    };
    inner.emit(EventBody::RunDone {
        run_id,
        tenant: tenant.to_string(),
        ok: state == RunState::Succeeded,
        head,
        reason,
    });
}
