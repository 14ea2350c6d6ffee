// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! HTTP control plane for the glyph workflow orchestrator.
//!
//! The reference surface from the contract: compile, submit, inspect, and
//! cancel runs; tail or stream events; fetch and verify audit proofs; push
//! rollout metrics and evaluate the gate; rotate keys. Signed endpoints
//! verify an HMAC over the raw body (`X-Codex-KeyId` / `X-Codex-Sig`) and
//! an optional opaque `X-Auth` token.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path as AxPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::stream::Stream;
use gwo_audit::ProofStep;
use gwo_bus::SubscriptionEnd;
use gwo_core::{CONTRACT_VERSION, DEFAULT_TENANT, EventBody, RunState};
use gwo_engine::{CancelError, Orchestrator, SubmitError};
use gwo_keyring::{HEADER_KEY_ID, HEADER_SIG, KeyAlgorithm, append_ledger, last_ledger_entry, last_ledger_hash};
use gwo_glyph::{PlanContext, Risk};
use gwo_rollout::{
    CanaryTracker, RolloutMetrics, Verdict, build_rollback_proof, evaluate, judge_envelope,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Header carrying the opaque admission token.
pub const HEADER_AUTH: &str = "X-Auth";

/// Shared state behind every handler.
pub struct AppState {
    /// The engine this daemon fronts.
    pub orchestrator: Orchestrator,
    /// Directory holding rollout/rollback state files.
    pub state_dir: PathBuf,
    /// Latest pushed metrics window (also persisted under `state_dir`).
    pub metrics: tokio::sync::RwLock<Option<RolloutMetrics>>,
    /// Canary deployment tracked by the rollout gate.
    pub canary: tokio::sync::RwLock<CanaryTracker>,
}

impl AppState {
    /// Create state over an orchestrator, with rollout files under
    /// `state_dir`.
    pub fn new(orchestrator: Orchestrator, state_dir: impl Into<PathBuf>) -> Self {
        let budget = orchestrator.config().rollout;
        Self {
            orchestrator,
            state_dir: state_dir.into(),
            metrics: tokio::sync::RwLock::new(None),
            canary: tokio::sync::RwLock::new(CanaryTracker::new(budget)),
        }
    }

    fn metrics_path(&self) -> PathBuf {
        self.state_dir.join("rollout").join("metrics.json")
    }

    fn proof_path(&self) -> PathBuf {
        self.state_dir.join("rollback").join("proof.json")
    }
}

/// JSON error envelope: `{"error": "..."}` with the mapped status.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status to return.
    pub status: StatusCode,
    /// Redacted, user-facing message.
    pub message: String,
}

impl ApiError {
    /// Create an error response.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::InvalidGlyph(_) => ApiError::new(StatusCode::BAD_REQUEST, e.to_string()),
            SubmitError::QuotaExceeded { .. } => {
                ApiError::new(StatusCode::TOO_MANY_REQUESTS, e.to_string())
            }
            SubmitError::Queue(_) => ApiError::new(StatusCode::TOO_MANY_REQUESTS, "queue full"),
        }
    }
}

/// Build the Axum router with every daemon route.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(cmd_healthz))
        .route("/tenants", get(cmd_tenants))
        .route("/workflows/compile", post(cmd_compile))
        .route("/runs", post(cmd_create_run))
        .route("/runs/{run_id}", get(cmd_get_run))
        .route("/runs/{run_id}/cancel", post(cmd_cancel_run))
        .route("/events/tail", get(cmd_events_tail))
        .route("/events/stream", get(cmd_events_stream))
        .route("/audit/proof", get(cmd_audit_proof))
        .route("/audit/verify", post(cmd_audit_verify))
        .route("/metrics/push", post(cmd_metrics_push))
        .route("/rollout/evaluate", post(cmd_rollout_evaluate))
        .route("/rollout/advance", post(cmd_rollout_advance))
        .route("/rollout/complete", post(cmd_rollout_complete))
        .route("/judge/verdict", post(cmd_judge_verdict))
        .route("/keys", get(cmd_keys_list))
        .route("/keys/rotate", post(cmd_keys_rotate))
        .route("/keys/verify", get(cmd_keys_verify))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CompileRequest {
    glyph: String,
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    glyph: String,
    tenant: Option<String>,
    prio: Option<u8>,
    /// Run the planning pre-pass even at low risk.
    #[serde(default)]
    plan: bool,
    #[serde(default)]
    risk: Risk,
    #[serde(default)]
    tags: Vec<String>,
    /// Opaque per-step score biases for the planner.
    #[serde(default)]
    bias: std::collections::BTreeMap<String, f64>,
}

/// Response body for `POST /runs`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    /// Newly assigned run id.
    pub run_id: Uuid,
    /// Digest of the compiled DAG.
    pub dag_digest: String,
    /// State at submission (always `queued`).
    pub state: RunState,
    /// Resolved tenant.
    pub tenant: String,
    /// Resolved priority.
    pub prio: u8,
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    n: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ProofQuery {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    root: String,
    index: usize,
    line: String,
    path: Vec<ProofStep>,
}

#[derive(Debug, Default, Deserialize)]
struct EvaluateRequest {
    #[serde(default)]
    manifest_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JudgeRequest {
    manifest_hash: String,
    metrics: RolloutMetrics,
}

#[derive(Debug, Deserialize)]
struct RotateRequest {
    #[serde(default)]
    alg: Option<KeyAlgorithm>,
}

// ---------------------------------------------------------------------------
// Request authentication
// ---------------------------------------------------------------------------

/// Verify `X-Auth` and the HMAC body signature on a signed endpoint.
///
/// Enforcement is configuration-driven: without `require_signatures` a
/// missing signature passes, but a *present* bad signature is still 401.
fn verify_request(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), ApiError> {
    let keys_cfg = &state.orchestrator.config().keys;

    if let Some(expected) = &keys_cfg.auth_token {
        let presented = headers.get(HEADER_AUTH).and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return Err(ApiError::new(StatusCode::UNAUTHORIZED, "bad auth token"));
        }
    }

    let sig = headers.get(HEADER_SIG).and_then(|v| v.to_str().ok());
    let key_id = headers.get(HEADER_KEY_ID).and_then(|v| v.to_str().ok());
    match sig {
        Some(sig) => {
            let keyring = state.orchestrator.keyring();
            let ok = keyring
                .read()
                .map(|ring| ring.verify(body, sig, key_id))
                .unwrap_or(false);
            if ok {
                Ok(())
            } else {
                Err(ApiError::new(StatusCode::UNAUTHORIZED, "bad signature"))
            }
        }
        None if keys_cfg.require_signatures => {
            Err(ApiError::new(StatusCode::UNAUTHORIZED, "signature required"))
        }
        None => Ok(()),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid body: {e}")))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn cmd_healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cfg = state.orchestrator.config();
    let queue_backend = match cfg.queue {
        gwo_config::QueueBackend::Memory => "memory",
        gwo_config::QueueBackend::Stream { .. } => "stream",
    };
    Json(json!({
        "ok": true,
        "version": CONTRACT_VERSION,
        "queue_backend": queue_backend,
        "workers": cfg.engine.workers,
        "bus_capacity": cfg.bus.capacity,
        "queued": state.orchestrator.queue_len(),
    }))
}

async fn cmd_tenants(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "tenants": state.orchestrator.config().tenants }))
}

async fn cmd_compile(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: CompileRequest = parse_body(&body)?;
    let compiled = gwo_glyph::compile(&req.glyph);
    if !compiled.ok {
        state.orchestrator.emit(EventBody::Glyph {
            dag_digest: None,
            ok: false,
        });
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "glyph order invalid",
        ));
    }
    let dag = gwo_glyph::compile_to_dag(&req.glyph)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let digest = dag.digest();
    state.orchestrator.emit(EventBody::Glyph {
        dag_digest: Some(digest.clone()),
        ok: true,
    });
    Ok(Json(json!({
        "ok": true,
        "dag_digest": digest,
        "tasks": dag.tasks.keys().collect::<Vec<_>>(),
    })))
}

async fn cmd_create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RunResponse>, ApiError> {
    verify_request(&state, &headers, &body)?;
    let req: RunRequest = parse_body(&body)?;
    let tenant = req
        .tenant
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TENANT.to_string());
    let prio = req.prio.unwrap_or(5).min(10);

    let run = if req.plan || req.risk == Risk::High {
        // Planning pre-pass: compile, then let scores and the risk gate
        // decide the final step list.
        let compiled = gwo_glyph::compile(&req.glyph);
        if !compiled.ok {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "glyph order invalid"));
        }
        let ctx = PlanContext {
            tenant: tenant.clone(),
            priority: prio,
            risk: req.risk,
            tags: req.tags.clone(),
        };
        let steps = gwo_glyph::plan(&compiled.steps, &ctx, &req.bias);
        if steps.is_empty() {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "glyph program is empty"));
        }
        let mut dag = gwo_core::Dag::from_steps(&steps);
        dag.meta.insert("source".into(), "planner".into());
        state.orchestrator.submit_dag(dag, &tenant, prio).await?
    } else {
        state.orchestrator.submit(&req.glyph, &tenant, prio).await?
    };
    Ok(Json(RunResponse {
        run_id: run.run_id,
        dag_digest: run.dag_digest,
        state: run.state,
        tenant,
        prio,
    }))
}

async fn cmd_get_run(
    AxPath(run_id): AxPath<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = state
        .orchestrator
        .run_snapshot(run_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "run not found"))?;
    Ok(Json(json!({
        "run_id": run.run_id,
        "state": run.state,
        "receipts": run.receipts,
        "head": run.head(),
    })))
}

async fn cmd_cancel_run(
    AxPath(run_id): AxPath<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.orchestrator.cancel_run(run_id).await {
        Ok(observed) => Ok(Json(json!({
            "run_id": run_id,
            "observed": observed,
        }))),
        Err(CancelError::NotFound) => {
            Err(ApiError::new(StatusCode::NOT_FOUND, "run not found"))
        }
        Err(CancelError::AlreadyTerminal { state }) => Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("run is already terminal: {state:?}"),
        )),
    }
}

async fn cmd_events_tail(
    Query(q): Query<TailQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let n = q.n.unwrap_or(50);
    Json(state.orchestrator.bus().tail(n))
}

async fn cmd_events_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let sub = state.orchestrator.bus().subscribe();
    let orchestrator = state.orchestrator.clone();
    let stream = futures::stream::unfold(sub, move |mut sub| {
        let orchestrator = orchestrator.clone();
        async move {
            match sub.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".into());
                    Some((Ok(SseEvent::default().data(data)), sub))
                }
                Err(SubscriptionEnd::Lagged(lagged)) => {
                    warn!(lagged, "dropping lagged event subscriber");
                    orchestrator.emit(EventBody::SubscriberDropped { lagged });
                    None
                }
                Err(SubscriptionEnd::Closed) => None,
            }
        }
    });
    Sse::new(stream)
}

async fn cmd_audit_proof(
    Query(q): Query<ProofQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<gwo_audit::AuditProof>, ApiError> {
    state
        .orchestrator
        .audit()
        .proof(q.index)
        .map(Json)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))
}

async fn cmd_audit_verify(
    State(_state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: VerifyRequest = parse_body(&body)?;
    let ok = gwo_audit::verify_inclusion(&req.root, req.line.as_bytes(), req.index, &req.path);
    Ok(Json(json!({ "ok": ok })))
}

async fn cmd_metrics_push(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let metrics: RolloutMetrics = parse_body(&body)?;
    let path = state.metrics_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(bytes) = serde_json::to_vec_pretty(&metrics) {
        if let Err(e) = std::fs::write(&path, bytes) {
            warn!(error = %e, "metrics persist failed");
        }
    }
    *state.metrics.write().await = Some(metrics);
    Ok(Json(json!({ "stored": true })))
}

async fn cmd_rollout_evaluate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_request(&state, &headers, &body)?;
    let req: EvaluateRequest = if body.is_empty() {
        EvaluateRequest::default()
    } else {
        parse_body(&body)?
    };
    let budget = state.orchestrator.config().rollout;

    let metrics = match state.metrics.read().await.clone() {
        Some(m) => m,
        None => std::fs::read(state.metrics_path())
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or(RolloutMetrics {
                requests: 0,
                errors: 0,
                window_s: 0,
                ns: None,
            }),
    };

    let verdict = evaluate(&metrics, &budget);
    let canary_state = {
        let mut canary = state.canary.write().await;
        if canary.state() == gwo_rollout::CanaryState::Idle {
            canary.begin();
        }
        canary.record_metrics(&metrics);
        // A clean evaluation closes out any advance step in progress.
        canary.settle();
        canary.state()
    };
    if verdict == Verdict::Rollback {
        let keyring = state.orchestrator.keyring();
        let proof = {
            let ring = keyring
                .read()
                .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "keyring"))?;
            let manifest_hash = req.manifest_hash.clone().unwrap_or_default();
            build_rollback_proof(manifest_hash, metrics.clone(), &ring)
                .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        };
        let path = state.proof_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec_pretty(&proof) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    warn!(error = %e, "rollback proof persist failed");
                }
            }
            Err(e) => warn!(error = %e, "rollback proof encode failed"),
        }
    }

    state.orchestrator.emit(EventBody::RolloutEvaluate {
        error_rate: metrics.error_rate(),
        requests: metrics.requests,
        verdict: verdict.to_string(),
    });
    Ok(Json(json!({
        "error_rate": metrics.error_rate(),
        "requests": metrics.requests,
        "budget": budget,
        "verdict": verdict,
        "canary": canary_state,
    })))
}

async fn cmd_rollout_advance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_request(&state, &headers, &body)?;
    let mut canary = state.canary.write().await;
    if !canary.advance() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("cannot advance from {:?}", canary.state()),
        ));
    }
    Ok(Json(json!({ "canary": canary.state() })))
}

async fn cmd_rollout_complete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_request(&state, &headers, &body)?;
    let mut canary = state.canary.write().await;
    if !canary.complete() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("cannot complete from {:?}", canary.state()),
        ));
    }
    Ok(Json(json!({ "canary": canary.state() })))
}

async fn cmd_judge_verdict(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_request(&state, &headers, &body)?;
    let req: JudgeRequest = parse_body(&body)?;

    let keyring = state.orchestrator.keyring();
    let envelope = {
        let ring = keyring
            .read()
            .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "keyring"))?;
        judge_envelope(&req.manifest_hash, &req.metrics, &ring)
            .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    };

    state.orchestrator.emit(EventBody::JudgeVerdict {
        manifest_hash: req.manifest_hash,
    });
    Ok(Json(json!({ "jwp": envelope })))
}

async fn cmd_keys_list(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let keyring = state.orchestrator.keyring();
    let ring = keyring
        .read()
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "keyring"))?;
    Ok(Json(json!({
        "keys": ring.list(),
        "active_hmac": ring.active_key_id(KeyAlgorithm::HmacSha256),
        "active_ed25519": ring.active_key_id(KeyAlgorithm::Ed25519),
    })))
}

async fn cmd_keys_rotate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_request(&state, &headers, &body)?;
    let req: RotateRequest = if body.is_empty() {
        RotateRequest { alg: None }
    } else {
        parse_body(&body)?
    };
    let alg = req.alg.unwrap_or(KeyAlgorithm::HmacSha256);
    let keys_cfg = state.orchestrator.config().keys.clone();

    let keyring = state.orchestrator.keyring();
    let entry = {
        let mut ring = keyring
            .write()
            .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "keyring"))?;
        let prev = last_ledger_hash(&keys_cfg.ledger_path)
            .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        let entry = ring.rotate(alg, None, prev);
        if let Err(e) = ring.save(&keys_cfg.path) {
            warn!(error = %e, "keyring persist failed");
        }
        entry
    };
    append_ledger(&keys_cfg.ledger_path, &entry)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    info!(kid = %entry.kid, %alg, "rotated active key");
    state.orchestrator.emit(EventBody::KeyRotated {
        key_id: entry.kid.clone(),
        alg: alg.to_string(),
    });
    Ok(Json(json!({ "kid": entry.kid, "alg": alg })))
}

async fn cmd_keys_verify(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let ledger_path = state.orchestrator.config().keys.ledger_path.clone();
    let last = last_ledger_entry(&ledger_path)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "last": last })))
}
