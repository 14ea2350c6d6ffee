// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios over the in-process HTTP router.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use gwo_config::{OrchestratorConfig, Quota, RolloutBudget};
use gwo_core::{RunState, ZERO_DIGEST};
use gwo_daemon::{AppState, build_app};
use gwo_engine::Orchestrator;
use gwo_keyring::{Key, KeyAlgorithm, KeyStatus, Keyring};
use gwo_plugins::{PluginRegistry, RunnerRouter, register_core_handlers};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const FULL_GLYPH: &str =
    "verify; invoke; audit; scan; attest; sanctify; rollout; judge; deploy; continuum";

struct Harness {
    app: Router,
    orchestrator: Orchestrator,
    _dir: tempfile::TempDir,
}

fn harness_with(mut cfg: OrchestratorConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    cfg.audit.path = dir.path().join("audit.jsonl");
    cfg.keys.path = dir.path().join("keyring.json");
    cfg.keys.ledger_path = dir.path().join("keyring.ledger.jsonl");
    cfg.engine.drain_timeout_ms = 20;
    cfg.engine.requeue_delay_ms = 10;

    let mut registry = PluginRegistry::new();
    register_core_handlers(&mut registry);
    let runner = Arc::new(RunnerRouter::new(Arc::new(registry)));
    let keyring = Arc::new(RwLock::new(Keyring::with_hmac_key("k1", "e2e-secret")));
    let orchestrator = Orchestrator::new(cfg, runner, keyring).unwrap();
    orchestrator.start();

    let state = Arc::new(AppState::new(orchestrator.clone(), dir.path()));
    Harness {
        app: build_app(state),
        orchestrator,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(OrchestratorConfig::default())
}

async fn request(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let req = match body {
        Some(v) => builder.body(Body::from(serde_json::to_vec(&v).unwrap())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = tower::ServiceExt::oneshot(app.clone(), req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn poll_terminal(app: &Router, run_id: &str) -> Value {
    for _ in 0..400 {
        let (status, body) = request(app, "GET", &format!("/runs/{run_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let state = body["state"].as_str().unwrap().to_string();
        if state != "queued" && state != "running" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {run_id} never reached a terminal state");
}

// ---------------------------------------------------------------------------
// 1. Canonical full run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn canonical_full_run_succeeds() {
    let h = harness();

    let (status, compiled) = request(
        &h.app,
        "POST",
        "/workflows/compile",
        Some(json!({ "glyph": FULL_GLYPH })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(compiled["ok"], true);
    let tasks: Vec<&str> = compiled["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_str().unwrap())
        .collect();
    assert_eq!(tasks.first(), Some(&"00_verify"));
    assert_eq!(tasks.last(), Some(&"09_continuum"));
    assert_eq!(tasks.len(), 10);

    let (status, created) =
        request(&h.app, "POST", "/runs", Some(json!({ "glyph": FULL_GLYPH }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["state"], "queued");
    assert_eq!(created["tenant"], "public");
    assert_eq!(created["dag_digest"], compiled["dag_digest"]);

    let done = poll_terminal(&h.app, created["run_id"].as_str().unwrap()).await;
    assert_eq!(done["state"], "succeeded");
    assert_eq!(done["receipts"].as_array().unwrap().len(), 10);
    assert_ne!(done["head"].as_str().unwrap(), ZERO_DIGEST);

    h.orchestrator.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Invalid order rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_order_is_rejected_with_400() {
    let h = harness();

    let (status, body) = request(
        &h.app,
        "POST",
        "/workflows/compile",
        Some(json!({ "glyph": "deploy; verify" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = request(
        &h.app,
        "POST",
        "/runs",
        Some(json!({ "glyph": "deploy; verify" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.orchestrator.queue_len(), 0, "no run may be created");

    h.orchestrator.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. Missing plugin
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_plugin_fails_the_run() {
    let h = harness();
    let mut sub = h.orchestrator.bus().subscribe();

    let mut dag = gwo_core::Dag::default();
    dag.insert_task(gwo_core::Task::new("00_bogus", "core.bogus"))
        .unwrap();
    let run = h.orchestrator.submit_dag(dag, "public", 5).await.unwrap();

    let done = poll_terminal(&h.app, &run.run_id.to_string()).await;
    assert_eq!(done["state"], "failed");
    let receipts = done["receipts"].as_array().unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0]["ok"], false);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut saw_start = false;
    let mut saw_failed_done = false;
    let mut saw_ok_step = false;
    while let Some(ev) = sub.try_recv() {
        let v = serde_json::to_value(&ev).unwrap();
        match v["type"].as_str().unwrap() {
            "run_start" => saw_start = true,
            "step" if v["ok"] == true => saw_ok_step = true,
            "run_done" if v["ok"] == false => saw_failed_done = true,
            _ => {}
        }
    }
    assert!(saw_start);
    assert!(saw_failed_done);
    assert!(!saw_ok_step, "no successful step for the bad task");

    h.orchestrator.shutdown().await;
}

// ---------------------------------------------------------------------------
// 4. Quota enforcement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrency_quota_serializes_tenant_runs() {
    let mut cfg = OrchestratorConfig::default();
    cfg.tenants.insert(
        "t".into(),
        Quota {
            max_concurrent: 1,
            per_minute: 1000,
        },
    );
    let h = harness_with(cfg);

    let (_, first) = request(
        &h.app,
        "POST",
        "/runs",
        Some(json!({ "glyph": FULL_GLYPH, "tenant": "t" })),
    )
    .await;
    let (_, second) = request(
        &h.app,
        "POST",
        "/runs",
        Some(json!({ "glyph": FULL_GLYPH, "tenant": "t" })),
    )
    .await;

    let admission = h.orchestrator.admission();
    let watcher = tokio::spawn(async move {
        let mut max_seen = 0;
        for _ in 0..200 {
            max_seen = max_seen.max(admission.running("t"));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        max_seen
    });

    let done1 = poll_terminal(&h.app, first["run_id"].as_str().unwrap()).await;
    let done2 = poll_terminal(&h.app, second["run_id"].as_str().unwrap()).await;
    assert_eq!(done1["state"], "succeeded");
    assert_eq!(done2["state"], "succeeded");
    assert!(watcher.await.unwrap() <= 1, "tenant cap exceeded");

    h.orchestrator.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. Merkle proof round trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn audit_proof_round_trip_over_http() {
    let h = harness();

    // Generate some audit lines.
    for _ in 0..3 {
        let (status, _) = request(
            &h.app,
            "POST",
            "/workflows/compile",
            Some(json!({ "glyph": "verify; invoke" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, proof) = request(&h.app, "GET", "/audit/proof?index=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(proof["index"], 1);

    let (status, verified) = request(
        &h.app,
        "POST",
        "/audit/verify",
        Some(json!({
            "root": proof["root"],
            "index": proof["index"],
            "line": proof["line"],
            "path": proof["path"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verified["ok"], true);

    // One flipped character in the line breaks inclusion.
    let mut line = proof["line"].as_str().unwrap().to_string();
    let flipped = if line.ends_with('}') {
        line.pop();
        format!("{line} }}")
    } else {
        format!("{line}x")
    };
    let (_, verified) = request(
        &h.app,
        "POST",
        "/audit/verify",
        Some(json!({
            "root": proof["root"],
            "index": proof["index"],
            "line": flipped,
            "path": proof["path"],
        })),
    )
    .await;
    assert_eq!(verified["ok"], false);

    let (status, _) = request(&h.app, "GET", "/audit/proof?index=9999", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    h.orchestrator.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. Rollback signing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn breached_budget_emits_verifiable_rollback_proof() {
    let mut cfg = OrchestratorConfig::default();
    cfg.rollout = RolloutBudget {
        error_budget: 0.05,
        min_requests: 200,
    };
    let h = harness_with(cfg);

    let (status, _) = request(
        &h.app,
        "POST",
        "/metrics/push",
        Some(json!({ "requests": 300, "errors": 30, "window_s": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, evaluated) = request(
        &h.app,
        "POST",
        "/rollout/evaluate",
        Some(json!({ "manifest_hash": "m".repeat(64) })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(evaluated["verdict"], "rollback");
    let rate = evaluated["error_rate"].as_f64().unwrap();
    assert!((rate - 0.10).abs() < 1e-9);

    let raw = std::fs::read(h._dir.path().join("rollback").join("proof.json")).unwrap();
    let proof: gwo_rollout::RollbackProof = serde_json::from_slice(&raw).unwrap();

    let keyring = h.orchestrator.keyring();
    let mut ring = keyring.read().unwrap().clone();
    assert!(proof.verify(&ring), "proof must verify under the active key");

    ring.install(Key {
        key_id: "other".into(),
        algorithm: KeyAlgorithm::HmacSha256,
        secret: "not-the-signer".into(),
        status: KeyStatus::Rotated,
        created_ts: chrono::Utc::now(),
        rotated_ts: None,
    });
    assert!(
        !proof.verify_with_key(&ring, "other"),
        "proof must fail under any other key id"
    );

    h.orchestrator.shutdown().await;
}

// ---------------------------------------------------------------------------
// Supplemented surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn high_risk_submission_gains_safety_steps() {
    let h = harness();

    let (status, created) = request(
        &h.app,
        "POST",
        "/runs",
        Some(json!({ "glyph": "verify", "risk": "high" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let done = poll_terminal(&h.app, created["run_id"].as_str().unwrap()).await;
    assert_eq!(done["state"], "succeeded");
    let tasks: Vec<&str> = done["receipts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["task"].as_str().unwrap())
        .collect();
    for step in ["scan", "attest", "sanctify", "judge"] {
        assert!(
            tasks.iter().any(|t| t.ends_with(step)),
            "missing forced safety step {step} in {tasks:?}"
        );
    }

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn rollout_evaluate_reports_canary_state() {
    let mut cfg = OrchestratorConfig::default();
    cfg.rollout = RolloutBudget {
        error_budget: 0.05,
        min_requests: 200,
    };
    let h = harness_with(cfg);

    let (_, _) = request(
        &h.app,
        "POST",
        "/metrics/push",
        Some(json!({ "requests": 1000, "errors": 1, "window_s": 60 })),
    )
    .await;
    let (_, healthy) = request(&h.app, "POST", "/rollout/evaluate", Some(json!({}))).await;
    assert_eq!(healthy["verdict"], "proceed");
    assert_eq!(healthy["canary"], "canary");

    let (_, _) = request(
        &h.app,
        "POST",
        "/metrics/push",
        Some(json!({ "requests": 1000, "errors": 500, "window_s": 60 })),
    )
    .await;
    let (_, breached) = request(&h.app, "POST", "/rollout/evaluate", Some(json!({}))).await;
    assert_eq!(breached["verdict"], "rollback");
    assert_eq!(breached["canary"], "rolled_back");

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn canary_lifecycle_advances_and_completes() {
    let h = harness();

    // Nothing to advance or complete before the canary begins.
    let (status, _) = request(&h.app, "POST", "/rollout/advance", Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, _) = request(
        &h.app,
        "POST",
        "/metrics/push",
        Some(json!({ "requests": 1000, "errors": 1, "window_s": 60 })),
    )
    .await;
    let (_, evaluated) = request(&h.app, "POST", "/rollout/evaluate", Some(json!({}))).await;
    assert_eq!(evaluated["canary"], "canary");

    let (status, advanced) = request(&h.app, "POST", "/rollout/advance", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(advanced["canary"], "advancing");

    // A clean evaluation settles the advance step back to canary.
    let (_, settled) = request(&h.app, "POST", "/rollout/evaluate", Some(json!({}))).await;
    assert_eq!(settled["canary"], "canary");

    let (status, completed) =
        request(&h.app, "POST", "/rollout/complete", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(completed["canary"], "complete");

    // Complete is terminal for the tracked deployment.
    let (status, _) = request(&h.app, "POST", "/rollout/advance", Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn healthz_and_tenants_report_configuration() {
    let mut cfg = OrchestratorConfig::default();
    cfg.tenants.insert(
        "acme".into(),
        Quota {
            max_concurrent: 4,
            per_minute: 120,
        },
    );
    let h = harness_with(cfg);

    let (status, health) = request(&h.app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["ok"], true);
    assert_eq!(health["queue_backend"], "memory");

    let (status, tenants) = request(&h.app, "GET", "/tenants", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tenants["tenants"]["acme"]["max_concurrent"], 4);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn events_tail_reports_run_lifecycle() {
    let h = harness();
    let (_, created) =
        request(&h.app, "POST", "/runs", Some(json!({ "glyph": "verify" }))).await;
    poll_terminal(&h.app, created["run_id"].as_str().unwrap()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (status, tail) = request(&h.app, "GET", "/events/tail?n=50", None).await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = tail
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["type"].as_str().unwrap())
        .collect();
    assert!(types.contains(&"run_enqueued"));
    assert!(types.contains(&"run_start"));
    assert!(types.contains(&"step"));
    assert!(types.contains(&"run_done"));

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn cancel_routes_map_states_to_statuses() {
    let h = harness();

    let bogus = uuid::Uuid::new_v4();
    let (status, _) = request(&h.app, "POST", &format!("/runs/{bogus}/cancel"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, created) =
        request(&h.app, "POST", "/runs", Some(json!({ "glyph": "verify" }))).await;
    let run_id = created["run_id"].as_str().unwrap().to_string();
    poll_terminal(&h.app, &run_id).await;

    let (status, _) = request(&h.app, "POST", &format!("/runs/{run_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn key_rotation_appends_ledger_and_keeps_old_signatures_valid() {
    let h = harness();

    let payload = b"signed-before-rotation";
    let envelope = {
        let keyring = h.orchestrator.keyring();
        let ring = keyring.read().unwrap();
        ring.sign(payload).unwrap()
    };

    let (status, rotated) = request(&h.app, "POST", "/keys/rotate", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let new_kid = rotated["kid"].as_str().unwrap().to_string();
    assert_ne!(new_kid, envelope.key_id);

    let (status, last) = request(&h.app, "GET", "/keys/verify", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(last["last"]["kid"].as_str().unwrap(), new_kid);

    // Historical key still verifies when named explicitly.
    let keyring = h.orchestrator.keyring();
    let ring = keyring.read().unwrap();
    assert!(ring.verify(payload, &envelope.sig, Some(&envelope.key_id)));
    assert!(ring.verify(payload, &envelope.sig, None));

    let (status, keys) = request(&h.app, "GET", "/keys", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(keys["active_hmac"].as_str().unwrap(), new_kid);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn signed_endpoints_enforce_hmac_when_required() {
    let mut cfg = OrchestratorConfig::default();
    cfg.keys.require_signatures = true;
    let h = harness_with(cfg);

    let body = json!({ "glyph": "verify" });
    let (status, err) = request(&h.app, "POST", "/runs", Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(err["error"].is_string());

    // Sign the exact body bytes with the active key.
    let bytes = serde_json::to_vec(&body).unwrap();
    let envelope = {
        let keyring = h.orchestrator.keyring();
        let ring = keyring.read().unwrap();
        ring.sign(&bytes).unwrap()
    };
    let req = Request::builder()
        .method("POST")
        .uri("/runs")
        .header("content-type", "application/json")
        .header("X-Codex-KeyId", &envelope.key_id)
        .header("X-Codex-Sig", &envelope.sig)
        .body(Body::from(bytes))
        .unwrap();
    let resp = tower::ServiceExt::oneshot(h.app.clone(), req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // A tampered signature is still rejected.
    let bytes = serde_json::to_vec(&body).unwrap();
    let req = Request::builder()
        .method("POST")
        .uri("/runs")
        .header("content-type", "application/json")
        .header("X-Codex-KeyId", &envelope.key_id)
        .header("X-Codex-Sig", "AAAA")
        .body(Body::from(bytes))
        .unwrap();
    let resp = tower::ServiceExt::oneshot(h.app.clone(), req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn judge_verdict_returns_signed_envelope() {
    let h = harness();
    let (status, body) = request(
        &h.app,
        "POST",
        "/judge/verdict",
        Some(json!({
            "manifest_hash": "a".repeat(64),
            "metrics": { "requests": 300, "errors": 3, "window_s": 60 },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let jwp: gwo_rollout::JudgeEnvelope = serde_json::from_value(body["jwp"].clone()).unwrap();

    let keyring = h.orchestrator.keyring();
    let ring = keyring.read().unwrap();
    assert!(jwp.verify(&ring));

    h.orchestrator.shutdown().await;
}
