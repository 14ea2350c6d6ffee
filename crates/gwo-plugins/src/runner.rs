// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runner trait and the three execution strategies.
//!
//! A runner turns a [`Task`] into an outcome of `ok | err | timeout` plus
//! the output to digest. The in-process runner calls the registered
//! handler directly; the sandbox runner executes a command inside a
//! network-less container with dropped capabilities; the HTTP runner POSTs
//! the task to a webhook over TLS with an HMAC-signed body. Which strategy
//! a task uses is configuration (`runner` input key), defaulting to
//! in-process.

use crate::registry::PluginRegistry;
use async_trait::async_trait;
use gwo_core::{Task, canonical_json};
use gwo_keyring::{HEADER_KEY_ID, HEADER_SIG, Keyring};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Machine code for a task whose plugin has no registered handler.
pub const MISSING_PLUGIN: &str = "missing_plugin";

/// Machine code for a task routed to a runner that is not configured.
pub const RUNNER_UNAVAILABLE: &str = "runner_unavailable";

/// Terminal status of one runner attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    /// The attempt completed successfully.
    Ok,
    /// The attempt failed.
    Err,
    /// The attempt exceeded the task's timeout.
    Timeout,
}

/// What one runner attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerOutcome {
    /// Terminal status.
    pub status: RunnerStatus,
    /// Output value, present on success.
    pub output: Option<Value>,
    /// Brief machine code, present on failure.
    pub error: Option<String>,
    /// Captured log bytes (stdout of sandboxed commands, etc).
    pub log: Vec<u8>,
}

impl RunnerOutcome {
    /// Successful outcome with an output value.
    #[must_use]
    pub fn ok(output: Value) -> Self {
        Self {
            status: RunnerStatus::Ok,
            output: Some(output),
            error: None,
            log: Vec::new(),
        }
    }

    /// Failed outcome with a machine code.
    pub fn err(code: impl Into<String>) -> Self {
        Self {
            status: RunnerStatus::Err,
            output: None,
            error: Some(code.into()),
            log: Vec::new(),
        }
    }

    /// Timed-out outcome.
    #[must_use]
    pub fn timeout() -> Self {
        Self {
            status: RunnerStatus::Timeout,
            output: None,
            error: Some("runner_timeout".into()),
            log: Vec::new(),
        }
    }

    /// `true` for [`RunnerStatus::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == RunnerStatus::Ok
    }

    /// `true` when the failure is a missing plugin (not retryable).
    #[must_use]
    pub fn is_missing_plugin(&self) -> bool {
        self.error.as_deref() == Some(MISSING_PLUGIN)
    }
}

/// Execution strategy for a task.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Execute one attempt of `task` under its timeout.
    async fn run(&self, task: &Task) -> RunnerOutcome;
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Direct call into the registered handler.
pub struct InProcessRunner {
    registry: Arc<PluginRegistry>,
}

impl InProcessRunner {
    /// Create a runner over the given registry.
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Runner for InProcessRunner {
    async fn run(&self, task: &Task) -> RunnerOutcome {
        let Some(handler) = self.registry.get(&task.plugin) else {
            return RunnerOutcome::err(MISSING_PLUGIN);
        };
        match tokio::time::timeout(task.timeout(), handler.call(&task.inputs)).await {
            Ok(Ok(output)) => RunnerOutcome::ok(output),
            Ok(Err(e)) => RunnerOutcome::err(e.code),
            Err(_) => RunnerOutcome::timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Container-isolated execution: no network, all capabilities dropped, no
/// privilege escalation, killed at the task timeout.
///
/// The task's `cmd` input (array of strings) is the command to run inside
/// the container. Without a container runtime on the host the runner fails
/// rather than degrade isolation.
pub struct SandboxRunner {
    container_bin: String,
    image: String,
}

impl SandboxRunner {
    /// Create a sandbox runner using `container_bin` (`docker` or
    /// `podman`) and the given image.
    pub fn new(container_bin: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            container_bin: container_bin.into(),
            image: image.into(),
        }
    }
}

#[async_trait]
impl Runner for SandboxRunner {
    async fn run(&self, task: &Task) -> RunnerOutcome {
        let cmd: Option<Vec<String>> = task
            .inputs
            .get("cmd")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let Some(cmd) = cmd else {
            return RunnerOutcome::err("sandbox_missing_cmd");
        };

        let mut command = tokio::process::Command::new(&self.container_bin);
        command
            .arg("run")
            .arg("--rm")
            .args(["--network", "none"])
            .args(["--cap-drop", "ALL"])
            .args(["--security-opt", "no-new-privileges"])
            .arg(&self.image)
            .args(&cmd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, bin = %self.container_bin, "container runtime unavailable");
                return RunnerOutcome::err("sandbox_unavailable");
            }
        };

        match tokio::time::timeout(task.timeout(), child.wait_with_output()).await {
            Ok(Ok(out)) if out.status.success() => {
                let mut outcome = RunnerOutcome::ok(serde_json::json!({ "exit_code": 0 }));
                outcome.log = out.stdout;
                outcome
            }
            Ok(Ok(out)) => {
                let code = out.status.code().unwrap_or(-1);
                let mut outcome = RunnerOutcome::err(format!("sandbox_exit_{code}"));
                outcome.log = out.stderr;
                outcome
            }
            Ok(Err(_)) => RunnerOutcome::err("sandbox_wait_failed"),
            // kill_on_drop reaps the container when the future is dropped.
            Err(_) => RunnerOutcome::timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP webhook
// ---------------------------------------------------------------------------

/// Signed HTTP webhook execution.
///
/// The task is POSTed as canonical JSON with `X-Codex-KeyId` /
/// `X-Codex-Sig` headers (active HMAC key). TLS is required; plain HTTP is
/// only accepted when explicitly opted into (tests).
pub struct HttpRunner {
    client: reqwest::Client,
    endpoint: String,
    keyring: Arc<Keyring>,
    allow_insecure: bool,
}

impl HttpRunner {
    /// Create a webhook runner targeting `endpoint`.
    pub fn new(endpoint: impl Into<String>, keyring: Arc<Keyring>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            keyring,
            allow_insecure: false,
        }
    }

    /// Permit non-TLS endpoints. Test hook; production endpoints are
    /// `https`.
    #[must_use]
    pub fn allow_insecure(mut self) -> Self {
        self.allow_insecure = true;
        self
    }
}

#[async_trait]
impl Runner for HttpRunner {
    async fn run(&self, task: &Task) -> RunnerOutcome {
        if !self.allow_insecure && !self.endpoint.starts_with("https://") {
            return RunnerOutcome::err("http_tls_required");
        }

        let body = match canonical_json(&serde_json::json!({
            "task": task.name,
            "plugin": task.plugin,
            "inputs": task.inputs,
        })) {
            Ok(b) => b,
            Err(_) => return RunnerOutcome::err("http_body_encode"),
        };

        let envelope = match self.keyring.sign(&body) {
            Ok(env) => env,
            Err(_) => return RunnerOutcome::err("http_no_active_key"),
        };

        let request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header(HEADER_KEY_ID, &envelope.key_id)
            .header(HEADER_SIG, &envelope.sig)
            .timeout(task.timeout())
            .body(body);

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                let output = resp.json::<Value>().await.unwrap_or(Value::Null);
                RunnerOutcome::ok(output)
            }
            Ok(resp) => RunnerOutcome::err(format!("http_status_{}", resp.status().as_u16())),
            Err(e) if e.is_timeout() => RunnerOutcome::timeout(),
            Err(_) => RunnerOutcome::err("http_send_failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Dispatches each task to its configured strategy.
///
/// The `runner` input key selects `in_process` (default), `sandbox`, or
/// `http`; a task routed to an unconfigured strategy fails with
/// [`RUNNER_UNAVAILABLE`].
pub struct RunnerRouter {
    in_process: InProcessRunner,
    sandbox: Option<SandboxRunner>,
    http: Option<HttpRunner>,
}

impl RunnerRouter {
    /// Create a router with only the in-process strategy.
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            in_process: InProcessRunner::new(registry),
            sandbox: None,
            http: None,
        }
    }

    /// Attach a sandbox strategy.
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: SandboxRunner) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Attach an HTTP webhook strategy.
    #[must_use]
    pub fn with_http(mut self, http: HttpRunner) -> Self {
        self.http = Some(http);
        self
    }
}

#[async_trait]
impl Runner for RunnerRouter {
    async fn run(&self, task: &Task) -> RunnerOutcome {
        let choice = task
            .inputs
            .get("runner")
            .and_then(Value::as_str)
            .unwrap_or("in_process");
        match choice {
            "in_process" => self.in_process.run(task).await,
            "sandbox" => match &self.sandbox {
                Some(r) => r.run(task).await,
                None => RunnerOutcome::err(RUNNER_UNAVAILABLE),
            },
            "http" => match &self.http {
                Some(r) => r.run(task).await,
                None => RunnerOutcome::err(RUNNER_UNAVAILABLE),
            },
            _ => RunnerOutcome::err(RUNNER_UNAVAILABLE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandlerError, register_core_handlers};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn core_registry() -> Arc<PluginRegistry> {
        let mut r = PluginRegistry::new();
        register_core_handlers(&mut r);
        Arc::new(r)
    }

    #[tokio::test]
    async fn in_process_runs_registered_handler() {
        let runner = InProcessRunner::new(core_registry());
        let task = Task::new("00_verify", "core.verify");
        let out = runner.run(&task).await;
        assert!(out.is_ok());
        assert_eq!(out.output, Some(serde_json::json!({ "verified": true })));
    }

    #[tokio::test]
    async fn in_process_reports_missing_plugin() {
        let runner = InProcessRunner::new(core_registry());
        let task = Task::new("00_bogus", "core.bogus");
        let out = runner.run(&task).await;
        assert_eq!(out.status, RunnerStatus::Err);
        assert!(out.is_missing_plugin());
    }

    #[tokio::test]
    async fn in_process_maps_handler_error() {
        let mut r = PluginRegistry::new();
        r.register_fn("core.broken", |_| Err(HandlerError::new("exploded")));
        let runner = InProcessRunner::new(Arc::new(r));
        let out = runner.run(&Task::new("t", "core.broken")).await;
        assert_eq!(out.status, RunnerStatus::Err);
        assert_eq!(out.error.as_deref(), Some("exploded"));
    }

    #[tokio::test]
    async fn in_process_times_out_slow_handler() {
        struct Slow;
        #[async_trait]
        impl crate::registry::Handler for Slow {
            async fn call(
                &self,
                _inputs: &crate::registry::Inputs,
            ) -> Result<Value, HandlerError> {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(Value::Null)
            }
        }
        let mut r = PluginRegistry::new();
        r.register("core.slow", Slow);
        let runner = InProcessRunner::new(Arc::new(r));
        let mut task = Task::new("t", "core.slow");
        task.timeout_ms = 20;
        let out = runner.run(&task).await;
        assert_eq!(out.status, RunnerStatus::Timeout);
    }

    #[tokio::test]
    async fn http_runner_signs_body_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "handled": true
            })))
            .mount(&server)
            .await;

        let keyring = Arc::new(Keyring::with_hmac_key("k1", "dev-hmac"));
        let runner =
            HttpRunner::new(format!("{}/hook", server.uri()), keyring.clone()).allow_insecure();
        let out = runner.run(&Task::new("00_verify", "core.verify")).await;
        assert!(out.is_ok());
        assert_eq!(out.output, Some(serde_json::json!({ "handled": true })));

        let requests = server.received_requests().await.unwrap();
        let req = &requests[0];
        let sig = req.headers.get(HEADER_SIG).unwrap().to_str().unwrap();
        let kid = req.headers.get(HEADER_KEY_ID).unwrap().to_str().unwrap();
        assert_eq!(kid, "k1");
        assert!(keyring.verify(&req.body, sig, Some(kid)));
    }

    #[tokio::test]
    async fn http_runner_maps_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let keyring = Arc::new(Keyring::with_hmac_key("k1", "dev-hmac"));
        let runner = HttpRunner::new(server.uri(), keyring).allow_insecure();
        let out = runner.run(&Task::new("t", "core.verify")).await;
        assert_eq!(out.status, RunnerStatus::Err);
        assert_eq!(out.error.as_deref(), Some("http_status_500"));
    }

    #[tokio::test]
    async fn http_runner_requires_tls_by_default() {
        let keyring = Arc::new(Keyring::with_hmac_key("k1", "dev-hmac"));
        let runner = HttpRunner::new("http://plain.example/hook", keyring);
        let out = runner.run(&Task::new("t", "core.verify")).await;
        assert_eq!(out.error.as_deref(), Some("http_tls_required"));
    }

    #[tokio::test]
    async fn router_defaults_to_in_process() {
        let router = RunnerRouter::new(core_registry());
        let out = router.run(&Task::new("00_verify", "core.verify")).await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn router_rejects_unconfigured_strategy() {
        let router = RunnerRouter::new(core_registry());
        let mut task = Task::new("t", "core.verify");
        task.inputs
            .insert("runner".into(), serde_json::json!("http"));
        let out = router.run(&task).await;
        assert_eq!(out.error.as_deref(), Some(RUNNER_UNAVAILABLE));
    }

    #[tokio::test]
    async fn sandbox_without_cmd_fails_cleanly() {
        let runner = SandboxRunner::new("definitely-not-a-container-bin", "scratch");
        let out = runner.run(&Task::new("t", "core.verify")).await;
        assert_eq!(out.error.as_deref(), Some("sandbox_missing_cmd"));
    }

    #[tokio::test]
    async fn sandbox_without_runtime_fails_cleanly() {
        let runner = SandboxRunner::new("definitely-not-a-container-bin", "scratch");
        let mut task = Task::new("t", "core.verify");
        task.inputs
            .insert("cmd".into(), serde_json::json!(["true"]));
        let out = runner.run(&task).await;
        assert_eq!(out.error.as_deref(), Some("sandbox_unavailable"));
    }
}
