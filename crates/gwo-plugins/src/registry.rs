// SPDX-License-Identifier: MIT OR Apache-2.0
//! Name → handler map with the built-in `core.*` handlers.

use async_trait::async_trait;
use gwo_core::sha256_hex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A handler's inputs: the task's opaque key → value map.
pub type Inputs = BTreeMap<String, Value>;

/// Failure from inside a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler failed: {code}")]
pub struct HandlerError {
    /// Brief machine code (lands in the receipt's `error` field).
    pub code: String,
}

impl HandlerError {
    /// Create an error with the given machine code.
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

/// One registered unit of work.
///
/// Handlers are pure with respect to run state: they read their inputs and
/// return an output value. Chain, queue, and bus mutations belong to the
/// engine.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Execute against the task's inputs.
    async fn call(&self, inputs: &Inputs) -> Result<Value, HandlerError>;
}

/// Adapter so plain synchronous closures can register as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&Inputs) -> Result<Value, HandlerError> + Send + Sync,
{
    async fn call(&self, inputs: &Inputs) -> Result<Value, HandlerError> {
        (self.0)(inputs)
    }
}

/// Typed registry of named handlers.
#[derive(Default)]
pub struct PluginRegistry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Register a synchronous closure under `name`.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Inputs) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(name, FnHandler(f));
    }

    /// Look up a handler by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    /// Whether a handler is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Sorted list of registered names.
    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Register the built-in handler for every canonical step.
pub fn register_core_handlers(registry: &mut PluginRegistry) {
    registry.register_fn("core.verify", |_| Ok(json!({ "verified": true })));

    registry.register_fn("core.invoke", |inputs| {
        let url = inputs
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("https://example");
        Ok(json!({ "invoked": url }))
    });

    registry.register_fn("core.audit", |_| Ok(json!({ "sbom": "cyclonedx-1.5" })));

    registry.register_fn("core.scan", |_| Ok(json!({ "vulns": 0 })));

    registry.register_fn("core.attest", |inputs| {
        let payload = inputs
            .get("payload")
            .and_then(Value::as_str)
            .unwrap_or("{}");
        Ok(json!({ "attestation": format!("sha256:{}", sha256_hex(payload.as_bytes())) }))
    });

    registry.register_fn("core.sanctify", |_| Ok(json!({ "policy": "pass" })));

    registry.register_fn("core.rollout", |inputs| {
        let percent = inputs
            .get("percent")
            .and_then(Value::as_i64)
            .unwrap_or(10)
            .clamp(0, 100);
        Ok(json!({ "rolled": percent }))
    });

    registry.register_fn("core.judge", |_| Ok(json!({ "gate": "allow" })));

    registry.register_fn("core.deploy", |inputs| {
        let target = inputs
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or("staging");
        Ok(json!({ "target": target, "status": "ok" }))
    });

    registry.register_fn("core.continuum", |_| Ok(json!({ "closing": true })));
}
