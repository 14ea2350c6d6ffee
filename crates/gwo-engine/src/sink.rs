// SPDX-License-Identifier: MIT OR Apache-2.0
//! Best-effort event sinks: the signed webhook and the chain export file.

use gwo_core::{Event, canonical_json, sha256_hex};
use gwo_keyring::{HEADER_KEY_ID, HEADER_SIG, Keyring};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default webhook delivery timeout.
const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(3);

/// Delivers engine events to a configured URL with an HMAC-signed body.
///
/// Delivery is fire-and-forget: a failure is reported, never propagated,
/// and never blocks the engine.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    keyring: Arc<RwLock<Keyring>>,
    timeout: Duration,
}

impl WebhookSink {
    /// Create a sink posting to `url`.
    pub fn new(
        url: impl Into<String>,
        keyring: Arc<RwLock<Keyring>>,
        timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            keyring,
            timeout: timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT),
        }
    }

    /// POST one event. Returns whether the sink accepted it.
    pub async fn deliver(&self, event: &Event) -> bool {
        let Ok(body) = canonical_json(event) else {
            return false;
        };
        let envelope = {
            let ring = match self.keyring.read() {
                Ok(r) => r,
                Err(_) => return false,
            };
            match ring.sign(&body) {
                Ok(env) => env,
                Err(e) => {
                    debug!(error = %e, "webhook sink has no signing key");
                    return false;
                }
            }
        };

        let sent = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header(HEADER_KEY_ID, &envelope.key_id)
            .header(HEADER_SIG, &envelope.sig)
            .timeout(self.timeout)
            .body(body)
            .send()
            .await;

        match sent {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, url = %self.url, "webhook delivery failed");
                false
            }
        }
    }
}

/// One exported head transition.
#[derive(Debug, Serialize)]
struct ChainLine<'a> {
    prev: &'a str,
    current: &'a str,
    meta: ChainMeta<'a>,
}

#[derive(Debug, Serialize)]
struct ChainMeta<'a> {
    run_id: &'a str,
    task: &'a str,
}

/// Appends `{prev, current, meta}` lines as a run's head advances.
pub struct ChainExporter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ChainExporter {
    /// Create an exporter writing to `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Append one head transition. Best-effort; failures are reported but
    /// never fail the run.
    pub fn export(&self, prev: &str, current: &str, run_id: &str, task: &str) {
        use std::io::Write;
        let line = ChainLine {
            prev,
            current,
            meta: ChainMeta { run_id, task },
        };
        let Ok(line) = serde_json::to_string(&line) else {
            return;
        };
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let opened = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path);
        match opened {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{line}") {
                    debug!(error = %e, "chain export write failed");
                }
            }
            Err(e) => debug!(error = %e, path = %self.path.display(), "chain export open failed"),
        }
    }

    /// Line count currently exported (test hook).
    #[must_use]
    pub fn len(&self) -> usize {
        std::fs::read_to_string(&self.path)
            .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0)
    }

    /// `true` when nothing has been exported yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Digest helper for runner outputs: canonical bytes of the value, or the
/// zero digest when the attempt produced none.
#[must_use]
pub fn output_digest(output: Option<&serde_json::Value>) -> String {
    match output {
        Some(v) => canonical_json(v)
            .map(|b| sha256_hex(&b))
            .unwrap_or_else(|_| gwo_core::ZERO_DIGEST.to_string()),
        None => gwo_core::ZERO_DIGEST.to_string(),
    }
}
