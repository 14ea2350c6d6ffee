// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use gwo_config::OrchestratorConfig;
use gwo_daemon::{AppState, build_app};
use gwo_engine::Orchestrator;
use gwo_keyring::{KeyAlgorithm, Keyring};
use gwo_plugins::{HttpRunner, PluginRegistry, RunnerRouter, SandboxRunner, register_core_handlers};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gwo-daemon", version, about = "Glyph workflow orchestrator daemon")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8807")]
    bind: String,

    /// Path to the TOML configuration file. Missing file means defaults.
    #[arg(long, default_value = "gwo.toml")]
    config: PathBuf,

    /// Directory for rollout/rollback state files.
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,

    /// Container image for the sandbox runner (enables it).
    #[arg(long)]
    sandbox_image: Option<String>,

    /// Container runtime binary for the sandbox runner.
    #[arg(long, default_value = "docker")]
    sandbox_bin: String,

    /// Webhook endpoint for the HTTP runner (enables it).
    #[arg(long)]
    runner_url: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("gwo=debug,gwo_daemon=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gwo=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = if args.config.exists() {
        OrchestratorConfig::load(&args.config)
            .with_context(|| format!("load config {}", args.config.display()))?
    } else {
        info!(path = %args.config.display(), "no config file, using defaults");
        OrchestratorConfig::default()
    };

    let keyring = Arc::new(RwLock::new(bootstrap_keyring(&cfg)?));

    let mut registry = PluginRegistry::new();
    register_core_handlers(&mut registry);
    let mut router = RunnerRouter::new(Arc::new(registry));
    if let Some(image) = &args.sandbox_image {
        router = router.with_sandbox(SandboxRunner::new(&args.sandbox_bin, image));
    }
    if let Some(url) = &args.runner_url {
        // The runner signs with a snapshot; rotation is picked up on restart.
        let snapshot = keyring
            .read()
            .map_err(|_| anyhow::anyhow!("keyring lock poisoned"))?
            .clone();
        router = router.with_http(HttpRunner::new(url, Arc::new(snapshot)));
    }

    let orchestrator = Orchestrator::new(cfg, Arc::new(router), keyring)
        .context("build orchestrator")?;
    orchestrator.start();

    let state = Arc::new(AppState::new(orchestrator.clone(), &args.state_dir));
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "gwo-daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("termination signal received");
        })
        .await
        .context("serve")?;

    // Workers stop fetching, finish in-flight tasks, then exit.
    orchestrator.shutdown().await;
    Ok(())
}

/// Load the persisted keyring, or bootstrap one with a fresh active HMAC
/// key (honoring `GWO_HMAC_KEY` when set) and persist it.
fn bootstrap_keyring(cfg: &OrchestratorConfig) -> Result<Keyring> {
    if cfg.keys.path.exists() {
        return Keyring::load(&cfg.keys.path)
            .with_context(|| format!("load keyring {}", cfg.keys.path.display()));
    }
    let mut ring = match std::env::var("GWO_HMAC_KEY") {
        Ok(secret) if !secret.is_empty() => Keyring::with_hmac_key("key-bootstrap", secret),
        _ => {
            let mut ring = Keyring::new();
            ring.generate(KeyAlgorithm::HmacSha256);
            ring
        }
    };
    ring.generate(KeyAlgorithm::Ed25519);
    ring.save(&cfg.keys.path)
        .with_context(|| format!("persist keyring {}", cfg.keys.path.display()))?;
    info!(path = %cfg.keys.path.display(), "bootstrapped keyring");
    Ok(ring)
}
