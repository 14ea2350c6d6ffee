// SPDX-License-Identifier: MIT OR Apache-2.0
//! gwo-plugins
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Plugin handlers and task runners. A *handler* is the pure unit of work
//! registered under a plugin name; a *runner* is the execution strategy
//! that invokes it (in-process call, sandboxed subprocess, or signed HTTP
//! webhook). Handlers never touch run state: they take inputs and return
//! an output or an error, nothing else.

/// Name → handler map and the built-in `core.*` handlers.
pub mod registry;
/// Runner trait and the three execution strategies.
pub mod runner;

pub use registry::{Handler, HandlerError, PluginRegistry, register_core_handlers};
pub use runner::{
    HttpRunner, InProcessRunner, MISSING_PLUGIN, Runner, RunnerOutcome, RunnerRouter,
    RunnerStatus, SandboxRunner,
};
