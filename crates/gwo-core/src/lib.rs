// SPDX-License-Identifier: MIT OR Apache-2.0
//! gwo-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the glyph workflow orchestrator.
//!
//! Everything downstream of the compiler speaks in the types defined here:
//! the canonical step alphabet, the typed DAG, run records with their
//! receipt chains, and the event union.

/// Canonical JSON serialization and SHA-256 helpers.
pub mod canonical;
/// Typed tasks, edges, and the DAG with topological sort and digest.
pub mod dag;
/// The event union emitted on the bus, the audit log, and webhooks.
pub mod event;
/// Per-step receipts and their digests.
pub mod receipt;
/// Run records, the run state machine, and the chain head.
pub mod run;
/// The closed, ordered step alphabet.
pub mod step;

pub use canonical::{ZERO_DIGEST, canonical_json, sha256_hex};
pub use dag::{Dag, DagError, Edge, Task};
pub use event::{Event, EventBody};
pub use receipt::StepReceipt;
pub use run::{Run, RunState, chain_head};
pub use step::{CANONICAL_STEPS, Step};

/// Contract version embedded in health responses and wire payloads.
pub const CONTRACT_VERSION: &str = "gwo/v0.1";

/// Tenant assigned to requests that do not name one.
pub const DEFAULT_TENANT: &str = "public";
