// SPDX-License-Identifier: MIT OR Apache-2.0
//! gwo-audit
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Tamper-evident audit trail: an append-only line-delimited JSON log whose
//! lines are never rewritten, plus Merkle inclusion proofs over the hashes
//! of those lines.

/// The append-only audit log file.
pub mod log;
/// Merkle root, proof paths, and inclusion verification.
pub mod merkle;

pub use log::{AuditError, AuditLog, AuditProof};
pub use merkle::{Pos, ProofStep, merkle_root, proof_path, verify_inclusion};
