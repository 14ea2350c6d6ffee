// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON serialization and digest helpers.
//!
//! Every digest in the system (DAG identity, receipt hashes, chain heads,
//! Merkle leaves) is SHA-256 over *canonical* bytes: compact JSON with
//! object keys in sorted order. `serde_json`'s default map keeps keys
//! sorted, so canonicalization is serialize-to-value then emit compact.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// The all-zero digest used as the chain-head seed.
pub const ZERO_DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Serialize a value to canonical JSON bytes (compact, sorted keys).
///
/// # Errors
///
/// Returns the underlying `serde_json` error if the value cannot be
/// represented as JSON (e.g. a non-string map key).
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    serde_json::to_vec(&v)
}

/// Lowercase hex SHA-256 of the given bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
