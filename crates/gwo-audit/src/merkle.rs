// SPDX-License-Identifier: MIT OR Apache-2.0
//! Merkle root, proof paths, and inclusion verification over byte lines.
//!
//! Leaves are `SHA-256(line)`. Levels pair left-to-right; an odd last hash
//! is paired with itself. The proof for leaf `i` records, per level, the
//! sibling's hash and which side it sits on, which is exactly enough to
//! rebuild the root from the leaf.

use gwo_core::ZERO_DIGEST;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which side of the running node the sibling hash sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pos {
    /// Sibling is the left operand.
    L,
    /// Sibling is the right operand.
    R,
}

/// One level of an inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Side the sibling combines on.
    pub pos: Pos,
    /// Lowercase hex sibling hash.
    pub hash: String,
}

fn h(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn h2(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

fn hex(bytes: &[u8; 32]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(64);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn unhex(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = (hi * 16 + lo) as u8;
    }
    Some(out)
}

fn leaf_hashes<L: AsRef<[u8]>>(lines: &[L]) -> Vec<[u8; 32]> {
    lines.iter().map(|l| h(l.as_ref())).collect()
}

/// Merkle root over the lines, as lowercase hex. Empty input yields the
/// zero digest.
#[must_use]
pub fn merkle_root<L: AsRef<[u8]>>(lines: &[L]) -> String {
    let mut level = leaf_hashes(lines);
    if level.is_empty() {
        return ZERO_DIGEST.to_string();
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let a = &pair[0];
                let b = pair.get(1).unwrap_or(a);
                h2(a, b)
            })
            .collect();
    }
    hex(&level[0])
}

/// Inclusion proof for `lines[index]`, bottom level first.
///
/// Returns `None` when `index` is out of range. The proof length is
/// `⌈log₂ n⌉` for `n` lines.
#[must_use]
pub fn proof_path<L: AsRef<[u8]>>(lines: &[L], index: usize) -> Option<Vec<ProofStep>> {
    if index >= lines.len() {
        return None;
    }
    let mut level = leaf_hashes(lines);
    let mut idx = index;
    let mut path = Vec::new();
    while level.len() > 1 {
        let (pos, sib_idx) = if idx % 2 == 0 {
            (Pos::R, if idx + 1 < level.len() { idx + 1 } else { idx })
        } else {
            (Pos::L, idx - 1)
        };
        path.push(ProofStep {
            pos,
            hash: hex(&level[sib_idx]),
        });
        level = level
            .chunks(2)
            .map(|pair| {
                let a = &pair[0];
                let b = pair.get(1).unwrap_or(a);
                h2(a, b)
            })
            .collect();
        idx /= 2;
    }
    Some(path)
}

/// Rebuild the root from `line` at `index` via `path` and compare to
/// `root`.
///
/// The sibling positions are cross-checked against the index's parity at
/// each level, so a proof transplanted to the wrong index fails even when
/// its hashes would combine to the right root.
#[must_use]
pub fn verify_inclusion(root: &str, line: &[u8], index: usize, path: &[ProofStep]) -> bool {
    let mut node = h(line);
    let mut idx = index;
    for step in path {
        let expected = if idx % 2 == 0 { Pos::R } else { Pos::L };
        if step.pos != expected {
            return false;
        }
        let Some(sib) = unhex(&step.hash) else {
            return false;
        };
        node = match step.pos {
            Pos::R => h2(&node, &sib),
            Pos::L => h2(&sib, &node),
        };
        idx /= 2;
    }
    hex(&node) == root
}


#[cfg(test)]
mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn inclusion_holds_for_every_valid_pair(
            raw in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..40),
            seed in any::<usize>(),
        ) {
            let index = seed % raw.len();
            let root = merkle_root(&raw);
            let path = proof_path(&raw, index).unwrap();
            prop_assert!(verify_inclusion(&root, &raw[index], index, &path));
        }

        #[test]
        fn proof_length_is_ceil_log2(
            n in 1usize..64,
        ) {
            let lines: Vec<Vec<u8>> = (0..n).map(|i| vec![i as u8]).collect();
            let path = proof_path(&lines, 0).unwrap();
            let expected = (usize::BITS - (n - 1).leading_zeros()) as usize;
            prop_assert_eq!(path.len(), if n == 1 { 0 } else { expected });
        }
    }
}
