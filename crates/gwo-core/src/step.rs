// SPDX-License-Identifier: MIT OR Apache-2.0
//! The closed, ordered step alphabet.
//!
//! Workflows are composed from exactly ten named steps in a fixed canonical
//! order. The glyph compiler over-approximates its input (many encodings are
//! accepted) but under-approximates its output: only these names ever leave
//! it, so every downstream component works over a finite, typed set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One step of the canonical workflow alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    /// Check that the manifest / inputs are present and well-formed.
    Verify,
    /// Call out to the target system.
    Invoke,
    /// Record an SBOM-style inventory.
    Audit,
    /// Vulnerability scan.
    Scan,
    /// Produce an attestation digest.
    Attest,
    /// Policy gate.
    Sanctify,
    /// Progressive rollout.
    Rollout,
    /// Final gate decision.
    Judge,
    /// Deployment.
    Deploy,
    /// Close-out.
    Continuum,
}

/// Every step in canonical order.
pub const CANONICAL_STEPS: [Step; 10] = [
    Step::Verify,
    Step::Invoke,
    Step::Audit,
    Step::Scan,
    Step::Attest,
    Step::Sanctify,
    Step::Rollout,
    Step::Judge,
    Step::Deploy,
    Step::Continuum,
];

impl Step {
    /// Canonical lowercase name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Step::Verify => "verify",
            Step::Invoke => "invoke",
            Step::Audit => "audit",
            Step::Scan => "scan",
            Step::Attest => "attest",
            Step::Sanctify => "sanctify",
            Step::Rollout => "rollout",
            Step::Judge => "judge",
            Step::Deploy => "deploy",
            Step::Continuum => "continuum",
        }
    }

    /// Position in the canonical order (0-based).
    #[must_use]
    pub fn index(self) -> usize {
        CANONICAL_STEPS
            .iter()
            .position(|s| *s == self)
            .unwrap_or_default()
    }

    /// Registered plugin name for the built-in handler of this step.
    #[must_use]
    pub fn plugin(self) -> String {
        format!("core.{}", self.name())
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Step {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CANONICAL_STEPS
            .iter()
            .copied()
            .find(|step| step.name() == s)
            .ok_or(())
    }
}

/// `true` iff `steps` is exactly the first `steps.len()` canonical steps.
///
/// This is the compiler's acceptance check: a compiled glyph program must
/// spell out a prefix of the canonical order.
#[must_use]
pub fn is_canonical_prefix(steps: &[Step]) -> bool {
    steps.len() <= CANONICAL_STEPS.len()
        && steps.iter().zip(CANONICAL_STEPS.iter()).all(|(a, b)| a == b)
}

/// `true` iff `steps` is a strictly-ordered subsequence of the canonical
/// order (no duplicates, no inversions). The planner emits these.
#[must_use]
pub fn is_canonical_subsequence(steps: &[Step]) -> bool {
    steps.windows(2).all(|w| w[0].index() < w[1].index())
}
