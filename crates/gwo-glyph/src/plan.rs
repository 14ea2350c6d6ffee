// SPDX-License-Identifier: MIT OR Apache-2.0
//! Score-driven planning pre-pass.
//!
//! The planner takes compiled steps plus run context and decides the final
//! ordered step list: a fixed descending prior per canonical step, an
//! "already present" discount, a risk boost for the safety steps, and any
//! caller-supplied bias are combined into softmax scores; the top-scoring
//! candidates are merged with the compiled steps, elevated risk forces the
//! safety steps in, and the result is returned in canonical order. Tag
//! content is never interpreted; a tag only biases the step whose name it
//! equals.

use gwo_core::step::{CANONICAL_STEPS, Step};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Steps forced in when risk is elevated, in canonical position.
pub const SAFETY_STEPS: [Step; 4] = [Step::Scan, Step::Attest, Step::Sanctify, Step::Judge];

/// How many top-scoring steps the planner merges into the plan.
const PREDICTED_TOP_K: usize = 3;

/// Prior for the first canonical step; each later step loses [`PRIOR_DECAY`].
const PRIOR_BASE: f64 = 2.0;
const PRIOR_DECAY: f64 = 0.1;

/// Discount applied to steps already present in the compiled program.
const PRESENT_DISCOUNT: f64 = 1.1;

/// Boost applied to safety steps under elevated risk.
const RISK_BOOST: f64 = 0.4;

/// Boost applied when a tag names a step.
const TAG_BOOST: f64 = 0.2;

/// Risk level carried by a submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    /// Normal operation.
    #[default]
    Low,
    /// Elevated: the safety steps become mandatory.
    High,
}

/// Context the planner scores against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanContext {
    /// Owning tenant.
    pub tenant: String,
    /// Queue priority the run will be submitted with.
    pub priority: u8,
    /// Risk level.
    #[serde(default)]
    pub risk: Risk,
    /// Opaque tags; a tag equal to a step name biases that step.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Softmax scores per canonical step, highest first.
///
/// Ties break on canonical position, so equal inputs always produce the
/// same ranking.
#[must_use]
pub fn step_scores(
    present: &[Step],
    ctx: &PlanContext,
    bias: &BTreeMap<String, f64>,
) -> Vec<(Step, f64)> {
    let logits: Vec<(Step, f64)> = CANONICAL_STEPS
        .iter()
        .map(|&step| {
            let mut z = PRIOR_BASE - PRIOR_DECAY * step.index() as f64;
            if present.contains(&step) {
                z -= PRESENT_DISCOUNT;
            }
            if ctx.risk == Risk::High && SAFETY_STEPS.contains(&step) {
                z += RISK_BOOST;
            }
            if ctx.tags.iter().any(|t| t == step.name()) {
                z += TAG_BOOST;
            }
            if let Some(b) = bias.get(step.name()) {
                z += b;
            }
            (step, z)
        })
        .collect();

    let max = logits
        .iter()
        .map(|(_, z)| *z)
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<(Step, f64)> = logits
        .into_iter()
        .map(|(s, z)| (s, (z - max).exp()))
        .collect();
    let total: f64 = exps.iter().map(|(_, p)| p).sum();
    let denom = if total > 0.0 { total } else { 1.0 };

    let mut scored: Vec<(Step, f64)> = exps.into_iter().map(|(s, p)| (s, p / denom)).collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.index().cmp(&b.0.index()))
    });
    scored
}

/// Produce the final ordered step list for a run.
///
/// Deterministic: the same `(steps, ctx, bias)` always yields the same
/// output, and the output is always a canonically-ordered subsequence.
#[must_use]
pub fn plan(steps: &[Step], ctx: &PlanContext, bias: &BTreeMap<String, f64>) -> Vec<Step> {
    let scored = step_scores(steps, ctx, bias);
    let predicted: Vec<Step> = scored.iter().take(PREDICTED_TOP_K).map(|(s, _)| *s).collect();

    let mut chosen: Vec<Step> = CANONICAL_STEPS
        .iter()
        .copied()
        .filter(|s| steps.contains(s) || predicted.contains(s))
        .collect();

    if ctx.risk == Risk::High {
        for s in SAFETY_STEPS {
            if !chosen.contains(&s) {
                chosen.push(s);
            }
        }
        chosen.sort_by_key(|s| s.index());
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwo_core::step::is_canonical_subsequence;

    fn ctx(risk: Risk) -> PlanContext {
        PlanContext {
            tenant: "public".into(),
            priority: 5,
            risk,
            tags: Vec::new(),
        }
    }

    #[test]
    fn scores_sum_to_one() {
        let scored = step_scores(&[], &ctx(Risk::Low), &BTreeMap::new());
        let total: f64 = scored.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn present_steps_score_lower() {
        let absent = step_scores(&[], &ctx(Risk::Low), &BTreeMap::new());
        let present = step_scores(&[Step::Verify], &ctx(Risk::Low), &BTreeMap::new());
        let p_absent = absent.iter().find(|(s, _)| *s == Step::Verify).unwrap().1;
        let p_present = present.iter().find(|(s, _)| *s == Step::Verify).unwrap().1;
        assert!(p_present < p_absent);
    }

    #[test]
    fn high_risk_forces_safety_steps() {
        let out = plan(&[Step::Verify], &ctx(Risk::High), &BTreeMap::new());
        for s in SAFETY_STEPS {
            assert!(out.contains(&s), "missing safety step {s}");
        }
        assert!(is_canonical_subsequence(&out));
    }

    #[test]
    fn output_preserves_canonical_order() {
        let out = plan(
            &[Step::Verify, Step::Invoke, Step::Deploy],
            &ctx(Risk::Low),
            &BTreeMap::new(),
        );
        assert!(is_canonical_subsequence(&out));
        assert!(out.contains(&Step::Deploy));
    }

    #[test]
    fn bias_promotes_a_step() {
        let mut bias = BTreeMap::new();
        bias.insert("continuum".to_string(), 5.0);
        let scored = step_scores(&[], &ctx(Risk::Low), &bias);
        assert_eq!(scored[0].0, Step::Continuum);
        let out = plan(&[], &ctx(Risk::Low), &bias);
        assert!(out.contains(&Step::Continuum));
    }

    #[test]
    fn tag_matching_step_name_biases_it() {
        let mut c = ctx(Risk::Low);
        c.tags.push("judge".into());
        let with_tag = step_scores(&[], &c, &BTreeMap::new());
        let without = step_scores(&[], &ctx(Risk::Low), &BTreeMap::new());
        let p_with = with_tag.iter().find(|(s, _)| *s == Step::Judge).unwrap().1;
        let p_without = without.iter().find(|(s, _)| *s == Step::Judge).unwrap().1;
        assert!(p_with > p_without);
    }

    #[test]
    fn same_inputs_same_plan() {
        let steps = [Step::Verify, Step::Scan];
        let c = ctx(Risk::High);
        let bias = BTreeMap::new();
        assert_eq!(plan(&steps, &c, &bias), plan(&steps, &c, &bias));
    }
}
