// SPDX-License-Identifier: MIT OR Apache-2.0
//! Glyph text → normalized step sequence.
//!
//! The compiler accepts many human encodings of a workflow (emoji glyphs,
//! bare step names, sentences whose first word is a step) and emits only
//! the canonical alphabet. It performs no I/O and has no side effects.

use gwo_core::Dag;
use gwo_core::step::{Step, is_canonical_prefix};

/// Fixed symbol table. Longer symbols are matched before their prefixes
/// (the sanctify glyph begins with the scan glyph's scalar).
const GLYPH_SYMBOLS: [(&str, Step); 10] = [
    ("🛡\u{200d}🔥", Step::Sanctify),
    ("🌀", Step::Verify),
    ("🌞", Step::Invoke),
    ("🧾", Step::Audit),
    ("🛡", Step::Scan),
    ("🔮", Step::Attest),
    ("🚦", Step::Rollout),
    ("⚖\u{fe0f}", Step::Judge),
    ("🌈", Step::Deploy),
    ("♾", Step::Continuum),
];

/// Result of compiling a glyph program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiled {
    /// `true` iff the step sequence is a prefix of the canonical order.
    pub ok: bool,
    /// Normalized steps, in input order, filtered to the canonical set.
    pub steps: Vec<Step>,
    /// Short description of what the compiler did.
    pub explain: String,
}

/// Errors surfaced when a glyph program is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GlyphError {
    /// The normalized steps are not a prefix of the canonical order.
    #[error("glyph order invalid: steps must follow the canonical order")]
    InvalidOrder,
    /// The program contained no recognizable steps.
    #[error("glyph program is empty")]
    Empty,
}

/// Compile a glyph program into normalized steps.
///
/// Input is split on `;` and newlines. Each non-empty token is mapped: a
/// token that is (or begins with) a known glyph symbol maps through the
/// symbol table; anything else contributes its lowercased first word. Tokens
/// outside the canonical set are dropped before the order check.
#[must_use]
pub fn compile(text: &str) -> Compiled {
    let steps: Vec<Step> = text
        .split(['\n', ';'])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter_map(map_token)
        .collect();
    let ok = is_canonical_prefix(&steps);
    Compiled {
        ok,
        steps,
        explain: "glyphs mapped then order-checked".into(),
    }
}

/// Compile and build the linear DAG, rejecting invalid programs.
///
/// The DAG's `meta` notes the glyph source; its digest is unaffected.
///
/// # Errors
///
/// [`GlyphError::Empty`] when no canonical step survives normalization,
/// [`GlyphError::InvalidOrder`] when the sequence is not a canonical prefix.
pub fn compile_to_dag(text: &str) -> Result<Dag, GlyphError> {
    let compiled = compile(text);
    if !compiled.ok {
        return Err(GlyphError::InvalidOrder);
    }
    if compiled.steps.is_empty() {
        return Err(GlyphError::Empty);
    }
    let mut dag = Dag::from_steps(&compiled.steps);
    dag.meta.insert("source".into(), "glyphs".into());
    dag.meta
        .insert("explain".into(), serde_json::Value::String(compiled.explain));
    Ok(dag)
}

fn map_token(token: &str) -> Option<Step> {
    for (symbol, step) in GLYPH_SYMBOLS {
        if token == symbol || token.starts_with(symbol) {
            return Some(step);
        }
    }
    let first = token.split_whitespace().next()?;
    first.to_lowercase().parse::<Step>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwo_core::step::CANONICAL_STEPS;

    const FULL: &str =
        "verify; invoke; audit; scan; attest; sanctify; rollout; judge; deploy; continuum";

    #[test]
    fn full_canonical_program_compiles() {
        let c = compile(FULL);
        assert!(c.ok);
        assert_eq!(c.steps, CANONICAL_STEPS);
    }

    #[test]
    fn emoji_glyphs_map_to_steps() {
        let c = compile("🌀; 🌞; 🧾");
        assert!(c.ok);
        assert_eq!(c.steps, [Step::Verify, Step::Invoke, Step::Audit]);
    }

    #[test]
    fn sanctify_glyph_wins_over_scan_prefix() {
        let c = compile("🛡\u{200d}🔥");
        assert_eq!(c.steps, [Step::Sanctify]);
    }

    #[test]
    fn first_word_lowercased() {
        let c = compile("VERIFY the manifest\nInvoke the target");
        assert!(c.ok);
        assert_eq!(c.steps, [Step::Verify, Step::Invoke]);
    }

    #[test]
    fn unknown_tokens_are_dropped() {
        let c = compile("verify; summon; invoke");
        assert!(c.ok);
        assert_eq!(c.steps, [Step::Verify, Step::Invoke]);
    }

    #[test]
    fn out_of_order_is_rejected() {
        let c = compile("deploy; verify");
        assert!(!c.ok);
        assert_eq!(c.steps, [Step::Deploy, Step::Verify]);
    }

    #[test]
    fn gap_in_prefix_is_rejected() {
        // A subsequence that skips a canonical step is not a prefix.
        let c = compile("verify; audit");
        assert!(!c.ok);
    }

    #[test]
    fn same_input_same_output() {
        assert_eq!(compile(FULL), compile(FULL));
    }

    #[test]
    fn compile_to_dag_names_tasks_by_position() {
        let dag = compile_to_dag(FULL).unwrap();
        let mut names: Vec<&String> = dag.tasks.keys().collect();
        names.sort();
        assert_eq!(names.first().map(|s| s.as_str()), Some("00_verify"));
        assert_eq!(names.last().map(|s| s.as_str()), Some("09_continuum"));
    }

    #[test]
    fn compile_to_dag_rejects_bad_order() {
        assert_eq!(compile_to_dag("deploy; verify"), Err(GlyphError::InvalidOrder));
    }

    #[test]
    fn compile_to_dag_rejects_empty() {
        assert_eq!(compile_to_dag("abracadabra"), Err(GlyphError::Empty));
    }
}
