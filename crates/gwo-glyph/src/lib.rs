// SPDX-License-Identifier: MIT OR Apache-2.0
//! gwo-glyph
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Compiles symbolic glyph programs into the canonical step alphabet, and
//! optionally runs the planning pre-pass that inserts policy-required steps
//! and applies score biases.

/// Glyph text → normalized step sequence.
pub mod compile;
/// Score-driven planning pre-pass.
pub mod plan;

pub use compile::{Compiled, GlyphError, compile, compile_to_dag};
pub use plan::{PlanContext, Risk, plan, step_scores};
