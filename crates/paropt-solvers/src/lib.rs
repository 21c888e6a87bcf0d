//! Reference nonlinear programming solvers.
//!
//! Every solver in this crate talks to the problem it optimizes through the
//! [`NlpProblem`] callback contract and reports how it stopped with an integer
//! native return code (see [`return_code`]). Callers are expected to map those
//! codes onto their own status vocabulary.

pub mod algorithms;
pub mod common;

/// Re-export common types
pub use common::*;
