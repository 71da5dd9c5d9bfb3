//! # Workflows Module
//!
//! Complete design protocols built on [`DesignSession`](crate::engine::session::DesignSession).
//!
//! ## Overview
//!
//! Each workflow is an inherent method on the session so that protocols compose:
//! a run typically restarts the session, anneals through one or more gradient
//! stages and optionally finishes with a discrete search. Workflows report stage
//! and iteration progress through the session's reporter.
//!
//! ## Architecture
//!
//! - **Annealing** ([`anneal`]) - `design` with linear soft/hard and quadratic temperature
//!   schedules, the logits/soft/hard shortcuts, the two- and three-stage presets and
//!   template predesign
//! - **Semigreedy Search** ([`semigreedy`]) - Confidence-biased single-point mutation search

pub mod anneal;
pub mod semigreedy;
