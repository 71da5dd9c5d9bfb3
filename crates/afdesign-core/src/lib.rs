//! # afdesign Core Library
//!
//! Gradient-based protein sequence design against a differentiable structure
//! predictor. The library treats the predictor as an opaque loss-and-gradient
//! oracle and owns everything around it: the continuous sequence relaxation,
//! the optimizer, ensemble and recycle handling, annealing schedules, a
//! discrete refinement search and the per-step history.
//!
//! ## Architectural Philosophy
//!
//! The library keeps the same three-layer split throughout.
//!
//! - **[`core`]: The Foundation.** Stateless primitives: parameter trees, the
//!   deterministic key stream, the amino-acid alphabet and sequence utilities
//!   such as gradient normalization and sequence identity.
//!
//! - **[`engine`]: The Logic Core.** The stateful layer. It defines the
//!   [`Predictor`](engine::predictor::Predictor) seam, the optimizer adapter,
//!   the evaluation engine with its recycle modes, and the
//!   [`DesignSession`](engine::session::DesignSession) that carries
//!   parameters, options, keys, trajectory and best snapshot.
//!
//! - **[`workflows`]: The Public API.** Complete design protocols built from
//!   session steps: staged annealing (`design`, its shortcuts and presets),
//!   template predesign and semigreedy search.

pub mod core;
pub mod engine;
pub mod workflows;
