//! # Engine Module
//!
//! The stateful half of the library: everything that turns predictor calls into
//! an optimization run.
//!
//! ## Overview
//!
//! A [`session::DesignSession`] owns the design parameters, the live options, the
//! key stream and the optimizer state. Each step asks the [`evaluation`] engine
//! for a loss, auxiliary outputs and a gradient averaged over the selected
//! ensemble members, normalizes and scales the sequence gradient, applies the
//! [`optimizer`] update and records the result in the [`state`] trajectory.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Design options, overrides and the per-session setup
//! - **Predictor Seam** ([`predictor`]) - The oracle interface and a reference profile predictor
//! - **Evaluation** ([`evaluation`]) - Model selection, recycle modes and ensemble averaging
//! - **Optimizers** ([`optimizer`]) - Plain descent and Adam over parameter trees
//! - **Session** ([`session`]) - Restart, run, step and result bookkeeping
//! - **State Tracking** ([`state`]) - Trajectory records and the best-loss snapshot
//! - **Reporting** ([`report`], [`progress`]) - Step summaries and progress callbacks
//! - **Error Handling** ([`error`]) - Engine-level error type

pub mod config;
pub mod error;
pub mod evaluation;
pub mod optimizer;
pub mod predictor;
pub mod progress;
pub mod report;
pub mod session;
pub mod state;
