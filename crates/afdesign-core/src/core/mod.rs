//! # Core Module
//!
//! Stateless building blocks shared by the design engine.
//!
//! ## Overview
//!
//! The core module holds the numeric and bookkeeping primitives that the optimizer
//! is written against. Nothing here knows about predictors, options or sessions;
//! every item is a plain data structure or a pure function.
//!
//! ## Architecture
//!
//! - **Parameter Bundles** ([`tree`]) - Nested tensor trees with structural map, zip and mean
//! - **Randomness** ([`key`]) - Counter-based key stream giving one key per stochastic decision
//! - **Alphabet** ([`alphabet`]) - The 20-letter amino-acid alphabet and sequence parsing
//! - **Sequence Utilities** ([`sequence`]) - Argmax/one-hot conversion, sequence identity
//!   and length-invariant gradient normalization

pub mod alphabet;
pub mod key;
pub mod sequence;
pub mod tree;
