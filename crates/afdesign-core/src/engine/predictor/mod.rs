//! # Predictor Interface
//!
//! The design engine never looks inside the structure predictor. It drives it
//! through [`Predictor`]: one call maps the current design parameters, an
//! ensemble member, the carried-over recurrent state, a random key and the live
//! options to a scalar loss plus [`AuxOutputs`], and optionally the gradient of
//! that loss with respect to the parameters.
//!
//! [`profile::ProfilePredictor`] is a small differentiable stand-in used by the
//! command-line tool and the test suite.

pub mod profile;
#[cfg(test)]
pub(crate) mod scripted;

use crate::core::key::PrngKey;
use crate::core::tree::ParamTree;
use crate::engine::config::{DesignOptions, LossWeights};
use nalgebra::Point3;
use ndarray::{Array1, Array2, Array3};
use std::collections::BTreeMap;
use thiserror::Error;

pub const MSA_FIRST_ROW_WIDTH: usize = 256;
pub const PAIR_WIDTH: usize = 128;
pub const ATOM_TYPES: usize = 37;
/// Slot of the alpha carbon in the 37-atom layout.
pub const CA_ATOM_INDEX: usize = 1;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{message}")]
pub struct PredictorError {
    pub message: String,
}

impl PredictorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Tensors the predictor feeds back into itself between recycles.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentState {
    pub msa_first_row: Array2<f64>,
    pub pair: Array3<f64>,
    pub positions: Array3<f64>,
}

impl RecurrentState {
    pub fn zeros(len: usize) -> Self {
        Self {
            msa_first_row: Array2::zeros((len, MSA_FIRST_ROW_WIDTH)),
            pair: Array3::zeros((len, len, PAIR_WIDTH)),
            positions: Array3::zeros((len, ATOM_TYPES, 3)),
        }
    }

    pub fn len(&self) -> usize {
        self.msa_first_row.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Continuous, straight-through hardened and blended views of the sequence,
/// each `[L, A]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRepr {
    pub soft: Array2<f64>,
    pub hard: Array2<f64>,
    pub pseudo: Array2<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuxOutputs {
    pub losses: BTreeMap<String, f64>,
    pub seq: SequenceRepr,
    /// `[L, 37, 3]` atom coordinates.
    pub final_atom_positions: Array3<f64>,
    pub plddt: Array1<f64>,
    pub pae: Option<Array2<f64>>,
    pub prev: RecurrentState,
    /// Recycle count actually used; set by the evaluation engine.
    pub recycles: usize,
    /// Ensemble members averaged into this output; set by the evaluation engine.
    pub model_num: Vec<usize>,
}

impl AuxOutputs {
    /// Alpha-carbon trace of the predicted structure.
    pub fn ca_trace(&self) -> Vec<Point3<f64>> {
        self.final_atom_positions
            .outer_iter()
            .map(|atoms| {
                Point3::new(
                    atoms[[CA_ATOM_INDEX, 0]],
                    atoms[[CA_ATOM_INDEX, 1]],
                    atoms[[CA_ATOM_INDEX, 2]],
                )
            })
            .collect()
    }
}

/// Inputs of one predictor invocation.
#[derive(Debug, Clone, Copy)]
pub struct PredictorCall<'a> {
    pub params: &'a ParamTree,
    pub model: usize,
    pub prev: &'a RecurrentState,
    pub key: PrngKey,
    pub opt: &'a DesignOptions,
}

pub trait Predictor {
    /// Residue count of the full modelled complex.
    fn sequence_len(&self) -> usize;

    /// The predictor's own recycle count, used by recycle modes that
    /// differentiate through recycling.
    fn num_recycle(&self) -> usize;

    /// Number of ensemble members with loaded parameters.
    fn model_count(&self) -> usize;

    /// Loss weights assumed when the session has not configured a term.
    fn default_weights(&self) -> LossWeights {
        LossWeights::new()
    }

    fn evaluate(&self, call: &PredictorCall<'_>) -> Result<(f64, AuxOutputs), PredictorError>;

    fn evaluate_with_gradient(
        &self,
        call: &PredictorCall<'_>,
    ) -> Result<((f64, AuxOutputs), ParamTree), PredictorError>;
}
