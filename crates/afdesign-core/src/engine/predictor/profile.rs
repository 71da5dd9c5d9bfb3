use super::{
    AuxOutputs, CA_ATOM_INDEX, Predictor, PredictorCall, PredictorError, RecurrentState,
    SequenceRepr, ATOM_TYPES,
};
use crate::core::alphabet::{ALPHABET_SIZE, UNKNOWN_INDEX, parse_sequence};
use crate::core::sequence::{argmax_rows, design_rows, one_hot};
use crate::core::tree::{ParamTree, Tensor};
use crate::engine::config::LossWeights;
use ndarray::{Array1, Array2, Array3, Axis, s};
use rand::Rng;
use std::collections::BTreeMap;
use tracing::trace;

const DEFAULT_MEMBER_SCALES: [f64; 5] = [1.0, 0.95, 1.05, 0.9, 1.1];
const DEFAULT_PROFILE_WEIGHT: f64 = 1.0;
const DEFAULT_PLDDT_WEIGHT: f64 = 0.5;
const DROPOUT_KEEP_PROB: f64 = 0.9;
const MAX_PAE: f64 = 31.0;
const HELIX_RADIUS: f64 = 2.3;
const HELIX_RISE: f64 = 1.5;
const HELIX_TURN_DEGREES: f64 = 100.0;
const PROFILE_ROW_TOLERANCE: f64 = 1e-6;

/// Differentiable stand-in for a structure predictor.
///
/// Scores the designed sequence against a position-specific target profile.
/// It builds the same soft / straight-through hard / pseudo sequence views a
/// real predictor would, reports a `profile` term (negative expected profile
/// match of the pseudo sequence) and a `plddt` term (one minus the mean
/// profile probability under the softmax), and returns exact gradients of the
/// weighted sum. Each ensemble member rescales the profile term, and dropout
/// masks positions using the call's key.
#[derive(Debug, Clone)]
pub struct ProfilePredictor {
    profile: Array2<f64>,
    target_len: usize,
    num_recycle: usize,
    member_scales: Vec<f64>,
}

impl ProfilePredictor {
    pub fn new(profile: Array2<f64>) -> Result<Self, PredictorError> {
        if profile.nrows() == 0 || profile.ncols() != ALPHABET_SIZE {
            return Err(PredictorError::new(format!(
                "profile must be [L, {}] with L > 0, got {:?}",
                ALPHABET_SIZE,
                profile.dim()
            )));
        }
        for (i, row) in profile.outer_iter().enumerate() {
            let valid = row.iter().all(|v| v.is_finite() && *v >= 0.0);
            if !valid || (row.sum() - 1.0).abs() > PROFILE_ROW_TOLERANCE {
                return Err(PredictorError::new(format!(
                    "profile row {} is not a probability distribution",
                    i
                )));
            }
        }
        Ok(Self {
            profile,
            target_len: 0,
            num_recycle: 3,
            member_scales: DEFAULT_MEMBER_SCALES.to_vec(),
        })
    }

    /// Builds a profile that puts `1 - smoothing` on each residue of
    /// `sequence` and spreads `smoothing` uniformly. `X` rows are uniform.
    pub fn from_sequence(sequence: &str, smoothing: f64) -> Result<Self, PredictorError> {
        if !(0.0..=1.0).contains(&smoothing) {
            return Err(PredictorError::new(format!(
                "profile smoothing {} must be within [0, 1]",
                smoothing
            )));
        }
        let indices = parse_sequence(sequence).map_err(|e| PredictorError::new(e.to_string()))?;
        let uniform = 1.0 / ALPHABET_SIZE as f64;
        let mut profile = one_hot(&indices, ALPHABET_SIZE) * (1.0 - smoothing) + smoothing * uniform;
        for (row, &idx) in indices.iter().enumerate() {
            if idx == UNKNOWN_INDEX {
                profile.row_mut(row).fill(uniform);
            }
        }
        Self::new(profile)
    }

    pub fn with_target_len(mut self, target_len: usize) -> Self {
        self.target_len = target_len;
        self
    }

    pub fn with_num_recycle(mut self, num_recycle: usize) -> Self {
        self.num_recycle = num_recycle;
        self
    }

    pub fn with_member_scales(mut self, scales: Vec<f64>) -> Self {
        self.member_scales = scales;
        self
    }

    pub fn design_len(&self) -> usize {
        self.profile.nrows()
    }

    pub fn profile(&self) -> &Array2<f64> {
        &self.profile
    }

    fn forward(
        &self,
        call: &PredictorCall<'_>,
        want_grad: bool,
    ) -> Result<(f64, AuxOutputs, Option<Tensor>), PredictorError> {
        let seq_param = call
            .params
            .leaf_at("seq")
            .map_err(|e| PredictorError::new(e.to_string()))?;
        let logits = design_rows(seq_param).map_err(|e| PredictorError::new(e.to_string()))?;
        if logits.dim() != self.profile.dim() {
            return Err(PredictorError::new(format!(
                "sequence parameters {:?} do not match profile {:?}",
                logits.dim(),
                self.profile.dim()
            )));
        }
        let scale = *self.member_scales.get(call.model).ok_or_else(|| {
            PredictorError::new(format!(
                "model index {} out of range ({} members)",
                call.model,
                self.member_scales.len()
            ))
        })?;

        let opt = call.opt;
        let len = logits.nrows();
        let n = len as f64;

        let mut soft = logits.mapv(|v| v / opt.temp);
        for mut row in soft.rows_mut() {
            let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|v| v / sum);
        }
        let hard = one_hot(&argmax_rows(logits.view()), ALPHABET_SIZE);
        let blended = &soft * opt.soft + &logits * (1.0 - opt.soft);
        let pseudo = &hard * opt.hard + &(blended * (1.0 - opt.hard));

        let mask: Array1<f64> = if opt.dropout {
            let mut rng = call.key.rng();
            Array1::from_shape_fn(len, |_| {
                if rng.gen_bool(DROPOUT_KEEP_PROB) {
                    1.0 / DROPOUT_KEEP_PROB
                } else {
                    0.0
                }
            })
        } else {
            Array1::ones(len)
        };

        let w_profile = opt.weight("profile").unwrap_or(DEFAULT_PROFILE_WEIGHT);
        let w_plddt = opt.weight("plddt").unwrap_or(DEFAULT_PLDDT_WEIGHT);

        let matched = (&self.profile * &pseudo).sum_axis(Axis(1));
        let profile_loss = -scale * (&matched * &mask).sum() / n;
        let confidence = (&self.profile * &soft).sum_axis(Axis(1));
        let plddt_loss = 1.0 - confidence.sum() / n;
        let loss = w_profile * profile_loss + w_plddt * plddt_loss;

        trace!(
            model = call.model,
            profile_loss, plddt_loss, loss, "Profile predictor evaluated."
        );

        let grad = if want_grad {
            let mask_col = mask.view().insert_axis(Axis(1));
            let g_pseudo = &self.profile * &mask_col * (-w_profile * scale / n);
            let through_soft = opt.hard + (1.0 - opt.hard) * opt.soft;
            let upstream = &g_pseudo * through_soft + &(&self.profile * (-w_plddt / n));
            let inner = (&upstream * &soft).sum_axis(Axis(1)).insert_axis(Axis(1));
            let g_logits = (&upstream - &inner) * &soft / opt.temp
                + &g_pseudo * ((1.0 - opt.hard) * (1.0 - opt.soft));
            let g = g_logits
                .into_shape_with_order(seq_param.shape().to_vec())
                .map_err(|e| PredictorError::new(e.to_string()))?;
            Some(g)
        } else {
            None
        };

        let total = self.target_len + len;
        let mut plddt = Array1::ones(total);
        plddt.slice_mut(s![self.target_len..]).assign(&confidence);
        let pae = Array2::from_shape_fn((total, total), |(i, j)| {
            MAX_PAE * (1.0 - (plddt[i] * plddt[j]).sqrt())
        });
        let positions = helix_positions(total);

        let mut prev = RecurrentState::zeros(total);
        prev.msa_first_row.column_mut(0).assign(&plddt);
        prev.positions.assign(&positions);

        let mut losses = BTreeMap::new();
        losses.insert("profile".to_string(), profile_loss);
        losses.insert("plddt".to_string(), plddt_loss);

        let aux = AuxOutputs {
            losses,
            seq: SequenceRepr { soft, hard, pseudo },
            final_atom_positions: positions,
            plddt,
            pae: Some(pae),
            prev,
            recycles: call.opt.recycles,
            model_num: vec![call.model],
        };
        Ok((loss, aux, grad))
    }
}

fn helix_positions(len: usize) -> Array3<f64> {
    let mut positions = Array3::zeros((len, ATOM_TYPES, 3));
    for i in 0..len {
        let angle = (HELIX_TURN_DEGREES * i as f64).to_radians();
        positions[[i, CA_ATOM_INDEX, 0]] = HELIX_RADIUS * angle.cos();
        positions[[i, CA_ATOM_INDEX, 1]] = HELIX_RADIUS * angle.sin();
        positions[[i, CA_ATOM_INDEX, 2]] = HELIX_RISE * i as f64;
    }
    positions
}

impl Predictor for ProfilePredictor {
    fn sequence_len(&self) -> usize {
        self.target_len + self.profile.nrows()
    }

    fn num_recycle(&self) -> usize {
        self.num_recycle
    }

    fn model_count(&self) -> usize {
        self.member_scales.len()
    }

    fn default_weights(&self) -> LossWeights {
        LossWeights::from([
            ("profile".to_string(), DEFAULT_PROFILE_WEIGHT),
            ("plddt".to_string(), DEFAULT_PLDDT_WEIGHT),
        ])
    }

    fn evaluate(&self, call: &PredictorCall<'_>) -> Result<(f64, AuxOutputs), PredictorError> {
        let (loss, aux, _) = self.forward(call, false)?;
        Ok((loss, aux))
    }

    fn evaluate_with_gradient(
        &self,
        call: &PredictorCall<'_>,
    ) -> Result<((f64, AuxOutputs), ParamTree), PredictorError> {
        let (loss, aux, seq_grad) = self.forward(call, true)?;
        let seq_grad =
            seq_grad.ok_or_else(|| PredictorError::new("gradient was not computed"))?;
        let mut grad = call.params.zeros_like();
        *grad
            .leaf_at_mut("seq")
            .map_err(|e| PredictorError::new(e.to_string()))? = seq_grad;
        Ok(((loss, aux), grad))
    }
}
