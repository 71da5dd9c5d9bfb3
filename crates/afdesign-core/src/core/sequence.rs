use super::alphabet::UNKNOWN_INDEX;
use super::tree::Tensor;
use ndarray::{Array2, ArrayView2, Axis, Ix2};
use thiserror::Error;

/// Added to the gradient norm before rescaling.
pub const NORM_EPSILON: f64 = 1e-7;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum SequenceError {
    #[error("Unexpected tensor shape {shape:?}: {reason}")]
    Shape { shape: Vec<usize>, reason: String },

    #[error("Sequence length mismatch: designed {designed}, reference {reference}")]
    LengthMismatch { designed: usize, reference: usize },

    #[error("Position {position} is outside the designed region of length {len}")]
    PositionOutOfRange { position: usize, len: usize },

    #[error("Cannot compute identity over an empty set of positions")]
    Empty,
}

/// Views a `[1, L, A]` (or `[L, A]`) tensor as its `L x A` design rows, taking
/// the first batch entry when a batch axis is present.
pub fn design_rows(tensor: &Tensor) -> Result<ArrayView2<'_, f64>, SequenceError> {
    let shape_err = |reason: &str| SequenceError::Shape {
        shape: tensor.shape().to_vec(),
        reason: reason.to_string(),
    };
    match tensor.ndim() {
        2 => tensor
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| shape_err(&e.to_string())),
        3 if tensor.shape()[0] >= 1 => tensor
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix2>()
            .map_err(|e| shape_err(&e.to_string())),
        _ => Err(shape_err("expected [L, A] or [B, L, A]")),
    }
}

/// Index of the largest entry in each row; the first one wins on ties.
pub fn argmax_rows(rows: ArrayView2<'_, f64>) -> Vec<usize> {
    rows.outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
                    if v > best_v { (i, v) } else { (best_i, best_v) }
                })
                .0
        })
        .collect()
}

/// One-hot rows for `indices`. Unknown residues become all-zero rows.
pub fn one_hot(indices: &[usize], alphabet_size: usize) -> Array2<f64> {
    let mut out = Array2::zeros((indices.len(), alphabet_size));
    for (row, &idx) in indices.iter().enumerate() {
        if idx < alphabet_size && idx != UNKNOWN_INDEX {
            out[[row, idx]] = 1.0;
        }
    }
    out
}

/// Fraction of positions whose designed residue matches the reference.
///
/// With `positions`, only those designed positions are compared and the
/// reference is indexed in the same order as `positions`.
pub fn sequence_identity(
    designed: &[usize],
    reference: &[usize],
    positions: Option<&[usize]>,
) -> Result<f64, SequenceError> {
    let selected: Vec<usize> = match positions {
        Some(pos) => pos
            .iter()
            .map(|&p| {
                designed
                    .get(p)
                    .copied()
                    .ok_or(SequenceError::PositionOutOfRange {
                        position: p,
                        len: designed.len(),
                    })
            })
            .collect::<Result<_, _>>()?,
        None => designed.to_vec(),
    };
    if selected.len() != reference.len() {
        return Err(SequenceError::LengthMismatch {
            designed: selected.len(),
            reference: reference.len(),
        });
    }
    if selected.is_empty() {
        return Err(SequenceError::Empty);
    }
    let matches = selected
        .iter()
        .zip(reference)
        .filter(|(a, b)| a == b)
        .count();
    Ok(matches as f64 / selected.len() as f64)
}

/// Rescales every `[L, A]` block of `grad` to Euclidean norm `sqrt(len)`.
pub fn normalize_gradient(grad: &mut Tensor, len: usize) -> Result<(), SequenceError> {
    let ndim = grad.ndim();
    if ndim < 2 {
        return Err(SequenceError::Shape {
            shape: grad.shape().to_vec(),
            reason: "gradient needs at least two axes".to_string(),
        });
    }
    let block = grad.shape()[ndim - 2] * grad.shape()[ndim - 1];
    if block == 0 {
        return Ok(());
    }
    let total = grad.len();
    let shape = grad.shape().to_vec();
    let target = (len as f64).sqrt();
    let mut blocks = grad
        .view_mut()
        .into_shape_with_order((total / block, block))
        .map_err(|e| SequenceError::Shape {
            shape,
            reason: e.to_string(),
        })?;
    for mut row in blocks.rows_mut() {
        let norm = row.dot(&row).sqrt();
        let scale = target / (norm + NORM_EPSILON);
        row.mapv_inplace(|v| v * scale);
    }
    Ok(())
}
