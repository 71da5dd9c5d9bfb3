use super::predictor::AuxOutputs;
use nalgebra::Point3;
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;

/// Scalars recorded for one completed step.
#[derive(Debug, Clone, PartialEq)]
pub struct LossRecord {
    /// Loss terms reported by the predictor, averaged over the selected models.
    pub terms: BTreeMap<String, f64>,
    pub models: Vec<usize>,
    pub recycles: usize,
    pub hard: f64,
    pub soft: f64,
    pub temp: f64,
    pub loss: f64,
    /// Fraction of scored positions matching the reference, when one exists.
    pub seqid: Option<f64>,
}

impl LossRecord {
    /// Scalar value for a summary or export key; `None` if not recorded.
    /// `models` is a list and has no scalar value.
    pub fn value(&self, key: &str) -> Option<f64> {
        match key {
            "models" => None,
            "recycles" => Some(self.recycles as f64),
            "hard" => Some(self.hard),
            "soft" => Some(self.soft),
            "temp" => Some(self.temp),
            "loss" => Some(self.loss),
            "seqid" => self.seqid,
            term => self.terms.get(term).copied(),
        }
    }
}

/// Append-only per-step history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    pub losses: Vec<LossRecord>,
    pub seq: Vec<Array2<f64>>,
    pub xyz: Vec<Vec<Point3<f64>>>,
    pub plddt: Vec<Array1<f64>>,
    pub pae: Vec<Array2<f64>>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: LossRecord, aux: &AuxOutputs) {
        self.losses.push(record);
        self.seq.push(aux.seq.pseudo.clone());
        self.xyz.push(aux.ca_trace());
        self.plddt.push(aux.plddt.clone());
        if let Some(pae) = &aux.pae {
            self.pae.push(pae.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn last(&self) -> Option<&LossRecord> {
        self.losses.last()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BestSnapshot {
    pub loss: f64,
    pub aux: AuxOutputs,
    /// Step counter value when the snapshot was taken.
    pub step: usize,
}

/// Keeps the lowest-loss output seen so far. Only a strictly lower loss
/// replaces the current snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BestTracker {
    best: Option<BestSnapshot>,
}

impl BestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the snapshot was replaced.
    pub fn offer(&mut self, loss: f64, aux: &AuxOutputs, step: usize) -> bool {
        if loss < self.best_loss() {
            self.best = Some(BestSnapshot {
                loss,
                aux: aux.clone(),
                step,
            });
            true
        } else {
            false
        }
    }

    /// `+inf` until a snapshot exists.
    pub fn best_loss(&self) -> f64 {
        self.best.as_ref().map_or(f64::INFINITY, |b| b.loss)
    }

    pub fn snapshot(&self) -> Option<&BestSnapshot> {
        self.best.as_ref()
    }

    pub fn reset(&mut self) {
        self.best = None;
    }
}
