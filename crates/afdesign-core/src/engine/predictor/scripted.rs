//! Deterministic predictor for unit tests: losses are taken from a script
//! (falling back to the model index), every call is recorded, and the
//! recurrent state carries a call counter so chaining can be observed.

use super::{AuxOutputs, Predictor, PredictorCall, PredictorError, RecurrentState, SequenceRepr};
use crate::core::alphabet::ALPHABET_SIZE;
use crate::core::sequence::{argmax_rows, design_rows, one_hot};
use crate::core::tree::ParamTree;
use ndarray::{Array1, Array3};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CallRecord {
    pub model: usize,
    pub recycles: usize,
    /// Counter read from the incoming recurrent state.
    pub prev_marker: f64,
    pub key: u64,
    pub with_gradient: bool,
    pub soft: f64,
    pub hard: f64,
    pub temp: f64,
    pub dropout: bool,
    pub template_dropout: f64,
    /// Argmax sequence seen by the call.
    pub argmax: Vec<usize>,
}

#[derive(Debug)]
pub(crate) struct ScriptedPredictor {
    pub len: usize,
    pub num_recycle: usize,
    pub model_count: usize,
    pub plddt: Option<Array1<f64>>,
    pub script: RefCell<VecDeque<f64>>,
    pub calls: RefCell<Vec<CallRecord>>,
}

impl ScriptedPredictor {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            num_recycle: 3,
            model_count: 5,
            plddt: None,
            script: RefCell::new(VecDeque::new()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn with_script(self, losses: &[f64]) -> Self {
        self.script.borrow_mut().extend(losses.iter().copied());
        self
    }

    pub fn with_plddt(mut self, plddt: Vec<f64>) -> Self {
        self.plddt = Some(Array1::from(plddt));
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    fn run(&self, call: &PredictorCall<'_>, with_gradient: bool) -> Result<(f64, AuxOutputs), PredictorError> {
        let seq = call
            .params
            .leaf_at("seq")
            .map_err(|e| PredictorError::new(e.to_string()))?;
        let logits = design_rows(seq).map_err(|e| PredictorError::new(e.to_string()))?;
        let argmax = argmax_rows(logits.view());
        let prev_marker = call.prev.msa_first_row[[0, 0]];

        self.calls.borrow_mut().push(CallRecord {
            model: call.model,
            recycles: call.opt.recycles,
            prev_marker,
            key: call.key.value(),
            with_gradient,
            soft: call.opt.soft,
            hard: call.opt.hard,
            temp: call.opt.temp,
            dropout: call.opt.dropout,
            template_dropout: call.opt.template.dropout,
            argmax: argmax.clone(),
        });

        let loss = self
            .script
            .borrow_mut()
            .pop_front()
            .unwrap_or(call.model as f64);

        let mut prev = RecurrentState::zeros(self.len);
        prev.msa_first_row[[0, 0]] = prev_marker + 1.0;

        let hard = one_hot(&argmax, ALPHABET_SIZE);
        let aux = AuxOutputs {
            losses: BTreeMap::from([
                ("plddt".to_string(), loss),
                ("model".to_string(), call.model as f64),
            ]),
            seq: SequenceRepr {
                soft: logits.to_owned(),
                pseudo: logits.to_owned(),
                hard,
            },
            final_atom_positions: Array3::zeros((self.len, 37, 3)),
            plddt: self
                .plddt
                .clone()
                .unwrap_or_else(|| Array1::from_elem(self.len, 0.5)),
            pae: None,
            prev,
            recycles: call.opt.recycles,
            model_num: vec![call.model],
        };
        Ok((loss, aux))
    }
}

impl Predictor for ScriptedPredictor {
    fn sequence_len(&self) -> usize {
        self.len
    }

    fn num_recycle(&self) -> usize {
        self.num_recycle
    }

    fn model_count(&self) -> usize {
        self.model_count
    }

    fn evaluate(&self, call: &PredictorCall<'_>) -> Result<(f64, AuxOutputs), PredictorError> {
        self.run(call, false)
    }

    fn evaluate_with_gradient(
        &self,
        call: &PredictorCall<'_>,
    ) -> Result<((f64, AuxOutputs), ParamTree), PredictorError> {
        let out = self.run(call, true)?;
        // Depends on the incoming state so recycle averaging is observable.
        let fill = call.prev.msa_first_row[[0, 0]] + call.model as f64 + 1.0;
        let grad = call.params.map_leaves(|t| t.mapv(|v| v + fill));
        Ok((out, grad))
    }
}
