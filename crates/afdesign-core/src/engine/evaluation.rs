use super::config::{DesignOptions, RecycleMode};
use super::error::EngineError;
use super::predictor::{AuxOutputs, Predictor, PredictorCall, RecurrentState};
use crate::core::key::KeyStream;
use crate::core::tree::ParamTree;
use rand::Rng;
use rand::seq::index;
use std::collections::BTreeMap;
use tracing::{debug, instrument, trace};

/// Ensemble members eligible for selection with template features.
pub const TEMPLATE_MODEL_POOL: usize = 2;
/// Ensemble members eligible for selection without template features.
pub const DEFAULT_MODEL_POOL: usize = 5;

/// Result of evaluating the current parameters.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub loss: f64,
    pub aux: AuxOutputs,
    /// Zero tree shaped like the parameters when no gradient was requested.
    pub grad: ParamTree,
}

/// Runs the predictor over the selected ensemble members and averages the
/// results. Borrowed per evaluation; all randomness comes from the caller's
/// key stream.
#[derive(Debug)]
pub struct Evaluator<'a, P: Predictor + ?Sized> {
    pub predictor: &'a P,
    pub recycle_mode: RecycleMode,
    pub use_templates: bool,
}

impl<'a, P: Predictor + ?Sized> Evaluator<'a, P> {
    pub fn new(predictor: &'a P, recycle_mode: RecycleMode, use_templates: bool) -> Self {
        Self {
            predictor,
            recycle_mode,
            use_templates,
        }
    }

    pub fn model_pool(&self) -> usize {
        if self.use_templates {
            TEMPLATE_MODEL_POOL
        } else {
            DEFAULT_MODEL_POOL
        }
    }

    /// Picks ensemble members: `min(opt.models, pool)` of them, a random
    /// subset when sampling is on and the pool is not exhausted.
    pub fn select_models(
        &self,
        opt: &DesignOptions,
        keys: &mut KeyStream,
    ) -> Result<Vec<usize>, EngineError> {
        if opt.models == 0 {
            return Err(EngineError::InvalidArgument {
                name: "models",
                reason: "at least one model must be selected".to_string(),
            });
        }
        let pool = self.model_pool();
        let count = opt.models.min(pool);
        let selected = if opt.sample_models && count < pool {
            let mut rng = keys.next_key().rng();
            index::sample(&mut rng, pool, count).into_vec()
        } else {
            (0..count).collect()
        };
        debug!(?selected, pool, requested = opt.models, "Selected models.");
        Ok(selected)
    }

    #[instrument(skip_all, name = "evaluate", fields(want_gradient = want_gradient))]
    pub fn evaluate(
        &self,
        params: &ParamTree,
        opt: &DesignOptions,
        keys: &mut KeyStream,
        want_gradient: bool,
    ) -> Result<Evaluation, EngineError> {
        let models = self.select_models(opt, keys)?;

        let results = models
            .iter()
            .map(|&model| self.recycle(params, model, opt, keys, want_gradient))
            .collect::<Result<Vec<_>, _>>()?;

        let loss = results.iter().map(|r| r.loss).sum::<f64>() / results.len() as f64;
        let grad = if want_gradient {
            let grads: Vec<ParamTree> = results.iter().map(|r| r.grad.clone()).collect();
            ParamTree::mean(&grads)?
        } else {
            params.zeros_like()
        };

        let mut totals: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for result in &results {
            for (term, value) in &result.aux.losses {
                let entry = totals.entry(term.clone()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }

        let mut results = results.into_iter();
        let mut aux = results
            .next()
            .map(|first| first.aux)
            .ok_or_else(|| EngineError::Internal("no model was evaluated".to_string()))?;
        aux.losses = totals
            .into_iter()
            .map(|(term, (sum, count))| (term, sum / count as f64))
            .collect();
        aux.model_num = models;

        Ok(Evaluation { loss, aux, grad })
    }

    /// Runs one ensemble member under the configured recycle mode, starting
    /// from a zeroed recurrent state.
    fn recycle(
        &self,
        params: &ParamTree,
        model: usize,
        opt: &DesignOptions,
        keys: &mut KeyStream,
        want_gradient: bool,
    ) -> Result<Evaluation, EngineError> {
        let mut call_opt = opt.clone();
        let mut prev = RecurrentState::zeros(self.predictor.sequence_len());

        match self.recycle_mode {
            RecycleMode::Average => {
                let calls = opt.recycles + 1;
                let mut grads = Vec::with_capacity(calls);
                let mut last = None;
                for _ in 0..calls {
                    let (loss, aux, grad) =
                        self.call_once(params, model, &prev, &call_opt, keys, want_gradient)?;
                    prev = aux.prev.clone();
                    grads.extend(grad);
                    last = Some((loss, aux));
                }
                let (loss, mut aux) = last.ok_or_else(|| {
                    EngineError::Internal("average recycling made no calls".to_string())
                })?;
                let grad = if want_gradient {
                    ParamTree::mean(&grads)?
                } else {
                    params.zeros_like()
                };
                aux.recycles = opt.recycles;
                trace!(model, calls, loss, "Averaged recycles.");
                return Ok(Evaluation { loss, aux, grad });
            }
            RecycleMode::Backprop | RecycleMode::AddPrev => {
                call_opt.recycles = self.predictor.num_recycle();
            }
            RecycleMode::Sample => {
                call_opt.recycles = keys.next_key().rng().gen_range(0..=opt.recycles);
                debug!(model, recycles = call_opt.recycles, "Sampled recycle count.");
            }
            RecycleMode::Last => {}
        }

        let (loss, mut aux, grad) =
            self.call_once(params, model, &prev, &call_opt, keys, want_gradient)?;
        aux.recycles = call_opt.recycles;
        trace!(model, recycles = aux.recycles, loss, "Model evaluated.");
        Ok(Evaluation {
            loss,
            aux,
            grad: grad.unwrap_or_else(|| params.zeros_like()),
        })
    }

    fn call_once(
        &self,
        params: &ParamTree,
        model: usize,
        prev: &RecurrentState,
        opt: &DesignOptions,
        keys: &mut KeyStream,
        want_gradient: bool,
    ) -> Result<(f64, AuxOutputs, Option<ParamTree>), EngineError> {
        let call = PredictorCall {
            params,
            model,
            prev,
            key: keys.next_key(),
            opt,
        };
        if want_gradient {
            let ((loss, aux), grad) = self.predictor.evaluate_with_gradient(&call)?;
            Ok((loss, aux, Some(grad)))
        } else {
            let (loss, aux) = self.predictor.evaluate(&call)?;
            Ok((loss, aux, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::predictor::scripted::ScriptedPredictor;
    use ndarray::Array3;

    const LEN: usize = 4;

    fn params() -> ParamTree {
        let seq = Array3::from_shape_fn((1, LEN, 20), |(_, i, a)| (i * 20 + a) as f64 * 0.01);
        ParamTree::from_entries([("seq", ParamTree::leaf(seq.into_dyn()))])
    }

    fn options(models: usize, sample_models: bool, recycles: usize) -> DesignOptions {
        DesignOptions {
            models,
            sample_models,
            recycles,
            ..DesignOptions::default()
        }
    }

    #[test]
    fn models_above_pool_are_clamped_in_order() {
        let predictor = ScriptedPredictor::new(LEN);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Last, false);
        let mut keys = KeyStream::new(Some(7));
        let eval = evaluator
            .evaluate(&params(), &options(100, true, 0), &mut keys, false)
            .unwrap();
        assert_eq!(eval.aux.model_num, vec![0, 1, 2, 3, 4]);
        let called: Vec<usize> = predictor.calls().iter().map(|c| c.model).collect();
        assert_eq!(called, vec![0, 1, 2, 3, 4]);
        assert_eq!(keys.consumed(), 5);
    }

    #[test]
    fn template_runs_use_the_smaller_pool() {
        let predictor = ScriptedPredictor::new(LEN);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Last, true);
        let mut keys = KeyStream::new(Some(7));
        let selected = evaluator
            .select_models(&options(5, true, 0), &mut keys)
            .unwrap();
        assert_eq!(selected, vec![0, 1]);
        assert_eq!(keys.consumed(), 0);

        for seed in 0..10 {
            let mut keys = KeyStream::new(Some(seed));
            let selected = evaluator
                .select_models(&options(1, true, 0), &mut keys)
                .unwrap();
            assert_eq!(keys.consumed(), 1);
            assert_eq!(selected.len(), 1);
            assert!(selected[0] < 2);
        }

        let mut keys = KeyStream::new(Some(3));
        let eval = evaluator
            .evaluate(&params(), &options(1, true, 0), &mut keys, false)
            .unwrap();
        assert_eq!(eval.aux.model_num.len(), 1);
        assert!(eval.aux.model_num[0] < 2);
        assert_eq!(keys.consumed(), 2);
    }

    #[test]
    fn sampled_models_are_distinct_and_reproducible() {
        let predictor = ScriptedPredictor::new(LEN);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Last, false);
        let pick = |seed| {
            let mut keys = KeyStream::new(Some(seed));
            let selected = evaluator
                .select_models(&options(3, true, 0), &mut keys)
                .unwrap();
            assert_eq!(keys.consumed(), 1);
            selected
        };
        let first = pick(11);
        assert_eq!(first, pick(11));
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|&m| m < 5));
        let mut unique = first.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn zero_models_is_rejected() {
        let predictor = ScriptedPredictor::new(LEN);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Last, false);
        let mut keys = KeyStream::new(Some(1));
        assert!(matches!(
            evaluator.select_models(&options(0, false, 0), &mut keys),
            Err(EngineError::InvalidArgument { name: "models", .. })
        ));
    }

    #[test]
    fn loss_and_terms_are_averaged_over_models() {
        let predictor = ScriptedPredictor::new(LEN).with_script(&[1.0, 3.0]);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Last, false);
        let mut keys = KeyStream::new(Some(3));
        let eval = evaluator
            .evaluate(&params(), &options(2, false, 0), &mut keys, true)
            .unwrap();
        assert_eq!(eval.loss, 2.0);
        assert_eq!(eval.aux.losses["plddt"], 2.0);
        assert_eq!(eval.aux.losses["model"], 0.5);
        // Scripted gradients are params + (model + 1); the mean adds 1.5.
        let g = eval.grad.leaf_at("seq").unwrap();
        let p = params();
        let p = p.leaf_at("seq").unwrap();
        assert!((g[[0, 1, 2]] - (p[[0, 1, 2]] + 1.5)).abs() < 1e-12);
    }

    #[test]
    fn no_gradient_yields_zero_tree() {
        let predictor = ScriptedPredictor::new(LEN);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Last, false);
        let mut keys = KeyStream::new(Some(3));
        let eval = evaluator
            .evaluate(&params(), &options(1, false, 0), &mut keys, false)
            .unwrap();
        assert!(eval.grad.leaf_at("seq").unwrap().iter().all(|v| *v == 0.0));
        assert!(predictor.calls().iter().all(|c| !c.with_gradient));
    }

    #[test]
    fn average_mode_chains_state_over_recycles() {
        let predictor = ScriptedPredictor::new(LEN).with_script(&[4.0, 3.0, 2.0, 1.0]);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Average, false);
        let mut keys = KeyStream::new(Some(5));
        let opt = options(1, false, 3);
        let eval = evaluator.evaluate(&params(), &opt, &mut keys, true).unwrap();

        let calls = predictor.calls();
        assert_eq!(calls.len(), 4);
        let markers: Vec<f64> = calls.iter().map(|c| c.prev_marker).collect();
        assert_eq!(markers, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(keys.consumed(), 4);
        let mut distinct: Vec<u64> = calls.iter().map(|c| c.key).collect();
        distinct.dedup();
        assert_eq!(distinct.len(), 4);

        assert_eq!(eval.loss, 1.0);
        assert_eq!(eval.aux.recycles, 3);
        assert_eq!(opt.recycles, 3);
    }

    #[test]
    fn average_mode_returns_mean_of_recycle_gradients() {
        let predictor = ScriptedPredictor::new(LEN);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Average, false);
        let mut keys = KeyStream::new(Some(5));
        let eval = evaluator
            .evaluate(&params(), &options(1, false, 3), &mut keys, true)
            .unwrap();

        // Recycle r sees marker r, so gradients are params + 1 + r for r in 0..=3.
        let g = eval.grad.leaf_at("seq").unwrap();
        let p = params();
        let p = p.leaf_at("seq").unwrap();
        for (got, base) in g.iter().zip(p.iter()) {
            assert!((got - (base + 1.0 + 1.5)).abs() < 1e-12);
        }
    }

    #[test]
    fn average_mode_without_gradient_yields_zero_tree() {
        let predictor = ScriptedPredictor::new(LEN);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Average, false);
        let mut keys = KeyStream::new(Some(5));
        let eval = evaluator
            .evaluate(&params(), &options(1, false, 2), &mut keys, false)
            .unwrap();
        assert_eq!(predictor.calls().len(), 3);
        assert!(eval.grad.leaf_at("seq").unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn every_model_starts_from_zero_state() {
        let predictor = ScriptedPredictor::new(LEN);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Average, false);
        let mut keys = KeyStream::new(Some(5));
        evaluator
            .evaluate(&params(), &options(2, false, 1), &mut keys, false)
            .unwrap();
        let markers: Vec<f64> = predictor.calls().iter().map(|c| c.prev_marker).collect();
        assert_eq!(markers, vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn backprop_mode_uses_predictor_recycles_for_the_call_only() {
        let predictor = ScriptedPredictor::new(LEN);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Backprop, false);
        let mut keys = KeyStream::new(Some(5));
        let opt = options(1, false, 0);
        let eval = evaluator.evaluate(&params(), &opt, &mut keys, true).unwrap();
        assert_eq!(predictor.calls()[0].recycles, 3);
        assert_eq!(eval.aux.recycles, 3);
        assert_eq!(opt.recycles, 0);
    }

    #[test]
    fn add_prev_mode_makes_one_call_with_predictor_recycles() {
        let mut predictor = ScriptedPredictor::new(LEN);
        predictor.num_recycle = 2;
        let evaluator = Evaluator::new(&predictor, RecycleMode::AddPrev, false);
        let mut keys = KeyStream::new(Some(5));
        let opt = options(1, false, 0);
        let eval = evaluator.evaluate(&params(), &opt, &mut keys, true).unwrap();

        let calls = predictor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].recycles, 2);
        assert_eq!(calls[0].prev_marker, 0.0);
        assert_eq!(eval.aux.recycles, 2);
        assert_eq!(opt.recycles, 0);
        assert_eq!(keys.consumed(), 1);
        let g = eval.grad.leaf_at("seq").unwrap();
        let p = params();
        assert!((g[[0, 2, 3]] - (p.leaf_at("seq").unwrap()[[0, 2, 3]] + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn sample_mode_draws_count_within_bounds() {
        let predictor = ScriptedPredictor::new(LEN);
        let evaluator = Evaluator::new(&predictor, RecycleMode::Sample, false);
        for seed in 0..20 {
            predictor.clear_calls();
            let mut keys = KeyStream::new(Some(seed));
            let eval = evaluator
                .evaluate(&params(), &options(1, false, 2), &mut keys, false)
                .unwrap();
            let call = &predictor.calls()[0];
            assert!(call.recycles <= 2);
            assert_eq!(eval.aux.recycles, call.recycles);
            assert_eq!(keys.consumed(), 2);
        }
    }
}
