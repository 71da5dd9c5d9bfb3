use super::config::{DesignOptions, LossWeights, OptionOverrides, SessionConfig};
use super::error::EngineError;
use super::evaluation::{Evaluation, Evaluator};
use super::optimizer::{Optimizer, OptimizerChoice, OptimizerState, Sgd};
use super::predictor::{AuxOutputs, Predictor};
use super::progress::{Progress, ProgressReporter};
use super::report::summary_line;
use super::state::{BestTracker, LossRecord, Trajectory};
use crate::core::alphabet::{ALPHABET_SIZE, parse_sequence, sequence_to_string};
use crate::core::key::{KeyStream, PrngKey};
use crate::core::sequence::{argmax_rows, design_rows, normalize_gradient, one_hot, sequence_identity};
use crate::core::tree::ParamTree;
use ndarray::{Array2, Array3, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::{info, instrument};

const SEED_LOGIT_SCALE: f64 = 0.01;

/// Starting point for the design logits on restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SeedSequence {
    /// Small Gaussian logits drawn with one key.
    #[default]
    Random,
    /// One-hot logits of a sequence; `X` rows stay zero.
    Sequence(String),
    /// Explicit `[L, A]` logits.
    Logits(Array2<f64>),
}

#[derive(Debug, Default)]
pub struct RestartOptions {
    /// Key-stream seed; a random one when absent.
    pub seed: Option<u64>,
    pub optimizer: OptimizerChoice,
    pub opt: Option<OptionOverrides>,
    pub weights: Option<LossWeights>,
    pub seq: SeedSequence,
    /// Keep the trajectory and best snapshot.
    pub keep_history: bool,
    /// Start the live options from the pristine baseline.
    pub reset_opt: bool,
}

impl RestartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn optimizer(mut self, optimizer: impl Into<OptimizerChoice>) -> Self {
        self.optimizer = optimizer.into();
        self
    }

    pub fn opt(mut self, overrides: OptionOverrides) -> Self {
        self.opt = Some(overrides);
        self
    }

    pub fn weights(mut self, weights: LossWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn seq(mut self, seq: SeedSequence) -> Self {
        self.seq = seq;
        self
    }

    pub fn keep_history(mut self, keep: bool) -> Self {
        self.keep_history = keep;
        self
    }

    pub fn reset_opt(mut self, reset: bool) -> Self {
        self.reset_opt = reset;
        self
    }
}

/// Per-step behaviour shared by every driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSettings {
    pub backprop: bool,
    pub save_best: bool,
    /// Emit a summary every `verbose` steps; 0 disables it.
    pub verbose: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            backprop: true,
            save_best: false,
            verbose: 1,
        }
    }
}

impl RunSettings {
    pub fn quiet() -> Self {
        Self {
            verbose: 0,
            ..Self::default()
        }
    }
}

/// A design run against one predictor: parameters, optimizer state, live
/// options, random keys and the recorded history.
pub struct DesignSession<P: Predictor> {
    predictor: P,
    config: SessionConfig,
    baseline: DesignOptions,
    opt: DesignOptions,
    keys: KeyStream,
    optimizer: Box<dyn Optimizer>,
    opt_state: OptimizerState,
    params: ParamTree,
    loss: Option<f64>,
    aux: Option<AuxOutputs>,
    grad: Option<ParamTree>,
    step: usize,
    trajectory: Trajectory,
    best: BestTracker,
    reporter: ProgressReporter<'static>,
}

impl<P: Predictor> DesignSession<P> {
    /// Creates a session and performs an initial [`restart`](Self::restart)
    /// with a random seed.
    pub fn new(predictor: P, config: SessionConfig) -> Result<Self, EngineError> {
        let pool = Evaluator::new(&predictor, config.recycle_mode, config.use_templates).model_pool();
        if predictor.model_count() < pool {
            return Err(EngineError::Initialization(format!(
                "predictor provides {} model(s) but {} are required",
                predictor.model_count(),
                pool
            )));
        }
        let needed = config.target_len + config.design_len;
        if predictor.sequence_len() < needed {
            return Err(EngineError::Initialization(format!(
                "predictor models {} residues but the design needs {}",
                predictor.sequence_len(),
                needed
            )));
        }

        let mut baseline = config.options.clone();
        for (term, weight) in predictor.default_weights() {
            baseline.weights.entry(term).or_insert(weight);
        }
        baseline.validate()?;
        config.check_reference(&baseline)?;

        let params = seq_params(Array3::zeros((1, config.design_len, ALPHABET_SIZE)));
        let optimizer: Box<dyn Optimizer> = Box::new(Sgd::default());
        let opt_state = optimizer.init_state(params.clone());

        let mut session = Self {
            predictor,
            opt: baseline.clone(),
            baseline,
            config,
            keys: KeyStream::new(None),
            optimizer,
            opt_state,
            params,
            loss: None,
            aux: None,
            grad: None,
            step: 0,
            trajectory: Trajectory::new(),
            best: BestTracker::new(),
            reporter: ProgressReporter::new(),
        };
        session.restart(RestartOptions::new())?;
        Ok(session)
    }

    pub fn with_reporter(mut self, reporter: ProgressReporter<'static>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Reseeds the keys, reinitializes the logits and the optimizer, and
    /// resets the step counter. History is cleared unless `keep_history`.
    ///
    /// A named optimizer sets its default learning rate before `opt`
    /// overrides are applied, so an explicit `lr` override wins.
    #[instrument(skip_all, name = "restart")]
    pub fn restart(&mut self, options: RestartOptions) -> Result<(), EngineError> {
        let RestartOptions {
            seed,
            optimizer,
            opt,
            weights,
            seq,
            keep_history,
            reset_opt,
        } = options;

        let mut live = if reset_opt {
            self.baseline.clone()
        } else {
            self.opt.clone()
        };
        let (optimizer, default_lr) = optimizer.resolve();
        if let Some(lr) = default_lr {
            live.lr = lr;
        }
        if let Some(overrides) = &opt {
            overrides.apply_to(&mut live);
        }
        if let Some(weights) = weights {
            live.weights.extend(weights);
        }
        live.validate()?;
        self.config.check_reference(&live)?;

        let mut keys = KeyStream::new(seed);
        let params = self.initial_params(&seq, &mut keys)?;

        self.opt = live;
        self.keys = keys;
        self.opt_state = optimizer.init_state(params.clone());
        self.optimizer = optimizer;
        self.params = params;
        self.loss = None;
        self.aux = None;
        self.grad = None;
        self.step = 0;
        if !keep_history {
            self.trajectory.clear();
            self.best.reset();
        }

        info!(
            seed = self.keys.seed(),
            optimizer = ?self.optimizer,
            lr = self.opt.lr,
            keep_history,
            reset_opt,
            "Session restarted."
        );
        Ok(())
    }

    fn initial_params(
        &self,
        seq: &SeedSequence,
        keys: &mut KeyStream,
    ) -> Result<ParamTree, EngineError> {
        let len = self.config.design_len;
        let logits = match seq {
            SeedSequence::Random => {
                let mut rng = keys.next_key().rng();
                Array3::from_shape_fn((1, len, ALPHABET_SIZE), |_| {
                    SEED_LOGIT_SCALE * rng.sample::<f64, _>(StandardNormal)
                })
            }
            SeedSequence::Sequence(text) => {
                let indices = parse_sequence(text)?;
                if indices.len() != len {
                    return Err(EngineError::InvalidArgument {
                        name: "seq",
                        reason: format!(
                            "seed sequence has {} residues, expected {}",
                            indices.len(),
                            len
                        ),
                    });
                }
                one_hot(&indices, ALPHABET_SIZE).insert_axis(Axis(0))
            }
            SeedSequence::Logits(logits) => {
                if logits.dim() != (len, ALPHABET_SIZE) {
                    return Err(EngineError::InvalidArgument {
                        name: "seq",
                        reason: format!(
                            "seed logits are {:?}, expected {:?}",
                            logits.dim(),
                            (len, ALPHABET_SIZE)
                        ),
                    });
                }
                logits.clone().insert_axis(Axis(0))
            }
        };
        Ok(seq_params(logits))
    }

    /// Applies `overrides` to the live options. Nothing changes if the
    /// result would be invalid.
    pub fn set_opt(&mut self, overrides: &OptionOverrides) -> Result<(), EngineError> {
        if overrides.is_empty() {
            return Ok(());
        }
        let mut live = self.opt.clone();
        overrides.apply_to(&mut live);
        live.validate()?;
        self.config.check_reference(&live)?;
        self.opt = live;
        Ok(())
    }

    /// Merges `weights` into the live loss weights.
    pub fn set_weights(&mut self, weights: &LossWeights) -> Result<(), EngineError> {
        if weights.is_empty() {
            return Ok(());
        }
        let mut live = self.opt.clone();
        live.weights
            .extend(weights.iter().map(|(k, v)| (k.clone(), *v)));
        live.validate()?;
        self.opt = live;
        Ok(())
    }

    /// Evaluates the current parameters and stores loss, outputs and
    /// gradient (a zero tree when `backprop` is off).
    pub fn run(&mut self, backprop: bool) -> Result<(), EngineError> {
        let Evaluation { loss, aux, grad } = Evaluator::new(
            &self.predictor,
            self.config.recycle_mode,
            self.config.use_templates,
        )
        .evaluate(&self.params, &self.opt, &mut self.keys, backprop)?;
        self.loss = Some(loss);
        self.aux = Some(aux);
        self.grad = Some(grad);
        Ok(())
    }

    /// One gradient step: evaluate, call `callback`, normalize the sequence
    /// gradient to norm `sqrt(L)`, scale by `lr_scale * lr`, update, record.
    #[instrument(skip_all, name = "step", fields(step = self.step, lr_scale = lr_scale))]
    pub fn step(
        &mut self,
        lr_scale: f64,
        settings: &RunSettings,
        mut callback: impl FnMut(&Self),
    ) -> Result<(), EngineError> {
        self.run(settings.backprop)?;
        callback(&*self);

        let mut grad = self
            .grad
            .take()
            .ok_or_else(|| EngineError::Internal("evaluation stored no gradient".to_string()))?;
        normalize_gradient(grad.leaf_at_mut("seq")?, self.config.design_len)?;
        let grad = grad.scaled(self.opt.lr * lr_scale);

        let state = self
            .optimizer
            .update(self.step, &grad, self.opt_state.clone())?;
        self.params = self.optimizer.params(&state);
        self.opt_state = state;
        self.grad = Some(grad);
        self.step += 1;

        self.save_results(settings.save_best, settings.verbose)
    }

    /// Updates the best snapshot, appends to the trajectory and emits the
    /// summary line every `verbose` steps.
    pub fn save_results(&mut self, save_best: bool, verbose: usize) -> Result<(), EngineError> {
        let (loss, aux) = match (self.loss, &self.aux) {
            (Some(loss), Some(aux)) => (loss, aux),
            _ => {
                return Err(EngineError::InvalidArgument {
                    name: "save_results",
                    reason: "no evaluation has been run since the last restart".to_string(),
                });
            }
        };

        if save_best {
            self.best.offer(loss, aux, self.step);
        }

        let seqid = if self.config.scores_sequence_recovery() {
            let designed = argmax_rows(aux.seq.hard.view());
            let reference = self.config.wild_type.as_deref().unwrap_or_default();
            Some(sequence_identity(&designed, reference, self.opt.pos.as_deref())?)
        } else {
            None
        };

        let record = LossRecord {
            terms: aux.losses.clone(),
            models: aux.model_num.clone(),
            recycles: aux.recycles,
            hard: self.opt.hard,
            soft: self.opt.soft,
            temp: self.opt.temp,
            loss,
            seqid,
        };

        if verbose > 0 && self.step % verbose == 0 {
            let line = summary_line(self.step, &record, &self.opt.weights);
            info!("{}", line);
            self.reporter.report(Progress::StepSummary {
                step: self.step,
                loss,
                line,
            });
        }

        self.trajectory.push(record, aux);
        Ok(())
    }

    /// Evaluates `params` with the live options without touching session
    /// state other than the key stream.
    pub(crate) fn evaluate_candidate(
        &mut self,
        params: &ParamTree,
    ) -> Result<Evaluation, EngineError> {
        Evaluator::new(
            &self.predictor,
            self.config.recycle_mode,
            self.config.use_templates,
        )
        .evaluate(params, &self.opt, &mut self.keys, false)
    }

    /// Makes `params` and its evaluation current, keeping the optimizer in
    /// sync with the new parameters.
    pub(crate) fn accept(&mut self, params: ParamTree, evaluation: Evaluation) {
        self.opt_state.params = params.clone();
        self.params = params;
        self.loss = Some(evaluation.loss);
        self.aux = Some(evaluation.aux);
        self.grad = Some(evaluation.grad);
    }

    pub(crate) fn advance_step(&mut self) {
        self.step += 1;
    }

    pub(crate) fn next_key(&mut self) -> PrngKey {
        self.keys.next_key()
    }

    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn options(&self) -> &DesignOptions {
        &self.opt
    }

    pub fn baseline_options(&self) -> &DesignOptions {
        &self.baseline
    }

    pub fn params(&self) -> &ParamTree {
        &self.params
    }

    pub fn loss(&self) -> Option<f64> {
        self.loss
    }

    pub fn aux(&self) -> Option<&AuxOutputs> {
        self.aux.as_ref()
    }

    /// Gradient applied by the last step (normalized and scaled), or the raw
    /// gradient of the last [`run`](Self::run).
    pub fn grad(&self) -> Option<&ParamTree> {
        self.grad.as_ref()
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn best(&self) -> &BestTracker {
        &self.best
    }

    pub fn key_stream(&self) -> &KeyStream {
        &self.keys
    }

    pub fn reporter(&self) -> &ProgressReporter<'static> {
        &self.reporter
    }

    pub fn design_len(&self) -> usize {
        self.config.design_len
    }

    /// Residue indices of the current logits (argmax per position).
    pub fn current_sequence(&self) -> Result<Vec<usize>, EngineError> {
        let logits = design_rows(self.params.leaf_at("seq")?)?;
        Ok(argmax_rows(logits))
    }

    pub fn current_sequence_string(&self) -> Result<String, EngineError> {
        Ok(sequence_to_string(&self.current_sequence()?))
    }

    /// One-letter sequence of the best snapshot, if one was saved.
    pub fn best_sequence_string(&self) -> Option<String> {
        self.best
            .snapshot()
            .map(|best| sequence_to_string(&argmax_rows(best.aux.seq.pseudo.view())))
    }
}

impl<P: Predictor> std::fmt::Debug for DesignSession<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesignSession")
            .field("protocol", &self.config.protocol)
            .field("design_len", &self.config.design_len)
            .field("step", &self.step)
            .field("loss", &self.loss)
            .field("trajectory_len", &self.trajectory.len())
            .finish()
    }
}

fn seq_params(logits: Array3<f64>) -> ParamTree {
    ParamTree::from_entries([("seq", ParamTree::leaf(logits.into_dyn()))])
}
