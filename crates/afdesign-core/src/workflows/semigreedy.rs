use crate::core::alphabet::ALPHABET_SIZE;
use crate::core::sequence::one_hot;
use crate::core::tree::{ParamTree, Tensor};
use crate::engine::config::{OptionOverrides, Protocol};
use crate::engine::error::EngineError;
use crate::engine::evaluation::Evaluation;
use crate::engine::predictor::Predictor;
use crate::engine::progress::Progress;
use crate::engine::session::DesignSession;
use ndarray::{Axis, s};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SemigreedySettings {
    pub iters: usize,
    /// Candidate mutations evaluated per iteration.
    pub tries: usize,
    pub models: usize,
    /// Bias mutated positions towards low per-residue confidence.
    pub use_plddt: bool,
    pub save_best: bool,
    pub verbose: usize,
}

impl Default for SemigreedySettings {
    fn default() -> Self {
        Self {
            iters: 100,
            tries: 20,
            models: 1,
            use_plddt: true,
            save_best: true,
            verbose: 1,
        }
    }
}

impl<P: Predictor> DesignSession<P> {
    /// Discrete search over single-point mutations of the current argmax
    /// sequence. Each iteration evaluates `tries` candidates without
    /// gradients and keeps the one with the lowest loss (the first on ties).
    #[instrument(skip_all, name = "design_semigreedy", fields(iters = settings.iters, tries = settings.tries))]
    pub fn design_semigreedy(&mut self, settings: &SemigreedySettings) -> Result<(), EngineError> {
        if settings.iters == 0 {
            return Err(EngineError::InvalidArgument {
                name: "iters",
                reason: "at least one iteration is required".to_string(),
            });
        }
        if settings.tries == 0 {
            return Err(EngineError::InvalidArgument {
                name: "tries",
                reason: "at least one candidate per iteration is required".to_string(),
            });
        }

        self.set_opt(
            &OptionOverrides::new()
                .hard(1.0)
                .dropout(false)
                .models(settings.models)
                .sample_models(false),
        )?;
        if self.step_count() == 0 {
            self.run(false)?;
        }
        info!(
            iters = settings.iters,
            tries = settings.tries,
            use_plddt = settings.use_plddt,
            "Starting semigreedy search."
        );

        self.reporter().report(Progress::TaskStart {
            total_steps: settings.iters as u64,
        });
        for _ in 0..settings.iters {
            let current = self.current_sequence()?;
            let bias = if settings.use_plddt {
                self.mutation_bias()?
            } else {
                None
            };

            let mut best: Option<(ParamTree, Evaluation)> = None;
            for attempt in 0..settings.tries {
                let candidate = self.mutate(&current, bias.as_ref())?;
                let evaluation = self.evaluate_candidate(&candidate)?;
                trace!(attempt, loss = evaluation.loss, "Candidate evaluated.");
                if best
                    .as_ref()
                    .is_none_or(|(_, kept)| evaluation.loss < kept.loss)
                {
                    best = Some((candidate, evaluation));
                }
            }

            let (params, evaluation) = best.ok_or_else(|| {
                EngineError::StageFailed {
                    stage: "semigreedy",
                    reason: "no candidate was evaluated".to_string(),
                }
            })?;
            debug!(loss = evaluation.loss, "Accepted mutation.");
            self.accept(params, evaluation);
            self.advance_step();
            self.save_results(settings.save_best, settings.verbose)?;
            self.reporter().report(Progress::TaskIncrement);
        }
        self.reporter().report(Progress::TaskFinish);
        Ok(())
    }

    /// Sampling weights `1 - plddt` over the designed positions, or `None`
    /// when every position is fully confident.
    fn mutation_bias(&self) -> Result<Option<WeightedIndex<f64>>, EngineError> {
        let aux = self.aux().ok_or_else(|| EngineError::StageFailed {
            stage: "semigreedy",
            reason: "no evaluation available to bias mutations".to_string(),
        })?;
        let len = self.design_len();
        let start = match self.config().protocol {
            Protocol::Binder => self.config().target_len,
            _ => 0,
        };
        if aux.plddt.len() < start + len {
            return Err(EngineError::StageFailed {
                stage: "semigreedy",
                reason: format!(
                    "confidence covers {} residues, designed region ends at {}",
                    aux.plddt.len(),
                    start + len
                ),
            });
        }
        let weights: Vec<f64> = aux
            .plddt
            .slice(s![start..start + len])
            .iter()
            .map(|p| (1.0 - p).max(0.0))
            .collect();
        match WeightedIndex::new(&weights) {
            Ok(index) => Ok(Some(index)),
            Err(e) => {
                warn!(error = %e, "Confidence bias is degenerate; sampling positions uniformly.");
                Ok(None)
            }
        }
    }

    /// One-hot `current` with one position switched to a different residue.
    fn mutate(
        &mut self,
        current: &[usize],
        bias: Option<&WeightedIndex<f64>>,
    ) -> Result<ParamTree, EngineError> {
        let len = current.len();
        let (position, residue) = loop {
            let position = match bias {
                Some(weights) => weights.sample(&mut self.next_key().rng()),
                None => self.next_key().rng().gen_range(0..len),
            };
            let residue = self.next_key().rng().gen_range(0..ALPHABET_SIZE);
            if current[position] != residue {
                break (position, residue);
            }
        };

        let mut mutated = current.to_vec();
        mutated[position] = residue;
        let seq: Tensor = one_hot(&mutated, ALPHABET_SIZE)
            .insert_axis(Axis(0))
            .into_dyn();
        let mut params = self.params().clone();
        *params.leaf_at_mut("seq")? = seq;
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alphabet::parse_sequence;
    use crate::engine::config::{DesignOptions, SessionConfig, SessionConfigBuilder};
    use crate::engine::predictor::scripted::ScriptedPredictor;
    use crate::engine::session::{RestartOptions, RunSettings, SeedSequence};

    const LEN: usize = 5;

    fn config(protocol: Protocol, design_len: usize, target_len: usize) -> SessionConfig {
        let mut builder = SessionConfigBuilder::new()
            .protocol(protocol)
            .design_len(design_len)
            .options(DesignOptions::default());
        if protocol == Protocol::Binder {
            builder = builder.target_len(target_len);
        }
        builder.build().unwrap()
    }

    fn session_with(predictor: ScriptedPredictor, config: SessionConfig) -> DesignSession<ScriptedPredictor> {
        let mut session = DesignSession::new(predictor, config).unwrap();
        session
            .restart(
                RestartOptions::new()
                    .seed(23)
                    .seq(SeedSequence::Sequence("MKVLA".to_string())),
            )
            .unwrap();
        session.predictor().clear_calls();
        session
    }

    fn settings(iters: usize, tries: usize, use_plddt: bool) -> SemigreedySettings {
        SemigreedySettings {
            iters,
            tries,
            models: 1,
            use_plddt,
            save_best: true,
            verbose: 0,
        }
    }

    fn differing_positions(a: &[usize], b: &[usize]) -> Vec<usize> {
        a.iter()
            .zip(b)
            .enumerate()
            .filter(|(_, (x, y))| x != y)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn accepts_lowest_loss_candidate() {
        let predictor = ScriptedPredictor::new(LEN).with_script(&[9.0, 2.0, 0.5, 1.0]);
        let mut session = session_with(predictor, config(Protocol::Hallucination, LEN, 0));
        session.design_semigreedy(&settings(1, 3, false)).unwrap();

        let calls = session.predictor().calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(session.loss(), Some(0.5));
        assert_eq!(session.current_sequence().unwrap(), calls[2].argmax);
        assert_eq!(session.step_count(), 1);
        assert_eq!(session.trajectory().len(), 1);
        assert_eq!(session.best().best_loss(), 0.5);

        let original = parse_sequence("MKVLA").unwrap();
        for call in &calls[1..] {
            assert_eq!(differing_positions(&original, &call.argmax).len(), 1);
            assert!(!call.with_gradient);
            assert_eq!(call.hard, 1.0);
            assert!(!call.dropout);
        }
    }

    #[test]
    fn ties_keep_the_first_candidate() {
        let predictor = ScriptedPredictor::new(LEN).with_script(&[9.0, 1.0, 1.0]);
        let mut session = session_with(predictor, config(Protocol::Hallucination, LEN, 0));
        session.design_semigreedy(&settings(1, 2, false)).unwrap();
        let calls = session.predictor().calls();
        assert_eq!(session.current_sequence().unwrap(), calls[1].argmax);
    }

    #[test]
    fn skips_initial_evaluation_after_steps() {
        let predictor = ScriptedPredictor::new(LEN);
        let mut session = session_with(predictor, config(Protocol::Hallucination, LEN, 0));
        session.step(1.0, &RunSettings::quiet(), |_| {}).unwrap();
        session.predictor().clear_calls();
        session.design_semigreedy(&settings(2, 3, false)).unwrap();
        assert_eq!(session.predictor().calls().len(), 6);
        assert_eq!(session.step_count(), 3);
    }

    #[test]
    fn sets_discrete_options() {
        let predictor = ScriptedPredictor::new(LEN);
        let mut session = session_with(predictor, config(Protocol::Hallucination, LEN, 0));
        session.design_semigreedy(&settings(1, 1, false)).unwrap();
        let opt = session.options();
        assert_eq!(opt.hard, 1.0);
        assert!(!opt.dropout);
        assert!(!opt.sample_models);
        assert_eq!(opt.models, 1);
    }

    #[test]
    fn rejects_zero_iterations_or_tries() {
        let predictor = ScriptedPredictor::new(LEN);
        let mut session = session_with(predictor, config(Protocol::Hallucination, LEN, 0));
        assert!(matches!(
            session.design_semigreedy(&settings(0, 3, false)),
            Err(EngineError::InvalidArgument { name: "iters", .. })
        ));
        assert!(matches!(
            session.design_semigreedy(&settings(1, 0, false)),
            Err(EngineError::InvalidArgument { name: "tries", .. })
        ));
        assert!(session.predictor().calls().is_empty());
    }

    #[test]
    fn plddt_bias_targets_unconfident_positions() {
        let predictor = ScriptedPredictor::new(LEN).with_plddt(vec![1.0, 1.0, 0.2, 1.0, 1.0]);
        let mut session = session_with(predictor, config(Protocol::Hallucination, LEN, 0));
        session.design_semigreedy(&settings(3, 4, true)).unwrap();

        let calls = session.predictor().calls();
        let mut previous = parse_sequence("MKVLA").unwrap();
        for chunk in calls[1..].chunks(4) {
            for call in chunk {
                assert_eq!(differing_positions(&previous, &call.argmax), vec![2]);
            }
            // Every candidate scores the model index (0), so the first is kept.
            previous = chunk[0].argmax.clone();
        }
        assert_eq!(session.current_sequence().unwrap(), previous);
    }

    #[test]
    fn fully_confident_structure_falls_back_to_uniform() {
        let predictor = ScriptedPredictor::new(LEN).with_plddt(vec![1.0; LEN]);
        let mut session = session_with(predictor, config(Protocol::Hallucination, LEN, 0));
        session.design_semigreedy(&settings(2, 3, true)).unwrap();
        assert_eq!(session.step_count(), 2);
    }

    #[test]
    fn binder_bias_reads_positions_after_target() {
        let predictor =
            ScriptedPredictor::new(8).with_plddt(vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.1, 1.0]);
        let mut session = session_with(predictor, config(Protocol::Binder, LEN, 3));
        session.design_semigreedy(&settings(1, 5, true)).unwrap();

        let original = parse_sequence("MKVLA").unwrap();
        for call in &session.predictor().calls()[1..] {
            assert_eq!(differing_positions(&original, &call.argmax), vec![3]);
        }
    }
}
