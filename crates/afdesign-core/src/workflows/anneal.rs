use crate::engine::config::{LossWeights, OptionOverrides};
use crate::engine::error::EngineError;
use crate::engine::predictor::Predictor;
use crate::engine::progress::Progress;
use crate::engine::session::{DesignSession, RunSettings};
use tracing::{debug, info, instrument};

/// Number of ensemble members used by the final hard stage of the presets.
pub const HARD_STAGE_MODELS: usize = 5;
/// Temperature reached at the end of the presets' temperature stage.
pub const FINAL_TEMPERATURE: f64 = 1e-2;

/// Start and end values for one annealing run. Unset starts default to the
/// current option values; unset ends default to the start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnealSchedule {
    pub soft: Option<f64>,
    pub e_soft: Option<f64>,
    pub temp: Option<f64>,
    pub e_temp: Option<f64>,
    pub hard: Option<f64>,
    pub e_hard: Option<f64>,
    /// Option overrides applied once before the first iteration.
    pub opt: Option<OptionOverrides>,
    pub weights: Option<LossWeights>,
    pub dropout: Option<bool>,
}

impl AnnealSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn soft(mut self, start: f64) -> Self {
        self.soft = Some(start);
        self
    }

    pub fn soft_to(mut self, end: f64) -> Self {
        self.e_soft = Some(end);
        self
    }

    pub fn temp(mut self, start: f64) -> Self {
        self.temp = Some(start);
        self
    }

    pub fn temp_to(mut self, end: f64) -> Self {
        self.e_temp = Some(end);
        self
    }

    pub fn hard(mut self, start: f64) -> Self {
        self.hard = Some(start);
        self
    }

    pub fn hard_to(mut self, end: f64) -> Self {
        self.e_hard = Some(end);
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

    pub fn dropout(mut self, dropout: bool) -> Self {
        self.dropout = Some(dropout);
        self
    }
}

/// Iteration counts and ensemble settings of the staged presets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagedDesign {
    pub soft_iters: usize,
    pub temp_iters: usize,
    pub hard_iters: usize,
    pub models: usize,
    pub dropout: bool,
}

impl StagedDesign {
    pub fn two_stage() -> Self {
        Self {
            soft_iters: 100,
            temp_iters: 100,
            hard_iters: 50,
            models: 1,
            dropout: true,
        }
    }

    pub fn three_stage() -> Self {
        Self {
            soft_iters: 300,
            temp_iters: 100,
            hard_iters: 10,
            models: 1,
            dropout: true,
        }
    }
}

/// Fixed discretization used while template features are phased out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplatePredesign {
    pub soft: f64,
    pub hard: f64,
    pub temp: f64,
    pub dropout: bool,
}

impl Default for TemplatePredesign {
    fn default() -> Self {
        Self {
            soft: 1.0,
            hard: 0.0,
            temp: 1.0,
            dropout: true,
        }
    }
}

/// Quadratic temperature decay: `end + (start - end) * (1 - fraction)^2`.
pub fn anneal_temperature(start: f64, end: f64, fraction: f64) -> f64 {
    end + (start - end) * (1.0 - fraction).powi(2)
}

/// Learning-rate multiplier that shrinks with temperature as the sequence
/// becomes softmax-driven.
pub fn temperature_lr_scale(soft: f64, temp: f64) -> f64 {
    (1.0 - soft) + soft * temp
}

fn require_iters(iters: usize) -> Result<(), EngineError> {
    if iters == 0 {
        return Err(EngineError::InvalidArgument {
            name: "iters",
            reason: "at least one iteration is required".to_string(),
        });
    }
    Ok(())
}

impl<P: Predictor> DesignSession<P> {
    /// Runs `iters` gradient steps while interpolating `soft` and `hard`
    /// linearly and `temp` quadratically between the schedule's endpoints.
    #[instrument(skip_all, name = "design", fields(iters = iters))]
    pub fn design(
        &mut self,
        iters: usize,
        schedule: &AnnealSchedule,
        settings: &RunSettings,
        mut callback: impl FnMut(&Self),
    ) -> Result<(), EngineError> {
        require_iters(iters)?;

        let mut overrides = schedule.opt.clone().unwrap_or_default();
        if let Some(dropout) = schedule.dropout {
            overrides = overrides.dropout(dropout);
        }
        self.set_opt(&overrides)?;
        if let Some(weights) = &schedule.weights {
            self.set_weights(weights)?;
        }

        let opt = self.options();
        let soft = schedule.soft.unwrap_or(opt.soft);
        let temp = schedule.temp.unwrap_or(opt.temp);
        let hard = schedule.hard.unwrap_or(opt.hard);
        let e_soft = schedule.e_soft.unwrap_or(soft);
        let e_temp = schedule.e_temp.unwrap_or(temp);
        let e_hard = schedule.e_hard.unwrap_or(hard);
        debug!(
            soft, e_soft, temp, e_temp, hard, e_hard,
            "Annealing schedule resolved."
        );

        self.reporter().report(Progress::TaskStart {
            total_steps: iters as u64,
        });
        for i in 0..iters {
            let f = (i + 1) as f64 / iters as f64;
            self.set_opt(
                &OptionOverrides::new()
                    .soft(soft + (e_soft - soft) * f)
                    .hard(hard + (e_hard - hard) * f)
                    .temp(anneal_temperature(temp, e_temp, f)),
            )?;
            let opt = self.options();
            let lr_scale = temperature_lr_scale(opt.soft, opt.temp);
            self.step(lr_scale, settings, &mut callback)?;
            self.reporter().report(Progress::TaskIncrement);
        }
        self.reporter().report(Progress::TaskFinish);
        Ok(())
    }

    /// Optimizes raw logits (`soft = 0`, `hard = 0`).
    pub fn design_logits(
        &mut self,
        iters: usize,
        schedule: &AnnealSchedule,
        settings: &RunSettings,
        callback: impl FnMut(&Self),
    ) -> Result<(), EngineError> {
        let schedule = schedule.clone().soft(0.0).hard(0.0);
        self.design(iters, &schedule, settings, callback)
    }

    /// Optimizes `softmax(logits / temp)` (`soft = 1`, `hard = 0`).
    pub fn design_soft(
        &mut self,
        iters: usize,
        schedule: &AnnealSchedule,
        settings: &RunSettings,
        callback: impl FnMut(&Self),
    ) -> Result<(), EngineError> {
        let schedule = schedule.clone().soft(1.0).hard(0.0);
        self.design(iters, &schedule, settings, callback)
    }

    /// Optimizes the straight-through `argmax(logits)` (`soft = 1`, `hard = 1`).
    pub fn design_hard(
        &mut self,
        iters: usize,
        schedule: &AnnealSchedule,
        settings: &RunSettings,
        callback: impl FnMut(&Self),
    ) -> Result<(), EngineError> {
        let schedule = schedule.clone().soft(1.0).hard(1.0);
        self.design(iters, &schedule, settings, callback)
    }

    /// Soft stage, temperature stage, then a hard stage over all models that
    /// keeps the best result.
    #[instrument(skip_all, name = "design_2stage")]
    pub fn design_2stage(
        &mut self,
        plan: &StagedDesign,
        settings: &RunSettings,
        mut callback: impl FnMut(&Self),
    ) -> Result<(), EngineError> {
        info!(?plan, "Starting two-stage design.");
        self.set_opt(&OptionOverrides::new().models(plan.models).sample_models(true))?;

        let soft = AnnealSchedule::new().soft(1.0).temp(1.0).dropout(plan.dropout);
        self.run_stage("Soft", plan.soft_iters, &soft, settings, &mut callback)?;

        let temp = soft.clone().temp_to(FINAL_TEMPERATURE);
        self.run_stage("Temperature", plan.temp_iters, &temp, settings, &mut callback)?;

        self.run_hard_stage(plan.hard_iters, settings, &mut callback)
    }

    /// Logits-to-soft stage, temperature stage, then the hard stage.
    #[instrument(skip_all, name = "design_3stage")]
    pub fn design_3stage(
        &mut self,
        plan: &StagedDesign,
        settings: &RunSettings,
        mut callback: impl FnMut(&Self),
    ) -> Result<(), EngineError> {
        info!(?plan, "Starting three-stage design.");
        self.set_opt(&OptionOverrides::new().models(plan.models).sample_models(true))?;

        let logits = AnnealSchedule::new()
            .soft(0.0)
            .soft_to(1.0)
            .temp(1.0)
            .hard(0.0)
            .dropout(plan.dropout);
        self.run_stage("Logits", plan.soft_iters, &logits, settings, &mut callback)?;

        let temp = AnnealSchedule::new()
            .soft(1.0)
            .temp(1.0)
            .temp_to(FINAL_TEMPERATURE)
            .hard(0.0)
            .dropout(plan.dropout);
        self.run_stage("Temperature", plan.temp_iters, &temp, settings, &mut callback)?;

        self.run_hard_stage(plan.hard_iters, settings, &mut callback)
    }

    /// Steps with fixed discretization while template dropout rises to 1.
    #[instrument(skip_all, name = "template_predesign", fields(iters = iters))]
    pub fn template_predesign(
        &mut self,
        iters: usize,
        plan: &TemplatePredesign,
        settings: &RunSettings,
        mut callback: impl FnMut(&Self),
    ) -> Result<(), EngineError> {
        require_iters(iters)?;
        self.set_opt(
            &OptionOverrides::new()
                .soft(plan.soft)
                .hard(plan.hard)
                .temp(plan.temp)
                .dropout(plan.dropout),
        )?;

        self.reporter().report(Progress::TaskStart {
            total_steps: iters as u64,
        });
        for i in 0..iters {
            let fraction = (i + 1) as f64 / iters as f64;
            self.set_opt(&OptionOverrides::new().template_dropout(fraction))?;
            self.step(1.0, settings, &mut callback)?;
            self.reporter().report(Progress::TaskIncrement);
        }
        self.reporter().report(Progress::TaskFinish);
        Ok(())
    }

    fn run_hard_stage(
        &mut self,
        iters: usize,
        settings: &RunSettings,
        callback: impl FnMut(&Self),
    ) -> Result<(), EngineError> {
        self.set_opt(&OptionOverrides::new().models(HARD_STAGE_MODELS))?;
        let hard = AnnealSchedule::new()
            .soft(1.0)
            .temp(FINAL_TEMPERATURE)
            .hard(1.0)
            .dropout(false);
        let settings = RunSettings {
            save_best: true,
            ..*settings
        };
        self.run_stage("Hard", iters, &hard, &settings, callback)
    }

    /// Wraps one preset stage in progress events. Empty stages are skipped.
    fn run_stage(
        &mut self,
        name: &'static str,
        iters: usize,
        schedule: &AnnealSchedule,
        settings: &RunSettings,
        callback: impl FnMut(&Self),
    ) -> Result<(), EngineError> {
        if iters == 0 {
            debug!(stage = name, "Skipping empty stage.");
            return Ok(());
        }
        self.reporter().report(Progress::StageStart { name });
        info!(stage = name, iters, "Stage started.");
        self.design(iters, schedule, settings, callback)?;
        self.reporter().report(Progress::StageFinish);
        info!(
            stage = name,
            loss = self.loss().unwrap_or(f64::NAN),
            "Stage finished."
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::{DesignOptions, Protocol, SessionConfigBuilder};
    use crate::engine::predictor::scripted::ScriptedPredictor;
    use crate::engine::progress::ProgressReporter;
    use crate::engine::session::RestartOptions;
    use std::sync::{Arc, Mutex};

    const LEN: usize = 6;

    fn session() -> DesignSession<ScriptedPredictor> {
        let config = SessionConfigBuilder::new()
            .protocol(Protocol::Hallucination)
            .design_len(LEN)
            .options(DesignOptions {
                sample_models: false,
                ..DesignOptions::default()
            })
            .build()
            .unwrap();
        let mut session = DesignSession::new(ScriptedPredictor::new(LEN), config).unwrap();
        session.restart(RestartOptions::new().seed(17)).unwrap();
        session.predictor().clear_calls();
        session
    }

    fn quiet() -> RunSettings {
        RunSettings::quiet()
    }

    #[test]
    fn temperature_hits_endpoints_and_decreases() {
        assert_eq!(anneal_temperature(1.0, 0.01, 0.0), 1.0);
        assert_eq!(anneal_temperature(1.0, 0.01, 1.0), 0.01);
        let iters = 10;
        let temps: Vec<f64> = (0..iters)
            .map(|i| anneal_temperature(1.0, 0.01, (i + 1) as f64 / iters as f64))
            .collect();
        assert!(temps.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(*temps.last().unwrap(), 0.01);
    }

    #[test]
    fn lr_scale_blends_soft_and_temperature() {
        assert_eq!(temperature_lr_scale(0.0, 0.3), 1.0);
        assert_eq!(temperature_lr_scale(1.0, 0.3), 0.3);
        assert!((temperature_lr_scale(0.5, 0.5) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn design_anneals_temperature_across_steps() {
        let mut session = session();
        let schedule = AnnealSchedule::new().soft(1.0).temp(1.0).temp_to(0.01);
        session.design(8, &schedule, &quiet(), |_| {}).unwrap();

        let temps: Vec<f64> = session.predictor().calls().iter().map(|c| c.temp).collect();
        assert_eq!(temps.len(), 8);
        assert!(temps.windows(2).all(|w| w[1] < w[0]));
        assert!((temps[7] - 0.01).abs() < 1e-12);
        assert_eq!(session.step_count(), 8);
        assert_eq!(session.trajectory().len(), 8);
    }

    #[test]
    fn design_interpolates_soft_linearly() {
        let mut session = session();
        let schedule = AnnealSchedule::new().soft(0.0).soft_to(1.0);
        session.design(4, &schedule, &quiet(), |_| {}).unwrap();
        let softs: Vec<f64> = session.predictor().calls().iter().map(|c| c.soft).collect();
        assert_eq!(softs, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn shortcuts_match_explicit_design() {
        for (shortcut, soft, hard) in [("logits", 0.0, 0.0), ("soft", 1.0, 0.0), ("hard", 1.0, 1.0)] {
            let schedule = AnnealSchedule::new();
            let mut a = session();
            match shortcut {
                "logits" => a.design_logits(5, &schedule, &quiet(), |_| {}),
                "soft" => a.design_soft(5, &schedule, &quiet(), |_| {}),
                _ => a.design_hard(5, &schedule, &quiet(), |_| {}),
            }
            .unwrap();

            let mut b = session();
            let explicit = AnnealSchedule::new().soft(soft).hard(hard);
            b.design(5, &explicit, &quiet(), |_| {}).unwrap();

            assert_eq!(a.params(), b.params());
            assert_eq!(a.trajectory(), b.trajectory());
            assert_eq!(a.predictor().calls(), b.predictor().calls());
            assert_eq!(a.options().soft, soft);
            assert_eq!(a.options().hard, hard);
        }
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let mut session = session();
        let err = session
            .design(0, &AnnealSchedule::new(), &quiet(), |_| {})
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { name: "iters", .. }));
        assert!(session
            .template_predesign(0, &TemplatePredesign::default(), &quiet(), |_| {})
            .is_err());
    }

    #[test]
    fn design_applies_dropout_and_weight_overrides() {
        let mut session = session();
        let schedule = AnnealSchedule::new()
            .dropout(false)
            .weights(LossWeights::from([("plddt".to_string(), 0.0)]));
        session.design(1, &schedule, &quiet(), |_| {}).unwrap();
        assert!(!session.predictor().calls()[0].dropout);
        assert_eq!(session.options().weight("plddt"), Some(0.0));
    }

    #[test]
    fn callback_runs_once_per_step() {
        let mut session = session();
        let mut count = 0;
        session
            .design(3, &AnnealSchedule::new(), &quiet(), |_| count += 1)
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn two_stage_runs_soft_temperature_and_hard_stages() {
        let mut session = session();
        let plan = StagedDesign {
            soft_iters: 2,
            temp_iters: 3,
            hard_iters: 2,
            models: 1,
            dropout: true,
        };
        session.design_2stage(&plan, &quiet(), |_| {}).unwrap();

        let calls = session.predictor().calls();
        // One model per step in the first two stages, five in the hard stage.
        assert_eq!(calls.len(), 2 + 3 + 2 * 5);
        assert!(calls[..5].iter().all(|c| c.soft == 1.0 && c.hard == 0.0 && c.dropout));
        assert!((calls[4].temp - FINAL_TEMPERATURE).abs() < 1e-12);
        assert!(calls[5..]
            .iter()
            .all(|c| c.hard == 1.0 && !c.dropout && c.temp == FINAL_TEMPERATURE));
        assert_eq!(session.step_count(), 7);
        assert!(session.best().snapshot().is_some());
        assert_eq!(session.options().models, 5);
        assert!(session.options().sample_models);
    }

    #[test]
    fn three_stage_ramps_soft_from_logits() {
        let mut session = session();
        let plan = StagedDesign {
            soft_iters: 4,
            temp_iters: 2,
            hard_iters: 1,
            models: 1,
            dropout: false,
        };
        session.design_3stage(&plan, &quiet(), |_| {}).unwrap();
        let calls = session.predictor().calls();
        let softs: Vec<f64> = calls[..4].iter().map(|c| c.soft).collect();
        assert_eq!(softs, vec![0.25, 0.5, 0.75, 1.0]);
        assert!(calls[..4].iter().all(|c| c.temp == 1.0 && c.hard == 0.0));
        assert!((calls[5].temp - FINAL_TEMPERATURE).abs() < 1e-12);
        assert_eq!(session.step_count(), 7);
    }

    #[test]
    fn staged_presets_skip_empty_stages_and_report_names() {
        let stages = Arc::new(Mutex::new(Vec::new()));
        let sink = stages.clone();
        let reporter = ProgressReporter::with_callback(Box::new(move |event| {
            if let Progress::StageStart { name } = event {
                sink.lock().unwrap().push(name);
            }
        }));
        let mut session = session().with_reporter(reporter);
        let plan = StagedDesign {
            soft_iters: 1,
            temp_iters: 0,
            hard_iters: 1,
            models: 1,
            dropout: true,
        };
        session.design_2stage(&plan, &quiet(), |_| {}).unwrap();
        assert_eq!(*stages.lock().unwrap(), vec!["Soft", "Hard"]);
        assert_eq!(session.step_count(), 2);
    }

    #[test]
    fn template_predesign_raises_template_dropout() {
        let mut session = session();
        session
            .template_predesign(4, &TemplatePredesign::default(), &quiet(), |_| {})
            .unwrap();
        let calls = session.predictor().calls();
        let dropouts: Vec<f64> = calls.iter().map(|c| c.template_dropout).collect();
        assert_eq!(dropouts, vec![0.25, 0.5, 0.75, 1.0]);
        assert!(calls.iter().all(|c| c.soft == 1.0 && c.hard == 0.0 && c.temp == 1.0));
    }
}
