use crate::cli::DesignArgs;
use crate::config::{AppConfig, PredictorSettings, Workflow, WorkflowKind, build_config};
use crate::error::Result;
use crate::utils::export::{FastaRecord, write_fasta, write_trajectory_csv};
use crate::utils::progress::StageProgress;
use afdesign::engine::predictor::profile::ProfilePredictor;
use afdesign::engine::session::{DesignSession, RestartOptions, RunSettings, SeedSequence};
use tracing::{info, trace, warn};

pub fn run(args: DesignArgs) -> Result<()> {
    info!("Merging configuration from file and CLI arguments...");
    let config = build_config(&args)?;
    let progress = StageProgress::new();
    let session = execute(&config, Some(&progress));
    progress.finish();
    write_results(&config, &session?)
}

fn build_predictor(settings: &PredictorSettings) -> Result<ProfilePredictor> {
    let mut predictor = ProfilePredictor::from_sequence(&settings.target, settings.smoothing)?
        .with_target_len(settings.target_len)
        .with_num_recycle(settings.num_recycle);
    if let Some(scales) = &settings.member_scales {
        predictor = predictor.with_member_scales(scales.clone());
    }
    Ok(predictor)
}

/// Builds the session and runs the configured workflow to completion.
fn execute(
    config: &AppConfig,
    progress: Option<&StageProgress>,
) -> Result<DesignSession<ProfilePredictor>> {
    let predictor = build_predictor(&config.predictor)?;
    info!(
        design_len = config.session.design_len,
        target_len = config.predictor.target_len,
        protocol = %config.session.protocol,
        "Built profile predictor."
    );

    let mut session = DesignSession::new(predictor, config.session.clone())?;
    if let Some(progress) = progress {
        session = session.with_reporter(progress.reporter());
    }

    let seq = match &config.start_seq {
        Some(sequence) => SeedSequence::Sequence(sequence.clone()),
        None => SeedSequence::Random,
    };
    let mut restart = RestartOptions::new().optimizer(config.optimizer).seq(seq);
    if let Some(seed) = config.seed {
        restart = restart.seed(seed);
    }
    session.restart(restart)?;

    let settings = RunSettings {
        backprop: true,
        save_best: config.save_best,
        verbose: config.verbose,
    };
    let on_step = |s: &DesignSession<ProfilePredictor>| {
        trace!(step = s.step_count(), loss = ?s.loss(), "Step completed.");
    };

    info!(seed = session.key_stream().seed(), "Invoking the design workflow...");
    match &config.workflow {
        Workflow::Single {
            kind,
            iters,
            schedule,
        } => match kind {
            WorkflowKind::Logits => session.design_logits(*iters, schedule, &settings, on_step),
            WorkflowKind::Soft => session.design_soft(*iters, schedule, &settings, on_step),
            WorkflowKind::Hard => session.design_hard(*iters, schedule, &settings, on_step),
            _ => session.design(*iters, schedule, &settings, on_step),
        },
        Workflow::TwoStage(plan) => session.design_2stage(plan, &settings, on_step),
        Workflow::ThreeStage(plan) => session.design_3stage(plan, &settings, on_step),
        Workflow::Semigreedy(search) => session.design_semigreedy(search),
        Workflow::TemplatePredesign { iters, plan } => {
            session.template_predesign(*iters, plan, &settings, on_step)
        }
    }?;

    info!(
        steps = session.trajectory().len(),
        best_loss = session.best().best_loss(),
        "Workflow finished."
    );
    Ok(session)
}

fn write_results(config: &AppConfig, session: &DesignSession<ProfilePredictor>) -> Result<()> {
    let mut records = Vec::new();
    if let Some(best) = session.best().snapshot() {
        if let Some(sequence) = session.best_sequence_string() {
            records.push(FastaRecord {
                header: format!("design_best step={} loss={:.4}", best.step, best.loss),
                sequence,
            });
        }
    } else {
        warn!("No best result was saved; writing the final sequence only.");
    }
    let final_loss = session.trajectory().last().map_or(f64::NAN, |r| r.loss);
    records.push(FastaRecord {
        header: format!(
            "design_final step={} loss={:.4}",
            session.trajectory().len(),
            final_loss
        ),
        sequence: session.current_sequence_string()?,
    });

    info!("Writing {} sequence(s) to {:?}", records.len(), &config.output);
    write_fasta(&config.output, &records)?;
    println!("✓ Designed sequences written to: {}", config.output.display());

    if let Some(path) = &config.trajectory {
        info!("Writing trajectory to {:?}", path);
        write_trajectory_csv(path, &session.trajectory().losses)?;
        println!("✓ Trajectory written to: {}", path.display());
    }
    Ok(())
}
