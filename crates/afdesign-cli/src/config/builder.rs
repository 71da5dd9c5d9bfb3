use super::defaults::DefaultsConfig;
use super::file::{FileConfig, FilePredictorConfig, FileProtocolConfig, FileSessionConfig};
use super::models::{AppConfig, PredictorSettings, Workflow, WorkflowKind};
use crate::cli::DesignArgs;
use crate::error::{CliError, Result};
use afdesign::core::alphabet::parse_sequence;
use afdesign::engine::config::{
    DesignOptions, OptionOverrides, Protocol, SessionConfigBuilder,
};
use afdesign::engine::optimizer::OptimizerKind;
use afdesign::workflows::anneal::{AnnealSchedule, StagedDesign, TemplatePredesign};
use afdesign::workflows::semigreedy::SemigreedySettings;
use std::str::FromStr;
use tracing::debug;

/// Merges CLI flags over `-S` overrides over the config file over defaults.
pub fn build_config(args: &DesignArgs) -> Result<AppConfig> {
    let defaults = DefaultsConfig::default();

    let file_config = if let Some(config_path) = &args.config {
        FileConfig::from_file(config_path)?
    } else {
        FileConfig::default()
    };
    let mut file_config = apply_set_values(file_config, &args.set_values)?;

    let session_file = file_config.session.take().unwrap_or_default();
    let predictor_file = file_config.predictor.take().unwrap_or_default();
    let protocol_file = file_config.protocol.take().unwrap_or_default();
    let overrides = file_config.options.take().unwrap_or_default();

    let target = args
        .target
        .clone()
        .or(predictor_file.target.clone())
        .ok_or_else(|| {
            CliError::Config(
                "A target sequence is required (--target or `predictor.target`).".to_string(),
            )
        })?;
    let target_indices = parse_sequence(&target).map_err(|e| CliError::Argument(e.to_string()))?;

    let protocol: Protocol = args
        .protocol
        .as_deref()
        .or(session_file.protocol.as_deref())
        .unwrap_or(defaults.protocol)
        .parse()?;
    let target_len = predictor_file.target_len.unwrap_or(0);
    if protocol == Protocol::Binder && target_len == 0 {
        return Err(CliError::Config(
            "Binder design requires `predictor.target-len` > 0.".to_string(),
        ));
    }

    let mut options = DesignOptions::default();
    overrides.apply_to(&mut options);

    let redesign = session_file.redesign.unwrap_or(false);
    let mut builder = SessionConfigBuilder::new()
        .protocol(protocol)
        .design_len(target_indices.len())
        .redesign(redesign)
        .use_templates(session_file.use_templates.unwrap_or(false))
        .recycle_mode(session_file.recycle_mode.unwrap_or_default())
        .options(options.clone());
    if protocol == Protocol::Binder {
        builder = builder.target_len(target_len);
    }
    if protocol.scores_recovery(redesign) {
        builder = builder.wild_type(reference_residues(&target_indices, options.pos.as_deref())?);
    }
    let session = builder.build()?;

    let optimizer: OptimizerKind = args
        .optimizer
        .as_deref()
        .or(session_file.optimizer.as_deref())
        .unwrap_or(defaults.optimizer)
        .parse()?;

    let save_best = protocol_file.save_best.unwrap_or(defaults.save_best);
    let verbose = session_file.verbose.unwrap_or(defaults.verbose);
    let workflow = resolve_workflow(args, &protocol_file, &defaults, save_best, verbose)?;
    debug!(?workflow, %protocol, %optimizer, "Resolved design configuration.");

    Ok(AppConfig {
        predictor: PredictorSettings {
            target,
            smoothing: predictor_file
                .smoothing
                .unwrap_or(defaults.profile_smoothing),
            num_recycle: predictor_file.num_recycle.unwrap_or(defaults.num_recycle),
            target_len,
            member_scales: predictor_file.member_scales,
        },
        session,
        workflow,
        seed: args.seed.or(session_file.seed),
        optimizer,
        start_seq: args.start_seq.clone().or(session_file.start_seq),
        save_best,
        verbose,
        output: args.output.clone(),
        trajectory: args.trajectory.clone(),
    })
}

/// Residues of the target scored for recovery, restricted to `pos` if set.
fn reference_residues(target: &[usize], pos: Option<&[usize]>) -> Result<Vec<usize>> {
    let Some(pos) = pos else {
        return Ok(target.to_vec());
    };
    pos.iter()
        .map(|&p| {
            target.get(p).copied().ok_or_else(|| {
                CliError::Config(format!(
                    "Position {} in `options.pos` is outside the target of length {}.",
                    p,
                    target.len()
                ))
            })
        })
        .collect()
}

fn resolve_workflow(
    args: &DesignArgs,
    file: &FileProtocolConfig,
    defaults: &DefaultsConfig,
    save_best: bool,
    verbose: usize,
) -> Result<Workflow> {
    let kind: WorkflowKind = args
        .workflow
        .as_deref()
        .or(file.workflow.as_deref())
        .unwrap_or(defaults.workflow)
        .parse()?;
    let iters = args.iters.or(file.iters).unwrap_or(defaults.iters);

    let workflow = match kind {
        WorkflowKind::Design | WorkflowKind::Logits | WorkflowKind::Soft | WorkflowKind::Hard => {
            let mut schedule = AnnealSchedule::new();
            schedule.soft = file.soft;
            schedule.e_soft = file.e_soft;
            schedule.temp = file.temp;
            schedule.e_temp = file.e_temp;
            schedule.hard = file.hard;
            schedule.e_hard = file.e_hard;
            schedule.dropout = file.dropout;
            if let Some(models) = file.models {
                schedule = schedule.opt(OptionOverrides::new().models(models));
            }
            Workflow::Single {
                kind,
                iters,
                schedule,
            }
        }
        WorkflowKind::TwoStage => Workflow::TwoStage(merge_staged(StagedDesign::two_stage(), file)),
        WorkflowKind::ThreeStage => {
            Workflow::ThreeStage(merge_staged(StagedDesign::three_stage(), file))
        }
        WorkflowKind::Semigreedy => Workflow::Semigreedy(SemigreedySettings {
            iters,
            tries: file.tries.unwrap_or(defaults.tries),
            models: file.models.unwrap_or(defaults.semigreedy_models),
            use_plddt: file.use_plddt.unwrap_or(defaults.use_plddt),
            save_best,
            verbose,
        }),
        WorkflowKind::TemplatePredesign => {
            let base = TemplatePredesign::default();
            Workflow::TemplatePredesign {
                iters,
                plan: TemplatePredesign {
                    soft: file.soft.unwrap_or(base.soft),
                    hard: file.hard.unwrap_or(base.hard),
                    temp: file.temp.unwrap_or(base.temp),
                    dropout: file.dropout.unwrap_or(base.dropout),
                },
            }
        }
    };
    Ok(workflow)
}

fn merge_staged(preset: StagedDesign, file: &FileProtocolConfig) -> StagedDesign {
    StagedDesign {
        soft_iters: file.soft_iters.unwrap_or(preset.soft_iters),
        temp_iters: file.temp_iters.unwrap_or(preset.temp_iters),
        hard_iters: file.hard_iters.unwrap_or(preset.hard_iters),
        models: file.models.unwrap_or(preset.models),
        dropout: file.dropout.unwrap_or(preset.dropout),
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        CliError::Config(format!("Invalid value for {}: '{}'", key, value))
    })
}

fn unsupported(key: &str) -> CliError {
    CliError::Config(format!("Unsupported configuration key for --set: '{}'", key))
}

fn apply_set_values(mut config: FileConfig, set_values: &[String]) -> Result<FileConfig> {
    for kv_pair in set_values {
        let (key, value) = kv_pair.split_once('=').ok_or_else(|| {
            CliError::Config(format!(
                "Invalid --set format: '{}'. Expected KEY=VALUE.",
                kv_pair
            ))
        })?;
        let key = key.trim();
        let (section, field) = key.split_once('.').ok_or_else(|| unsupported(key))?;

        match section {
            "session" => set_session_value(
                config.session.get_or_insert_with(Default::default),
                field,
                key,
                value,
            )?,
            "predictor" => set_predictor_value(
                config.predictor.get_or_insert_with(Default::default),
                field,
                key,
                value,
            )?,
            "protocol" => set_protocol_value(
                config.protocol.get_or_insert_with(Default::default),
                field,
                key,
                value,
            )?,
            "options" => set_option_value(
                config.options.get_or_insert_with(Default::default),
                field,
                key,
                value,
            )?,
            _ => return Err(unsupported(key)),
        }
    }
    Ok(config)
}

fn set_session_value(
    session: &mut FileSessionConfig,
    field: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    match field {
        "protocol" => session.protocol = Some(value.trim().to_string()),
        "recycle-mode" => session.recycle_mode = Some(parse_value(key, value)?),
        "use-templates" => session.use_templates = Some(parse_value(key, value)?),
        "redesign" => session.redesign = Some(parse_value(key, value)?),
        "seed" => session.seed = Some(parse_value(key, value)?),
        "optimizer" => session.optimizer = Some(value.trim().to_string()),
        "start-seq" => session.start_seq = Some(value.trim().to_string()),
        "verbose" => session.verbose = Some(parse_value(key, value)?),
        _ => return Err(unsupported(key)),
    }
    Ok(())
}

fn set_predictor_value(
    predictor: &mut FilePredictorConfig,
    field: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    match field {
        "target" => predictor.target = Some(value.trim().to_string()),
        "smoothing" => predictor.smoothing = Some(parse_value(key, value)?),
        "num-recycle" => predictor.num_recycle = Some(parse_value(key, value)?),
        "target-len" => predictor.target_len = Some(parse_value(key, value)?),
        _ => return Err(unsupported(key)),
    }
    Ok(())
}

fn set_protocol_value(
    protocol: &mut FileProtocolConfig,
    field: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    match field {
        "workflow" => protocol.workflow = Some(value.trim().to_string()),
        "iters" => protocol.iters = Some(parse_value(key, value)?),
        "save-best" => protocol.save_best = Some(parse_value(key, value)?),
        "soft" => protocol.soft = Some(parse_value(key, value)?),
        "e-soft" => protocol.e_soft = Some(parse_value(key, value)?),
        "temp" => protocol.temp = Some(parse_value(key, value)?),
        "e-temp" => protocol.e_temp = Some(parse_value(key, value)?),
        "hard" => protocol.hard = Some(parse_value(key, value)?),
        "e-hard" => protocol.e_hard = Some(parse_value(key, value)?),
        "soft-iters" => protocol.soft_iters = Some(parse_value(key, value)?),
        "temp-iters" => protocol.temp_iters = Some(parse_value(key, value)?),
        "hard-iters" => protocol.hard_iters = Some(parse_value(key, value)?),
        "models" => protocol.models = Some(parse_value(key, value)?),
        "dropout" => protocol.dropout = Some(parse_value(key, value)?),
        "tries" => protocol.tries = Some(parse_value(key, value)?),
        "use-plddt" => protocol.use_plddt = Some(parse_value(key, value)?),
        _ => return Err(unsupported(key)),
    }
    Ok(())
}

fn set_option_value(
    options: &mut OptionOverrides,
    field: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    if let Some(term) = field.strip_prefix("weights.") {
        let weight: f64 = parse_value(key, value)?;
        options
            .weights
            .get_or_insert_with(Default::default)
            .insert(term.to_string(), weight);
        return Ok(());
    }
    match field {
        "soft" => options.soft = Some(parse_value(key, value)?),
        "hard" => options.hard = Some(parse_value(key, value)?),
        "temp" => options.temp = Some(parse_value(key, value)?),
        "recycles" => options.recycles = Some(parse_value(key, value)?),
        "models" => options.models = Some(parse_value(key, value)?),
        "sample-models" => options.sample_models = Some(parse_value(key, value)?),
        "dropout" => options.dropout = Some(parse_value(key, value)?),
        "lr" => options.lr = Some(parse_value(key, value)?),
        "template-dropout" => options.template_dropout = Some(parse_value(key, value)?),
        "pos" => {
            let positions = value
                .split(',')
                .map(|p| parse_value(key, p))
                .collect::<Result<Vec<usize>>>()?;
            options.pos = Some(positions);
        }
        _ => return Err(unsupported(key)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use afdesign::engine::config::RecycleMode;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn base_args() -> DesignArgs {
        DesignArgs {
            output: PathBuf::from("design.fasta"),
            target: Some("MKVLAG".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_fill_everything_but_the_target() {
        let app = build_config(&base_args()).unwrap();
        let defaults = DefaultsConfig::default();

        assert_eq!(app.session.protocol, Protocol::Fixbb);
        assert_eq!(app.session.design_len, 6);
        assert_eq!(app.session.recycle_mode, RecycleMode::Last);
        assert_eq!(app.session.wild_type, Some(parse_sequence("MKVLAG").unwrap()));
        assert_eq!(app.optimizer, OptimizerKind::Sgd);
        assert_eq!(app.predictor.smoothing, defaults.profile_smoothing);
        assert_eq!(app.predictor.num_recycle, defaults.num_recycle);
        assert_eq!(app.verbose, defaults.verbose);
        assert_eq!(app.workflow, Workflow::ThreeStage(StagedDesign::three_stage()));
        assert_eq!(app.seed, None);
    }

    #[test]
    fn missing_target_is_reported() {
        let args = DesignArgs {
            target: None,
            ..base_args()
        };
        assert!(matches!(build_config(&args), Err(CliError::Config(_))));
    }

    #[test]
    fn file_values_are_merged_and_cli_flags_win() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("design.toml");
        fs::write(
            &path,
            r#"
            [session]
            protocol = "hallucination"
            recycle-mode = "average"
            seed = 3
            optimizer = "adam"

            [predictor]
            target = "ACDEFGHIK"
            smoothing = 0.2

            [options]
            recycles = 2
            weights = { plddt = 0.3 }

            [protocol]
            workflow = "2stage"
            soft-iters = 7
            hard-iters = 0
            "#,
        )
        .unwrap();

        let args = DesignArgs {
            config: Some(path),
            target: None,
            seed: Some(42),
            ..base_args()
        };
        let app = build_config(&args).unwrap();

        assert_eq!(app.session.protocol, Protocol::Hallucination);
        assert_eq!(app.session.wild_type, None);
        assert_eq!(app.session.recycle_mode, RecycleMode::Average);
        assert_eq!(app.session.design_len, 9);
        assert_eq!(app.session.options.recycles, 2);
        assert_eq!(app.session.options.weight("plddt"), Some(0.3));
        assert_eq!(app.predictor.smoothing, 0.2);
        assert_eq!(app.seed, Some(42));
        assert_eq!(app.optimizer, OptimizerKind::Adam);

        let Workflow::TwoStage(plan) = app.workflow else {
            panic!("expected a two-stage plan");
        };
        assert_eq!(plan.soft_iters, 7);
        assert_eq!(plan.temp_iters, StagedDesign::two_stage().temp_iters);
        assert_eq!(plan.hard_iters, 0);
    }

    #[test]
    fn set_values_override_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("design.toml");
        fs::write(&path, "[options]\nlr = 0.5\n\n[protocol]\nworkflow = \"soft\"\n").unwrap();

        let args = DesignArgs {
            config: Some(path),
            set_values: vec![
                "options.lr=0.05".to_string(),
                "options.weights.profile=2.0".to_string(),
                "protocol.iters=12".to_string(),
                "protocol.e-temp=0.1".to_string(),
            ],
            ..base_args()
        };
        let app = build_config(&args).unwrap();

        assert_eq!(app.session.options.lr, 0.05);
        assert_eq!(app.session.options.weight("profile"), Some(2.0));
        let Workflow::Single {
            kind,
            iters,
            schedule,
        } = app.workflow
        else {
            panic!("expected a single-stage workflow");
        };
        assert_eq!(kind, WorkflowKind::Soft);
        assert_eq!(iters, 12);
        assert_eq!(schedule.e_temp, Some(0.1));
    }

    #[test]
    fn semigreedy_settings_are_resolved() {
        let args = DesignArgs {
            workflow: Some("semigreedy".to_string()),
            iters: Some(4),
            set_values: vec![
                "protocol.tries=6".to_string(),
                "protocol.use-plddt=false".to_string(),
                "session.verbose=0".to_string(),
            ],
            ..base_args()
        };
        let app = build_config(&args).unwrap();
        assert_eq!(
            app.workflow,
            Workflow::Semigreedy(SemigreedySettings {
                iters: 4,
                tries: 6,
                models: 1,
                use_plddt: false,
                save_best: true,
                verbose: 0,
            })
        );
    }

    #[test]
    fn partial_protocol_scores_selected_positions() {
        let args = DesignArgs {
            protocol: Some("partial".to_string()),
            set_values: vec!["options.pos=0,2,5".to_string()],
            ..base_args()
        };
        let app = build_config(&args).unwrap();
        assert_eq!(app.session.wild_type, Some(parse_sequence("MVG").unwrap()));
        assert_eq!(app.session.options.pos, Some(vec![0, 2, 5]));

        let args = DesignArgs {
            protocol: Some("partial".to_string()),
            set_values: vec!["options.pos=0,9".to_string()],
            ..base_args()
        };
        assert!(matches!(build_config(&args), Err(CliError::Config(_))));
    }

    #[test]
    fn binder_requires_a_target_length() {
        let args = DesignArgs {
            protocol: Some("binder".to_string()),
            ..base_args()
        };
        assert!(matches!(build_config(&args), Err(CliError::Config(_))));

        let args = DesignArgs {
            protocol: Some("binder".to_string()),
            set_values: vec!["predictor.target-len=4".to_string()],
            ..base_args()
        };
        let app = build_config(&args).unwrap();
        assert_eq!(app.session.target_len, 4);
        assert_eq!(app.session.wild_type, None);
        assert!(!app.session.scores_sequence_recovery());

        let args = DesignArgs {
            protocol: Some("binder".to_string()),
            set_values: vec![
                "predictor.target-len=4".to_string(),
                "session.redesign=true".to_string(),
            ],
            ..base_args()
        };
        let app = build_config(&args).unwrap();
        assert_eq!(app.session.wild_type, Some(parse_sequence("MKVLAG").unwrap()));
        assert!(app.session.scores_sequence_recovery());
    }

    #[test]
    fn malformed_set_values_are_rejected() {
        for bad in ["options.lr", "lr=0.1", "options.learning-rate=0.1", "protocol.iters=many"] {
            let args = DesignArgs {
                set_values: vec![bad.to_string()],
                ..base_args()
            };
            assert!(
                matches!(build_config(&args), Err(CliError::Config(_))),
                "accepted '{}'",
                bad
            );
        }
    }

    #[test]
    fn invalid_names_are_rejected() {
        let args = DesignArgs {
            optimizer: Some("rmsprop".to_string()),
            ..base_args()
        };
        assert!(matches!(build_config(&args), Err(CliError::Config(_))));

        let args = DesignArgs {
            workflow: Some("anneal".to_string()),
            ..base_args()
        };
        assert!(matches!(build_config(&args), Err(CliError::Argument(_))));
    }
}
