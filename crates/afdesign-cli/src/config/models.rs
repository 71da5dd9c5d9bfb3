use crate::error::CliError;
use afdesign::engine::config::SessionConfig;
use afdesign::engine::optimizer::OptimizerKind;
use afdesign::workflows::anneal::{AnnealSchedule, StagedDesign, TemplatePredesign};
use afdesign::workflows::semigreedy::SemigreedySettings;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// The design routine a run executes, by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowKind {
    Design,
    Logits,
    Soft,
    Hard,
    TwoStage,
    ThreeStage,
    Semigreedy,
    TemplatePredesign,
}

impl FromStr for WorkflowKind {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "design" => Ok(WorkflowKind::Design),
            "logits" => Ok(WorkflowKind::Logits),
            "soft" => Ok(WorkflowKind::Soft),
            "hard" => Ok(WorkflowKind::Hard),
            "2stage" => Ok(WorkflowKind::TwoStage),
            "3stage" => Ok(WorkflowKind::ThreeStage),
            "semigreedy" => Ok(WorkflowKind::Semigreedy),
            "template-predesign" => Ok(WorkflowKind::TemplatePredesign),
            other => Err(CliError::Argument(format!(
                "Unknown workflow '{}'. Expected design, logits, soft, hard, 2stage, 3stage, semigreedy or template-predesign.",
                other
            ))),
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowKind::Design => "design",
            WorkflowKind::Logits => "logits",
            WorkflowKind::Soft => "soft",
            WorkflowKind::Hard => "hard",
            WorkflowKind::TwoStage => "2stage",
            WorkflowKind::ThreeStage => "3stage",
            WorkflowKind::Semigreedy => "semigreedy",
            WorkflowKind::TemplatePredesign => "template-predesign",
        };
        write!(f, "{}", name)
    }
}

/// A fully resolved workflow with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Workflow {
    /// `design`, `logits`, `soft` or `hard`: one annealed stage.
    Single {
        kind: WorkflowKind,
        iters: usize,
        schedule: AnnealSchedule,
    },
    TwoStage(StagedDesign),
    ThreeStage(StagedDesign),
    Semigreedy(SemigreedySettings),
    TemplatePredesign {
        iters: usize,
        plan: TemplatePredesign,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictorSettings {
    pub target: String,
    pub smoothing: f64,
    pub num_recycle: usize,
    pub target_len: usize,
    pub member_scales: Option<Vec<f64>>,
}

pub struct AppConfig {
    pub predictor: PredictorSettings,
    pub session: SessionConfig,
    pub workflow: Workflow,
    pub seed: Option<u64>,
    pub optimizer: OptimizerKind,
    pub start_seq: Option<String>,
    pub save_best: bool,
    pub verbose: usize,
    pub output: PathBuf,
    pub trajectory: Option<PathBuf>,
}
