use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "afdesign contributors",
    version,
    about = "afdesign CLI - gradient-based protein sequence design against a differentiable structure predictor.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Design a sequence for a target profile with one of the annealing or search workflows.
    Design(DesignArgs),
}

/// Arguments for the `design` subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct DesignArgs {
    // --- Core Arguments ---
    /// Path to the design configuration file in TOML format.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path for the FASTA file receiving the designed sequences.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub output: PathBuf,

    /// Also write the per-step loss records to this CSV file.
    #[arg(long, value_name = "PATH")]
    pub trajectory: Option<PathBuf>,

    // --- Target Overrides ---
    /// Sequence whose smoothed one-hot profile the design is scored against.
    #[arg(short, long, value_name = "SEQUENCE")]
    pub target: Option<String>,

    /// Design task: 'fixbb', 'partial', 'binder' or 'hallucination'.
    #[arg(short, long, value_name = "NAME")]
    pub protocol: Option<String>,

    // --- Run Overrides ---
    /// Workflow to run: 'design', 'logits', 'soft', 'hard', '2stage', '3stage',
    /// 'semigreedy' or 'template-predesign'.
    #[arg(short, long, value_name = "NAME")]
    pub workflow: Option<String>,

    /// Iteration count for single-stage workflows and semigreedy search.
    #[arg(short = 'n', long, value_name = "NUM")]
    pub iters: Option<usize>,

    /// Random seed for the key stream.
    #[arg(long, value_name = "NUM")]
    pub seed: Option<u64>,

    /// Optimizer: 'sgd' or 'adam'.
    #[arg(long, value_name = "NAME")]
    pub optimizer: Option<String>,

    /// Initialize the logits from this sequence instead of random noise.
    #[arg(long, value_name = "SEQUENCE")]
    pub start_seq: Option<String>,

    // --- Generic Overrides ---
    /// Set a configuration value, overriding the config file (e.g., -S options.lr=0.05).
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE")]
    pub set_values: Vec<String>,
}
