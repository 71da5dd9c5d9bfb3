use crate::error::{CliError, Result};
use afdesign::engine::config::{OptionOverrides, RecycleMode};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// On-disk layout of a design configuration. Every field is optional; the
/// builder fills the gaps from CLI flags and [`super::defaults::DefaultsConfig`].
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub session: Option<FileSessionConfig>,
    pub predictor: Option<FilePredictorConfig>,
    pub options: Option<OptionOverrides>,
    pub protocol: Option<FileProtocolConfig>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileSessionConfig {
    pub protocol: Option<String>,
    pub recycle_mode: Option<RecycleMode>,
    pub use_templates: Option<bool>,
    pub redesign: Option<bool>,
    pub seed: Option<u64>,
    pub optimizer: Option<String>,
    pub start_seq: Option<String>,
    /// Print a summary line every this many steps (0 disables).
    pub verbose: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FilePredictorConfig {
    pub target: Option<String>,
    pub smoothing: Option<f64>,
    pub num_recycle: Option<usize>,
    /// Residues of the fixed binding target preceding the designed chain.
    pub target_len: Option<usize>,
    pub member_scales: Option<Vec<f64>>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileProtocolConfig {
    pub workflow: Option<String>,
    pub iters: Option<usize>,
    pub save_best: Option<bool>,

    pub soft: Option<f64>,
    pub e_soft: Option<f64>,
    pub temp: Option<f64>,
    pub e_temp: Option<f64>,
    pub hard: Option<f64>,
    pub e_hard: Option<f64>,

    pub soft_iters: Option<usize>,
    pub temp_iters: Option<usize>,
    pub hard_iters: Option<usize>,
    pub models: Option<usize>,
    pub dropout: Option<bool>,

    pub tries: Option<usize>,
    pub use_plddt: Option<bool>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Reading design configuration from {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        Self::from_toml_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    pub fn from_toml_str(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
