use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Parameter '{name}' = {value} is out of range (expected {expected})")]
    OutOfRange {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("Failed to read options file '{path}': {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse options: {0}")]
    Parse(String),
}

/// Which design task the session is solving. Only decides whether a
/// reference sequence exists for recovery scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Fixed-backbone redesign.
    Fixbb,
    /// Redesign of a subset of positions.
    Partial,
    /// Binder design against a fixed target.
    Binder,
    /// Free design, no reference structure.
    Hallucination,
}

impl Protocol {
    /// Whether designs are scored against a reference sequence. Binders
    /// only have one when the binder itself is being redesigned.
    pub fn scores_recovery(self, redesign: bool) -> bool {
        match self {
            Protocol::Fixbb | Protocol::Partial => true,
            Protocol::Binder => redesign,
            Protocol::Hallucination => false,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Fixbb => "fixbb",
            Protocol::Partial => "partial",
            Protocol::Binder => "binder",
            Protocol::Hallucination => "hallucination",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixbb" => Ok(Protocol::Fixbb),
            "partial" => Ok(Protocol::Partial),
            "binder" => Ok(Protocol::Binder),
            "hallucination" => Ok(Protocol::Hallucination),
            other => Err(ConfigError::InvalidValue {
                name: "protocol",
                reason: format!(
                    "unknown protocol '{}', expected fixbb, partial, binder or hallucination",
                    other
                ),
            }),
        }
    }
}

/// How recurrent state is handled across recycles during one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecycleMode {
    /// One call with the configured recycle count.
    #[default]
    Last,
    /// `recycles + 1` chained calls; gradients averaged.
    Average,
    /// One call with a recycle count drawn from `0..=recycles`.
    Sample,
    /// One call; recycling is differentiated through inside the predictor.
    Backprop,
    /// One call; the predictor sums outputs over its own recycles.
    AddPrev,
}

impl FromStr for RecycleMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "last" => Ok(RecycleMode::Last),
            "average" => Ok(RecycleMode::Average),
            "sample" => Ok(RecycleMode::Sample),
            "backprop" => Ok(RecycleMode::Backprop),
            "add-prev" => Ok(RecycleMode::AddPrev),
            other => Err(ConfigError::InvalidValue {
                name: "recycle_mode",
                reason: format!("unknown recycle mode '{}'", other),
            }),
        }
    }
}

pub type LossWeights = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct TemplateOptions {
    /// Probability of dropping template features in a predictor call.
    pub dropout: f64,
}

/// Run-time controls read by every evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DesignOptions {
    pub soft: f64,
    pub hard: f64,
    pub temp: f64,
    pub recycles: usize,
    pub models: usize,
    pub sample_models: bool,
    pub dropout: bool,
    pub lr: f64,
    pub weights: LossWeights,
    pub template: TemplateOptions,
    pub pos: Option<Vec<usize>>,
}

impl Default for DesignOptions {
    fn default() -> Self {
        Self {
            soft: 0.0,
            hard: 0.0,
            temp: 1.0,
            recycles: 0,
            models: 1,
            sample_models: true,
            dropout: true,
            lr: 0.1,
            weights: LossWeights::new(),
            template: TemplateOptions::default(),
            pos: None,
        }
    }
}

impl DesignOptions {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let options: DesignOptions =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn weight(&self, term: &str) -> Option<f64> {
        self.weights.get(term).copied()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit_interval("soft", self.soft)?;
        check_unit_interval("hard", self.hard)?;
        check_unit_interval("template.dropout", self.template.dropout)?;
        if !(self.temp.is_finite() && self.temp > 0.0) {
            return Err(ConfigError::OutOfRange {
                name: "temp",
                value: self.temp,
                expected: "a finite value > 0",
            });
        }
        if !(self.lr.is_finite() && self.lr >= 0.0) {
            return Err(ConfigError::OutOfRange {
                name: "lr",
                value: self.lr,
                expected: "a finite value >= 0",
            });
        }
        if self.models == 0 {
            return Err(ConfigError::InvalidValue {
                name: "models",
                reason: "at least one model must be evaluated".to_string(),
            });
        }
        if let Some((term, w)) = self.weights.iter().find(|(_, w)| !w.is_finite()) {
            return Err(ConfigError::InvalidValue {
                name: "weights",
                reason: format!("weight for '{}' is not finite ({})", term, w),
            });
        }
        if matches!(&self.pos, Some(pos) if pos.is_empty()) {
            return Err(ConfigError::InvalidValue {
                name: "pos",
                reason: "position subset must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn check_unit_interval(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            expected: "[0, 1]",
        })
    }
}

/// A partial set of options layered on top of the live [`DesignOptions`].
/// Weight entries are merged key by key rather than replacing the map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct OptionOverrides {
    pub soft: Option<f64>,
    pub hard: Option<f64>,
    pub temp: Option<f64>,
    pub recycles: Option<usize>,
    pub models: Option<usize>,
    pub sample_models: Option<bool>,
    pub dropout: Option<bool>,
    pub lr: Option<f64>,
    pub weights: Option<LossWeights>,
    pub template_dropout: Option<f64>,
    pub pos: Option<Vec<usize>>,
}

impl OptionOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn soft(mut self, value: f64) -> Self {
        self.soft = Some(value);
        self
    }
    pub fn hard(mut self, value: f64) -> Self {
        self.hard = Some(value);
        self
    }
    pub fn temp(mut self, value: f64) -> Self {
        self.temp = Some(value);
        self
    }
    pub fn recycles(mut self, value: usize) -> Self {
        self.recycles = Some(value);
        self
    }
    pub fn models(mut self, value: usize) -> Self {
        self.models = Some(value);
        self
    }
    pub fn sample_models(mut self, value: bool) -> Self {
        self.sample_models = Some(value);
        self
    }
    pub fn dropout(mut self, value: bool) -> Self {
        self.dropout = Some(value);
        self
    }
    pub fn lr(mut self, value: f64) -> Self {
        self.lr = Some(value);
        self
    }
    pub fn weight(mut self, term: &str, value: f64) -> Self {
        self.weights
            .get_or_insert_with(LossWeights::new)
            .insert(term.to_string(), value);
        self
    }
    pub fn template_dropout(mut self, value: f64) -> Self {
        self.template_dropout = Some(value);
        self
    }
    pub fn pos(mut self, positions: Vec<usize>) -> Self {
        self.pos = Some(positions);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies every set field to `options`. Does not validate.
    pub fn apply_to(&self, options: &mut DesignOptions) {
        if let Some(v) = self.soft {
            options.soft = v;
        }
        if let Some(v) = self.hard {
            options.hard = v;
        }
        if let Some(v) = self.temp {
            options.temp = v;
        }
        if let Some(v) = self.recycles {
            options.recycles = v;
        }
        if let Some(v) = self.models {
            options.models = v;
        }
        if let Some(v) = self.sample_models {
            options.sample_models = v;
        }
        if let Some(v) = self.dropout {
            options.dropout = v;
        }
        if let Some(v) = self.lr {
            options.lr = v;
        }
        if let Some(weights) = &self.weights {
            options
                .weights
                .extend(weights.iter().map(|(k, v)| (k.clone(), *v)));
        }
        if let Some(v) = self.template_dropout {
            options.template.dropout = v;
        }
        if let Some(pos) = &self.pos {
            options.pos = Some(pos.clone());
        }
    }
}

/// Fixed, per-session facts supplied by the layer that prepared the inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub protocol: Protocol,
    /// Length of the designed region.
    pub design_len: usize,
    /// Length of the fixed target preceding the designed region (binder only).
    pub target_len: usize,
    pub wild_type: Option<Vec<usize>>,
    pub redesign: bool,
    pub use_templates: bool,
    pub recycle_mode: RecycleMode,
    pub options: DesignOptions,
}

impl SessionConfig {
    /// Whether a reference sequence exists for recovery scoring.
    pub fn scores_sequence_recovery(&self) -> bool {
        self.protocol.scores_recovery(self.redesign)
    }

    /// Checks that the reference sequence lines up with `options`.
    pub fn check_reference(&self, options: &DesignOptions) -> Result<(), ConfigError> {
        if !self.scores_sequence_recovery() {
            return Ok(());
        }
        let wild_type = self
            .wild_type
            .as_ref()
            .ok_or(ConfigError::MissingParameter("wild_type"))?;
        let expected = options.pos.as_ref().map_or(self.design_len, Vec::len);
        if wild_type.len() != expected {
            return Err(ConfigError::InvalidValue {
                name: "wild_type",
                reason: format!(
                    "reference has {} residues but {} positions are scored",
                    wild_type.len(),
                    expected
                ),
            });
        }
        if let Some(&p) = options
            .pos
            .iter()
            .flatten()
            .find(|&&p| p >= self.design_len)
        {
            return Err(ConfigError::InvalidValue {
                name: "pos",
                reason: format!(
                    "position {} is outside the designed region of length {}",
                    p, self.design_len
                ),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct SessionConfigBuilder {
    protocol: Option<Protocol>,
    design_len: Option<usize>,
    target_len: Option<usize>,
    wild_type: Option<Vec<usize>>,
    redesign: bool,
    use_templates: bool,
    recycle_mode: RecycleMode,
    options: Option<DesignOptions>,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }
    pub fn design_len(mut self, len: usize) -> Self {
        self.design_len = Some(len);
        self
    }
    pub fn target_len(mut self, len: usize) -> Self {
        self.target_len = Some(len);
        self
    }
    pub fn wild_type(mut self, indices: Vec<usize>) -> Self {
        self.wild_type = Some(indices);
        self
    }
    pub fn redesign(mut self, redesign: bool) -> Self {
        self.redesign = redesign;
        self
    }
    pub fn use_templates(mut self, use_templates: bool) -> Self {
        self.use_templates = use_templates;
        self
    }
    pub fn recycle_mode(mut self, mode: RecycleMode) -> Self {
        self.recycle_mode = mode;
        self
    }
    pub fn options(mut self, options: DesignOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let protocol = self
            .protocol
            .ok_or(ConfigError::MissingParameter("protocol"))?;
        let design_len = self
            .design_len
            .ok_or(ConfigError::MissingParameter("design_len"))?;
        if design_len == 0 {
            return Err(ConfigError::InvalidValue {
                name: "design_len",
                reason: "designed region must contain at least one residue".to_string(),
            });
        }
        let target_len = match protocol {
            Protocol::Binder => self
                .target_len
                .ok_or(ConfigError::MissingParameter("target_len"))?,
            _ => self.target_len.unwrap_or(0),
        };
        let options = self.options.unwrap_or_default();
        options.validate()?;

        let config = SessionConfig {
            protocol,
            design_len,
            target_len,
            wild_type: self.wild_type,
            redesign: self.redesign,
            use_templates: self.use_templates,
            recycle_mode: self.recycle_mode,
            options,
        };
        config.check_reference(&config.options)?;
        Ok(config)
    }
}
