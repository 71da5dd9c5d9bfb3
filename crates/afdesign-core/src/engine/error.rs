use thiserror::Error;

use super::config::ConfigError;
use super::predictor::PredictorError;
use crate::core::alphabet::AlphabetError;
use crate::core::sequence::SequenceError;
use crate::core::tree::TreeError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Invalid configuration: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("Predictor call failed: {source}")]
    Predictor {
        #[from]
        source: PredictorError,
    },

    #[error("Parameter tree error: {source}")]
    Tree {
        #[from]
        source: TreeError,
    },

    #[error("Sequence error: {source}")]
    Sequence {
        #[from]
        source: SequenceError,
    },

    #[error("Alphabet error: {source}")]
    Alphabet {
        #[from]
        source: AlphabetError,
    },

    #[error("Stage '{stage}' failed: {reason}")]
    StageFailed { stage: &'static str, reason: String },

    #[error("Internal logic error: {0}")]
    Internal(String),
}
