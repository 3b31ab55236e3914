use thiserror::Error;

use crate::candle_distributions::Family;

/// Errors raised while building or running the hierarchical model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// inconsistent or unsupported configuration, detected at load/construction
    #[error("configuration error: {0}")]
    Config(String),

    #[error("error-based inference is not implemented for the {family} output distribution")]
    UnsupportedOutput { family: Family },

    /// a call that needs state produced by an earlier `infer`/`generate`
    #[error("missing state: {0}")]
    MissingState(&'static str),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        ModelError::Config(msg.into())
    }
}

/// `bail!`-style early return with a configuration error
#[macro_export]
macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::ModelError::Config(format!($($arg)*)))
    };
}
