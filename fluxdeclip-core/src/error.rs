use std::path::PathBuf;

use candle_core::Shape;
use thiserror::Error;

/// Errors surfaced by model construction, checkpoint loading and forward evaluation.
///
/// Every variant is fatal: the computation is deterministic, so nothing here is retried.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid model configuration: {0}")]
    Configuration(String),

    #[error("Unexpected shape for `{name}`: {shape:?}")]
    Shape { name: &'static str, shape: Shape },

    #[error("Modulation tensor has {got} rows but the block inventory consumes {expected}.")]
    ModulationLayout { expected: usize, got: usize },

    #[error("Unable to load weights from {path}: {source}")]
    StateLoad {
        path: PathBuf,
        source: candle_core::Error,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("IoError: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0:?}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(name: &'static str, shape: &Shape) -> Self {
        Self::Shape {
            name,
            shape: shape.clone(),
        }
    }

    pub(crate) fn state_load(path: impl Into<PathBuf>, source: candle_core::Error) -> Self {
        Self::StateLoad {
            path: path.into(),
            source,
        }
    }
}
