//! Error types for classpool-nn.

use thiserror::Error;

/// classpool-nn error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Dataset loading or batching error.
    #[error(transparent)]
    Data(#[from] classpool_data::Error),

    /// Train and test splits disagree on a model dimension.
    #[error("dimension mismatch in {what}: train has {train}, test has {test}")]
    DimensionMismatch {
        what: &'static str,
        train: usize,
        test: usize,
    },

    /// A split has no samples to train or evaluate on.
    #[error("split `{0}` has no samples")]
    EmptySplit(classpool_data::Split),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
