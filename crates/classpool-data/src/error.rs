//! Error types for classpool-data.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading, building, caching or batching samples.
#[derive(Debug, Error)]
pub enum Error {
    /// A raw input file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A raw input file is not valid JSON of the expected shape.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The edge file does not list one entry per class.
    #[error("edge file lists {found} classes, expected {expected}")]
    FormatMismatch { expected: usize, found: usize },

    /// A node record carries a label outside `1..=num_classes`.
    #[error("node {node_id} has label {label}, expected 1..={num_classes}")]
    LabelOutOfRange {
        node_id: i64,
        label: i64,
        num_classes: usize,
    },

    /// A sample violates the dataset's shape invariants.
    #[error("invalid sample {index}: {reason}")]
    InvalidSample { index: usize, reason: String },

    /// Reading or writing a cached artifact failed.
    #[error("cache artifact {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
