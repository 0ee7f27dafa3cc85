//! Error types for segmentation model operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Query/key channel mismatch: query has {query} channels, key has {key}")]
    ChannelMismatch { query: usize, key: usize },

    #[error("Batch size mismatch: sliding window attention requires {expected}, got {got}")]
    BatchSizeMismatch { expected: usize, got: usize },

    #[error("Decoder stage requires a cross-attention input")]
    MissingCrossInput,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unknown {kind} variant: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Empty sequence")]
    EmptySequence,

    #[error("Numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    #[error("Non-finite loss at epoch {epoch}, batch {batch}")]
    NonFiniteLoss { epoch: usize, batch: usize },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Npy error: {0}")]
    Npy(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
