//! Error types for emitfit.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering configuration, data, training, and checkpoint domains.

use std::path::PathBuf;

/// Top-level error type for the emitfit libraries.
#[derive(Debug, thiserror::Error)]
pub enum EmitfitError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the configuration system. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Unknown {field} '{value}', expected one of: {expected}")]
    UnknownVariant {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors raised while simulating, loading or batching samples.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Shape mismatch in {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{dimension} of {size} is not divisible by {divisor}")]
    NotDivisible {
        dimension: String,
        size: usize,
        divisor: usize,
    },

    #[error("Cannot merge detection sets of dimensionality {left} and {right}")]
    DimensionMismatch { left: u8, right: u8 },

    #[error("Sample index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Dataset is empty")]
    EmptyDataset,

    #[error("Simulation failed: {message}")]
    Simulation { message: String },
}

/// Errors from the training and evaluation loops.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("Non-finite value in {what}")]
    NonFinite { what: String },

    #[error("Expected {expected} output heads, got {actual}")]
    HeadCountMismatch { expected: usize, actual: usize },

    #[error("Head index {head} out of range for {heads} heads")]
    HeadOutOfRange { head: usize, heads: usize },

    #[error("No forward pass cached; call forward before {operation}")]
    MissingForward { operation: String },

    #[error("{phase} epoch produced no batches")]
    EmptyEpoch { phase: String },

    #[error("Network error: {message}")]
    Network { message: String },
}

/// Errors from loading and saving model checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Checkpoint {path} failed integrity check")]
    DigestMismatch { path: PathBuf },

    #[error("Checkpoint is missing parameter '{name}'")]
    MissingParameter { name: String },

    #[error("Parameter '{name}' has shape {actual:?}, expected {expected:?}")]
    ParameterShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// A type alias for results using the top-level `EmitfitError`.
pub type Result<T> = std::result::Result<T, EmitfitError>;
