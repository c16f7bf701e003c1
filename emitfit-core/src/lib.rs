//! # emitfit core
//!
//! Shared building blocks for the emitfit training stack: the layered
//! configuration, error types, the activation registry, and the emitter
//! records that flow between simulation, network output and evaluation.

pub mod activation;
pub mod config;
pub mod emitter;
pub mod error;

// Re-export commonly used types at the crate root.
pub use activation::Activation;
pub use config::{
    ConfigOverrides, DataMode, Device, ReferenceNorm, ThresholdMode, TrainConfig, load_config,
};
pub use emitter::{DetectionRecord, DetectionSet, Extent, Provenance};
pub use error::{
    CheckpointError, ConfigError, DataError, EmitfitError, Result, TrainingError,
};
