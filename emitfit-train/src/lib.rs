//! # emitfit train
//!
//! Training orchestration for single-molecule localisation networks.
//!
//! A [`Trainer`] runs epochs of training and validation over either a
//! precomputed dataset or samples simulated on demand. Two plateau
//! schedulers watch the validation loss: one lowers the learning rate, the
//! other raises the simulation difficulty and forces every cached sample to
//! be regenerated. Per-head gradient rescaling balances the loss heads
//! before each optimizer step.
//!
//! ```no_run
//! use emitfit_core::{ConfigOverrides, load_config};
//! use emitfit_train::Trainer;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config(None, &ConfigOverrides::new())?;
//! let mut trainer = Trainer::from_config(&config)?;
//! let metrics = trainer.run()?;
//! println!("best epoch: {:?}", metrics.best_epoch);
//! # Ok(())
//! # }
//! ```

pub mod data;
pub mod logging;
pub mod model;
pub mod persistence;
pub mod postprocess;
pub mod simulation;
pub mod training;

pub use data::{Batch, DataLoader, OnlineDataset, PrecomputedDataset, Sample, SampleSource};
pub use logging::{JsonlLogger, MemoryLogger, MultiLogger, TracingLogger, TrainLogger};
pub use model::{Adam, Loss, Mode, Network, Optimizer, PixelNet, WeightedMse};
pub use postprocess::{PostProcessor, ThresholdPostProcessor};
pub use simulation::{GaussianSimulator, Simulator};
pub use training::{
    DataRegime, EvaluationLoopDriver, GradientRescaler, ModelCheckpoint, PlateauScheduler,
    Trainer, TrainerParts, TrainingLoopDriver, ValidationReport,
};
