//! Epoch-level orchestration: the training and evaluation drivers, the
//! plateau schedulers, gradient rescaling, checkpoints and the trainer that
//! ties them together.

pub mod checkpoint;
pub mod evaluate;
pub mod matching;
pub mod metrics;
pub mod plateau;
pub mod rescale;
pub mod runner;
pub mod state;
pub mod train_epoch;

pub use checkpoint::{CheckpointFile, ModelCheckpoint, RotationTimer};
pub use evaluate::{EvaluationLoopDriver, ValidationReport};
pub use matching::{MatchStats, match_detections};
pub use metrics::{EpochRecord, TrainingMetrics};
pub use plateau::{PlateauAction, PlateauScheduler, SchedulerState};
pub use rescale::{GradientRescaler, HeadWeights};
pub use runner::{DataRegime, Trainer, TrainerParts};
pub use state::{TrainerState, TrainingContext};
pub use train_epoch::{TrainEpochSummary, TrainingLoopDriver};
