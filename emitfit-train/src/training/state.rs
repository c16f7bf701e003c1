//! Run-wide state threaded through the epoch loop.

use serde::{Deserialize, Serialize};

use super::metrics::TrainingMetrics;
use super::plateau::PlateauScheduler;
use crate::model::{Network, Optimizer};

/// Epoch index, controlled values, both schedulers and the metric history.
/// Only the trainer writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerState {
    pub epoch: usize,
    /// Optimizer steps taken so far; indexes per-batch scalars.
    pub global_step: usize,
    pub learning_rate: f64,
    pub difficulty: f64,
    pub lr_scheduler: PlateauScheduler,
    pub curriculum: PlateauScheduler,
    pub metrics: TrainingMetrics,
}

impl TrainerState {
    pub fn new(
        learning_rate: f64,
        difficulty: f64,
        lr_scheduler: PlateauScheduler,
        curriculum: PlateauScheduler,
    ) -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            learning_rate,
            difficulty,
            lr_scheduler,
            curriculum,
            metrics: TrainingMetrics::default(),
        }
    }
}

/// What the training driver may touch for one epoch.
pub struct TrainingContext<'a> {
    pub network: &'a mut dyn Network,
    pub optimizer: &'a mut dyn Optimizer,
    pub epoch: usize,
    /// Global step of the first batch in this epoch.
    pub first_step: usize,
}
