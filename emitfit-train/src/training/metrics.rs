//! Per-epoch metric history.

use serde::{Deserialize, Serialize};

use super::evaluate::MatchStats;

/// What one epoch produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    pub difficulty: f64,
    pub matching: MatchStats,
    pub lr_reduced: bool,
    pub difficulty_raised: bool,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    pub fn record_epoch(&mut self, record: EpochRecord) {
        let is_best = record.val_loss.is_finite()
            && self.best_val_loss.is_none_or(|best| record.val_loss < best);
        if is_best {
            self.best_val_loss = Some(record.val_loss);
            self.best_epoch = Some(record.epoch);
        }
        self.total_training_time_secs += record.elapsed_secs;
        self.epochs.push(record);
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs.len()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    pub fn val_loss_history(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.val_loss).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: usize, val_loss: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            train_loss: val_loss * 0.9,
            val_loss,
            learning_rate: 1e-4,
            difficulty: 15.0,
            matching: MatchStats::default(),
            lr_reduced: false,
            difficulty_raised: false,
            elapsed_secs: 1.5,
        }
    }

    #[test]
    fn test_tracks_best_epoch() {
        let mut metrics = TrainingMetrics::default();
        metrics.record_epoch(record(0, 0.6));
        metrics.record_epoch(record(1, 0.4));
        metrics.record_epoch(record(2, 0.5));
        assert_eq!(metrics.epochs_completed(), 3);
        assert_eq!(metrics.best_epoch, Some(1));
        assert_eq!(metrics.best_val_loss, Some(0.4));
        assert_eq!(metrics.total_training_time_secs, 4.5);
        assert_eq!(metrics.val_loss_history(), vec![0.6, 0.4, 0.5]);
    }

    #[test]
    fn test_non_finite_loss_is_never_best() {
        let mut metrics = TrainingMetrics::default();
        metrics.record_epoch(record(0, f64::NAN));
        assert_eq!(metrics.best_epoch, None);
        metrics.record_epoch(record(1, 2.0));
        assert_eq!(metrics.best_epoch, Some(1));
    }
}
