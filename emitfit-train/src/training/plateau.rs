//! Plateau-triggered feedback control.
//!
//! The same scheduler drives both the learning rate (scaled down) and the
//! simulation difficulty (stepped up). Only [`PlateauScheduler::step`]
//! mutates its state.

use emitfit_core::ThresholdMode;
use emitfit_core::config::{CurriculumParams, LrSchedulerParams, PlateauParams};
use serde::{Deserialize, Serialize};

/// What happens to the controlled value when a plateau is detected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlateauAction {
    /// `value = max(value * factor, min_value)`
    Scale { factor: f64, min_value: f64 },
    /// `value = min(value + step_size, max_value)`
    Increment { step_size: f64, max_value: f64 },
}

impl PlateauAction {
    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            PlateauAction::Scale { factor, min_value } => (value * factor).max(min_value),
            PlateauAction::Increment {
                step_size,
                max_value,
            } => (value + step_size).min(max_value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub best: f64,
    pub num_bad_epochs: usize,
    pub cooldown_counter: usize,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            best: f64::INFINITY,
            num_bad_epochs: 0,
            cooldown_counter: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauScheduler {
    name: String,
    patience: usize,
    threshold: f64,
    threshold_mode: ThresholdMode,
    cooldown: usize,
    verbose: bool,
    disabled: bool,
    action: PlateauAction,
    state: SchedulerState,
}

impl PlateauScheduler {
    pub fn new(name: impl Into<String>, params: &PlateauParams, action: PlateauAction) -> Self {
        Self {
            name: name.into(),
            patience: params.patience,
            threshold: params.threshold,
            threshold_mode: params.threshold_mode,
            cooldown: params.cooldown,
            verbose: params.verbose,
            disabled: params.disabled,
            action,
            state: SchedulerState::default(),
        }
    }

    pub fn learning_rate(params: &LrSchedulerParams) -> Self {
        Self::new(
            "learning_rate",
            &params.plateau,
            PlateauAction::Scale {
                factor: params.factor,
                min_value: params.min_lr,
            },
        )
    }

    pub fn curriculum(params: &CurriculumParams) -> Self {
        Self::new(
            "difficulty",
            &params.plateau,
            PlateauAction::Increment {
                step_size: params.step_size,
                max_value: params.max_value,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn action(&self) -> PlateauAction {
        self.action
    }

    fn is_better(&self, metric: f64) -> bool {
        match self.threshold_mode {
            ThresholdMode::Abs => metric < self.state.best - self.threshold,
            ThresholdMode::Rel => metric < self.state.best * (1.0 - self.threshold),
        }
    }

    /// Feeds one epoch's metric. Returns `true` when the action was applied
    /// to `controlled`.
    pub fn step(&mut self, metric: f64, controlled: &mut f64) -> bool {
        if self.disabled {
            return false;
        }

        if self.is_better(metric) {
            self.state.best = metric;
            self.state.num_bad_epochs = 0;
            return false;
        }

        self.state.num_bad_epochs += 1;
        if self.state.num_bad_epochs >= self.patience && self.state.cooldown_counter == 0 {
            let old = *controlled;
            *controlled = self.action.apply(old);
            self.state.num_bad_epochs = 0;
            self.state.cooldown_counter = self.cooldown;
            if self.verbose {
                tracing::info!(scheduler = %self.name, old, new = *controlled, "plateau reached");
            } else {
                tracing::debug!(scheduler = %self.name, old, new = *controlled, "plateau reached");
            }
            return true;
        }

        if self.state.cooldown_counter > 0 {
            self.state.cooldown_counter -= 1;
        }
        false
    }
}
