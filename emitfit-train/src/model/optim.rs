//! Optimizers.

use std::collections::HashMap;

use emitfit_core::{Result, TrainingError};
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

use super::ParamMut;

/// Applies accumulated gradients to parameters.
pub trait Optimizer: Send {
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn step(&mut self, params: &mut [ParamMut<'_>]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Adam with bias correction. Moment buffers are keyed by parameter name and
/// created on first use.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    params: AdamParams,
    t: u64,
    first: HashMap<&'static str, ArrayD<f32>>,
    second: HashMap<&'static str, ArrayD<f32>>,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self::with_params(lr, AdamParams::default())
    }

    pub fn with_params(lr: f64, params: AdamParams) -> Self {
        Self {
            lr,
            params,
            t: 0,
            first: HashMap::new(),
            second: HashMap::new(),
        }
    }

    pub fn steps_taken(&self) -> u64 {
        self.t
    }
}

impl Optimizer for Adam {
    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn step(&mut self, params: &mut [ParamMut<'_>]) -> Result<()> {
        for p in params.iter() {
            if p.grad.iter().any(|g| !g.is_finite()) {
                return Err(TrainingError::NonFinite {
                    what: format!("gradient of '{}'", p.name),
                }
                .into());
            }
        }

        self.t += 1;
        let AdamParams {
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let t = self.t as i32;
        let step = (self.lr * (1.0 - beta2.powi(t)).sqrt() / (1.0 - beta1.powi(t))) as f32;
        let (b1, b2, eps, wd) = (beta1 as f32, beta2 as f32, eps as f32, weight_decay as f32);

        for p in params.iter_mut() {
            let m = self
                .first
                .entry(p.name)
                .or_insert_with(|| ArrayD::zeros(p.value.raw_dim()));
            let v = self
                .second
                .entry(p.name)
                .or_insert_with(|| ArrayD::zeros(p.value.raw_dim()));
            Zip::from(&mut p.value)
                .and(m)
                .and(v)
                .and(&p.grad)
                .for_each(|value, m, v, &g| {
                    let g = g + wd * *value;
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *value -= step * *m / (v.sqrt() + eps);
                });
        }
        Ok(())
    }
}
