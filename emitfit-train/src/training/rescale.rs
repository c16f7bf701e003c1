//! Per-head gradient balancing.
//!
//! Each head's share of the loss gradient is probed through the network to
//! measure how strongly it alone would move the last shared layer. Heads are
//! then weighted so that they all pull with the reference norm.

use emitfit_core::config::HyperParams;
use emitfit_core::{ReferenceNorm, Result};
use serde::{Deserialize, Serialize};

use crate::model::{LossOutput, Network};

/// One positive, finite weight per output head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadWeights(pub Vec<f32>);

impl HeadWeights {
    pub fn uniform(heads: usize) -> Self {
        Self(vec![1.0; heads])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradientRescaler {
    reference: ReferenceNorm,
    epsilon: f64,
    min_weight: f64,
}

impl GradientRescaler {
    pub fn new(reference: ReferenceNorm, epsilon: f64) -> Self {
        let epsilon = if epsilon > 0.0 { epsilon } else { f64::EPSILON };
        Self {
            reference,
            epsilon,
            min_weight: epsilon,
        }
    }

    pub fn from_config(hyper: &HyperParams) -> Self {
        Self::new(hyper.rescale_reference, hyper.rescale_epsilon)
    }

    /// Weight given to heads that contribute no usable gradient.
    pub fn with_min_weight(mut self, min_weight: f64) -> Self {
        if min_weight > 0.0 && min_weight.is_finite() {
            self.min_weight = min_weight;
        }
        self
    }

    pub fn reference(&self) -> ReferenceNorm {
        self.reference
    }

    /// Probes every head of `loss.grad` through `network` and turns the
    /// norms into weights.
    pub fn rescale<N: Network + ?Sized>(&self, network: &N, loss: &LossOutput) -> Result<HeadWeights> {
        let norms = (0..loss.heads())
            .map(|head| network.probe_head_gradient(head, &loss.grad))
            .collect::<Result<Vec<f64>>>()?;
        let weights = self.weights_from_norms(&norms);
        tracing::trace!(?norms, weights = ?weights.as_slice(), "head gradients rescaled");
        Ok(weights)
    }

    /// `reference / norm` per head, with degenerate norms clamped to
    /// `min_weight`.
    pub fn weights_from_norms(&self, norms: &[f64]) -> HeadWeights {
        let usable: Vec<f64> = norms
            .iter()
            .copied()
            .filter(|n| n.is_finite() && *n > self.epsilon)
            .collect();

        let reference = match self.reference {
            ReferenceNorm::Max => usable.iter().copied().fold(0.0, f64::max),
            ReferenceNorm::Mean if usable.is_empty() => 0.0,
            ReferenceNorm::Mean => usable.iter().sum::<f64>() / usable.len() as f64,
            ReferenceNorm::Fixed(value) => value,
        };

        let min_weight = self.min_weight as f32;
        let weights = norms
            .iter()
            .map(|&norm| {
                if !norm.is_finite() || norm <= self.epsilon {
                    return min_weight;
                }
                let w = (reference / norm.max(self.epsilon)) as f32;
                if w.is_finite() && w > 0.0 { w } else { min_weight }
            })
            .collect();
        HeadWeights(weights)
    }
}
