//! Per-head losses.

use emitfit_core::{Result, TrainingError};
use ndarray::{Array1, Array4, Axis, Zip};

use crate::data::shape_mismatch;

/// Loss value split by output head, plus its gradient with respect to the
/// network output.
#[derive(Debug, Clone, PartialEq)]
pub struct LossOutput {
    pub per_head: Array1<f32>,
    /// Same shape as the network output.
    pub grad: Array4<f32>,
}

impl LossOutput {
    pub fn total(&self) -> f32 {
        self.per_head.sum()
    }

    pub fn heads(&self) -> usize {
        self.per_head.len()
    }

    /// Scales head `k` of both the loss and the gradient by `weights[k]`.
    pub fn reweight(&mut self, weights: &[f32]) -> Result<()> {
        if weights.len() != self.heads() {
            return Err(TrainingError::HeadCountMismatch {
                expected: self.heads(),
                actual: weights.len(),
            }
            .into());
        }
        for (k, &w) in weights.iter().enumerate() {
            self.per_head[k] *= w;
            self.grad.index_axis_mut(Axis(1), k).mapv_inplace(|g| g * w);
        }
        Ok(())
    }
}

pub trait Loss: Send {
    /// Loss of `output` against `target`, weighted element-wise by `weight`.
    /// All three share the shape `(n, heads, height, width)`.
    fn evaluate(
        &self,
        output: &Array4<f32>,
        target: &Array4<f32>,
        weight: &Array4<f32>,
    ) -> Result<LossOutput>;
}

/// Weighted mean squared error, averaged over samples and pixels but not
/// over heads.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedMse;

impl Loss for WeightedMse {
    fn evaluate(
        &self,
        output: &Array4<f32>,
        target: &Array4<f32>,
        weight: &Array4<f32>,
    ) -> Result<LossOutput> {
        if output.shape() != target.shape() {
            return Err(shape_mismatch("loss target", output.shape(), target.shape()));
        }
        if output.shape() != weight.shape() {
            return Err(shape_mismatch("loss weight", output.shape(), weight.shape()));
        }

        let (n, heads, h, w) = output.dim();
        let count = (n * h * w).max(1) as f32;
        let mut grad = Array4::<f32>::zeros(output.dim());
        let mut squared = Array4::<f32>::zeros(output.dim());
        Zip::from(&mut grad)
            .and(&mut squared)
            .and(output)
            .and(target)
            .and(weight)
            .for_each(|g, sq, &o, &t, &wt| {
                let diff = o - t;
                *sq = wt * diff * diff / count;
                *g = 2.0 * wt * diff / count;
            });

        let per_head = Array1::from_shape_fn(heads, |k| squared.index_axis(Axis(1), k).sum());
        Ok(LossOutput { per_head, grad })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_weighted_mse_per_head() {
        let output = Array4::from_shape_fn((2, 2, 1, 2), |(_, k, _, _)| k as f32 + 1.0);
        let target = Array4::<f32>::zeros((2, 2, 1, 2));
        let mut weight = Array4::<f32>::ones((2, 2, 1, 2));
        weight[[0, 1, 0, 0]] = 0.0;

        let loss = WeightedMse.evaluate(&output, &target, &weight).unwrap();
        // head 0: four unit errors, head 1: three errors of 4
        assert_eq!(loss.per_head.to_vec(), vec![1.0, 3.0]);
        assert_eq!(loss.total(), 4.0);
        assert_eq!(loss.grad[[0, 1, 0, 0]], 0.0);
        assert_eq!(loss.grad[[1, 1, 0, 1]], 1.0);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let output = Array4::from_shape_fn((1, 1, 2, 2), |(_, _, y, x)| (y * 2 + x) as f32 * 0.3);
        let target = Array4::<f32>::from_elem((1, 1, 2, 2), 0.5);
        let weight = Array4::<f32>::from_elem((1, 1, 2, 2), 2.0);
        let loss = WeightedMse.evaluate(&output, &target, &weight).unwrap();

        let eps = 1e-3;
        let mut bumped = output.clone();
        bumped[[0, 0, 1, 0]] += eps;
        let plus = WeightedMse.evaluate(&bumped, &target, &weight).unwrap().total();
        let numeric = (plus - loss.total()) / eps;
        assert!((numeric - loss.grad[[0, 0, 1, 0]]).abs() < 1e-2);
    }

    #[test]
    fn test_reweight_scales_heads() {
        let output = Array4::<f32>::ones((1, 2, 1, 1));
        let target = Array4::<f32>::zeros((1, 2, 1, 1));
        let weight = Array4::<f32>::ones((1, 2, 1, 1));
        let mut loss = WeightedMse.evaluate(&output, &target, &weight).unwrap();
        loss.reweight(&[0.5, 2.0]).unwrap();
        assert_eq!(loss.per_head.to_vec(), vec![0.5, 2.0]);
        assert_eq!(loss.grad[[0, 1, 0, 0]], 4.0);
        assert!(loss.reweight(&[1.0]).is_err());
    }

    #[test]
    fn test_shape_mismatch() {
        let a = Array4::<f32>::zeros((1, 2, 2, 2));
        let b = Array4::<f32>::zeros((1, 3, 2, 2));
        assert!(WeightedMse.evaluate(&a, &b, &a).is_err());
    }
}
