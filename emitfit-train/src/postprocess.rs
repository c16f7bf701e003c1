//! Turning dense network output into detections.

use emitfit_core::config::PostProcessParams;
use emitfit_core::{DetectionRecord, DetectionSet, Result, TrainingError};
use ndarray::{Array4, ArrayView2, Axis};

use crate::simulation::channel;

pub trait PostProcessor: Send {
    /// Detections in `output` of shape `(n, heads, height, width)`. Sample
    /// `i` becomes frame `i`.
    fn process(&self, output: &Array4<f32>) -> Result<DetectionSet>;
}

/// Keeps pixels whose probability reaches `prob_threshold`, optionally only
/// where it is a 3x3 local maximum, and decodes the regression heads at
/// those pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPostProcessor {
    pub prob_threshold: f32,
    pub local_maximum: bool,
    pub dim: u8,
    /// Multiplies the photon head back to photon counts.
    pub photon_scale: f32,
    /// Multiplies the z head back to nanometres.
    pub z_scale: f32,
}

impl ThresholdPostProcessor {
    pub fn new(params: &PostProcessParams, dim: u8, photon_scale: f32, z_scale: f32) -> Self {
        Self {
            prob_threshold: params.prob_threshold,
            local_maximum: params.local_maximum,
            dim,
            photon_scale,
            z_scale,
        }
    }

    fn is_local_maximum(prob: &ArrayView2<'_, f32>, row: usize, col: usize) -> bool {
        let (h, w) = prob.dim();
        let p = prob[[row, col]];
        for r in row.saturating_sub(1)..(row + 2).min(h) {
            for c in col.saturating_sub(1)..(col + 2).min(w) {
                if (r, c) == (row, col) {
                    continue;
                }
                let q = prob[[r, c]];
                // ties go to the first pixel in scan order
                if q > p || (q == p && (r, c) < (row, col)) {
                    return false;
                }
            }
        }
        true
    }
}

impl PostProcessor for ThresholdPostProcessor {
    fn process(&self, output: &Array4<f32>) -> Result<DetectionSet> {
        let (n, heads, h, w) = output.dim();
        if heads <= channel::Z {
            return Err(TrainingError::HeadCountMismatch {
                expected: channel::Z + 1,
                actual: heads,
            }
            .into());
        }

        let mut records = Vec::new();
        for (frame, sample) in output.axis_iter(Axis(0)).enumerate() {
            let prob = sample.index_axis(Axis(0), channel::PROB);
            for row in 0..h {
                for col in 0..w {
                    let p = prob[[row, col]];
                    if p.is_nan() || p < self.prob_threshold {
                        continue;
                    }
                    if self.local_maximum && !Self::is_local_maximum(&prob, row, col) {
                        continue;
                    }
                    let x = col as f32 + sample[[channel::DX, row, col]];
                    let y = row as f32 + sample[[channel::DY, row, col]];
                    let z = if self.dim == 3 {
                        sample[[channel::Z, row, col]] * self.z_scale
                    } else {
                        0.0
                    };
                    let photons = sample[[channel::PHOTONS, row, col]] * self.photon_scale;
                    records.push(DetectionRecord::new(frame, [x, y, z], photons, p));
                }
            }
        }

        let set = DetectionSet::new(records, self.dim).with_samples(n);
        tracing::trace!(frames = n, detections = set.len(), "post-processed output");
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(local_maximum: bool) -> ThresholdPostProcessor {
        ThresholdPostProcessor {
            prob_threshold: 0.5,
            local_maximum,
            dim: 3,
            photon_scale: 1000.0,
            z_scale: 500.0,
        }
    }

    fn output() -> Array4<f32> {
        let mut out = Array4::<f32>::zeros((2, 5, 4, 4));
        out[[0, channel::PROB, 1, 1]] = 0.9;
        out[[0, channel::PROB, 1, 2]] = 0.6;
        out[[0, channel::DX, 1, 1]] = 0.25;
        out[[0, channel::DY, 1, 1]] = -0.5;
        out[[0, channel::Z, 1, 1]] = 0.5;
        out[[0, channel::PHOTONS, 1, 1]] = 2.0;
        out[[1, channel::PROB, 3, 0]] = 0.7;
        out
    }

    #[test]
    fn test_local_maximum_suppression() {
        let set = processor(true).process(&output()).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.frames(), vec![0, 1]);
        assert_eq!(set.provenance().samples, 2);

        let first = &set.records()[0];
        assert_eq!(first.xyz, [1.25, 0.5, 250.0]);
        assert_eq!(first.photons, 2000.0);
        assert_eq!(first.prob, 0.9);
    }

    #[test]
    fn test_threshold_only() {
        let set = processor(false).process(&output()).unwrap();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_plateau_keeps_single_pixel() {
        let mut out = Array4::<f32>::zeros((1, 5, 3, 3));
        out[[0, channel::PROB, 1, 1]] = 0.8;
        out[[0, channel::PROB, 1, 2]] = 0.8;
        let set = processor(true).process(&out).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.records()[0].xyz[0], 1.0);
    }

    #[test]
    fn test_requires_regression_heads() {
        let out = Array4::<f32>::zeros((1, 4, 2, 2));
        assert!(processor(true).process(&out).is_err());
    }

    #[test]
    fn test_two_dimensional_output_has_no_depth() {
        let mut p = processor(true);
        p.dim = 2;
        let set = p.process(&output()).unwrap();
        assert!(set.iter().all(|r| r.xyz[2] == 0.0));
    }
}
