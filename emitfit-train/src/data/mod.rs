//! Samples, batches and the sources that produce them.

pub mod lifecycle;
pub mod loader;
pub mod online;
pub mod precomputed;

use emitfit_core::{DataError, DetectionSet, Device, Result};
use ndarray::{Array3, Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

pub use lifecycle::{DatasetLifecycleManager, DatasetState, Granularity, Lifetime};
pub use loader::DataLoader;
pub use online::OnlineDataset;
pub use precomputed::PrecomputedDataset;

/// One item of a dataset: network input, dense target, per-element loss
/// weight and the emitters the target was rendered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// `(channels, height, width)`
    pub input: Array3<f32>,
    /// `(heads, height, width)`
    pub target: Array3<f32>,
    /// Same shape as `target`.
    pub weight: Array3<f32>,
    /// Ground truth on frame 0.
    pub emitters: DetectionSet,
}

impl Sample {
    pub fn new(
        input: Array3<f32>,
        target: Array3<f32>,
        weight: Array3<f32>,
        emitters: DetectionSet,
    ) -> Result<Self> {
        if target.shape() != weight.shape() {
            return Err(shape_mismatch("sample weight", target.shape(), weight.shape()));
        }
        if input.shape()[1..] != target.shape()[1..] {
            return Err(shape_mismatch(
                "sample target frame",
                &input.shape()[1..],
                &target.shape()[1..],
            ));
        }
        Ok(Self {
            input,
            target,
            weight,
            emitters,
        })
    }
}

/// A collated batch. Every tensor shares the leading sample axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `(n, channels, height, width)`
    pub input: Array4<f32>,
    /// `(n, heads, height, width)`
    pub target: Array4<f32>,
    pub weight: Array4<f32>,
    /// Ground truth of all samples, merged with a frame step of 1.
    pub ground_truth: Option<DetectionSet>,
}

impl Batch {
    pub fn new(
        input: Array4<f32>,
        target: Array4<f32>,
        weight: Array4<f32>,
        ground_truth: Option<DetectionSet>,
    ) -> Result<Self> {
        let batch = Self {
            input,
            target,
            weight,
            ground_truth,
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.input.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that input, target, weight and ground truth describe the same samples.
    pub fn validate(&self) -> Result<()> {
        let n = self.len();
        if self.target.len_of(Axis(0)) != n {
            return Err(shape_mismatch(
                "batch target",
                self.input.shape(),
                self.target.shape(),
            ));
        }
        if self.weight.shape() != self.target.shape() {
            return Err(shape_mismatch(
                "batch weight",
                self.target.shape(),
                self.weight.shape(),
            ));
        }
        if self.input.shape()[2..] != self.target.shape()[2..] {
            return Err(shape_mismatch(
                "batch frame size",
                &self.input.shape()[2..],
                &self.target.shape()[2..],
            ));
        }
        if let Some(gt) = &self.ground_truth {
            if gt.provenance().samples != n {
                return Err(DataError::ShapeMismatch {
                    what: "batch ground truth samples".into(),
                    expected: vec![n],
                    actual: vec![gt.provenance().samples],
                }
                .into());
            }
        }
        Ok(())
    }

    /// Stacks samples along a new leading axis and merges their emitters
    /// so that sample `i` owns frame `i`.
    pub fn collate(samples: &[Sample]) -> Result<Batch> {
        let Some(first) = samples.first() else {
            return Err(DataError::EmptyDataset.into());
        };
        for sample in &samples[1..] {
            if sample.input.shape() != first.input.shape() {
                return Err(shape_mismatch(
                    "collated input",
                    first.input.shape(),
                    sample.input.shape(),
                ));
            }
            if sample.target.shape() != first.target.shape() {
                return Err(shape_mismatch(
                    "collated target",
                    first.target.shape(),
                    sample.target.shape(),
                ));
            }
        }

        let input = stack_views(samples.iter().map(|s| s.input.view()), "collated input")?;
        let target = stack_views(samples.iter().map(|s| s.target.view()), "collated target")?;
        let weight = stack_views(samples.iter().map(|s| s.weight.view()), "collated weight")?;
        let emitters: Vec<DetectionSet> = samples.iter().map(|s| s.emitters.clone()).collect();
        let ground_truth = DetectionSet::concat(&emitters, 1)?;

        Batch::new(input, target, weight, Some(ground_truth))
    }
}

/// Moves a batch onto `device`. Blocks until the copy is complete.
pub fn transfer(batch: Batch, device: Device) -> Result<Batch> {
    batch.validate()?;
    match device {
        Device::Cpu => Ok(batch),
    }
}

/// Random access to samples. `fetch` may simulate, so it takes `&mut self`.
pub trait SampleSource {
    fn len(&self) -> usize;

    fn fetch(&mut self, index: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn stack_views<'a>(
    views: impl Iterator<Item = ArrayView3<'a, f32>>,
    what: &str,
) -> Result<Array4<f32>> {
    let views: Vec<ArrayView3<'a, f32>> = views.collect();
    ndarray::stack(Axis(0), &views).map_err(|e| {
        DataError::Simulation {
            message: format!("{what}: {e}"),
        }
        .into()
    })
}

pub(crate) fn shape_mismatch(
    what: &str,
    expected: &[usize],
    actual: &[usize],
) -> emitfit_core::EmitfitError {
    DataError::ShapeMismatch {
        what: what.to_string(),
        expected: expected.to_vec(),
        actual: actual.to_vec(),
    }
    .into()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use emitfit_core::DetectionRecord;

    /// A deterministic sample with `emitters` records on frame 0.
    pub fn sample(channels: usize, heads: usize, size: usize, emitters: usize) -> Sample {
        let records = (0..emitters)
            .map(|i| DetectionRecord::new(0, [i as f32, i as f32, 0.0], 1000.0, 1.0))
            .collect();
        Sample::new(
            Array3::from_elem((channels, size, size), emitters as f32),
            Array3::zeros((heads, size, size)),
            Array3::ones((heads, size, size)),
            DetectionSet::new(records, 3),
        )
        .unwrap()
    }
}
