//! One pass over held-out data.

use std::time::{Duration, Instant};

use emitfit_core::{DetectionSet, Device, Result, TrainingError};
use ndarray::{Array4, ArrayView4, Axis};

use crate::data::{Batch, transfer};
use crate::logging::TrainLogger;
use crate::model::{Loss, Network};
use crate::postprocess::PostProcessor;

pub use super::matching::MatchStats;
use super::matching::match_detections;

/// Everything the evaluation pass produced.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Sample-weighted mean of the summed per-head loss.
    pub metric: f64,
    /// Sample-weighted mean loss of each head.
    pub per_head_loss: Vec<f64>,
    pub samples: usize,
    pub batches: usize,
    /// Inputs, outputs, targets and weights of all batches, stacked along
    /// the sample axis.
    pub input: Array4<f32>,
    pub output: Array4<f32>,
    pub target: Array4<f32>,
    pub weight: Array4<f32>,
    pub predictions: DetectionSet,
    pub ground_truth: DetectionSet,
    pub matching: MatchStats,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationLoopDriver {
    batch_size: usize,
    device: Device,
    match_radius: f32,
}

struct Accumulated {
    input: Vec<Array4<f32>>,
    output: Vec<Array4<f32>>,
    target: Vec<Array4<f32>>,
    weight: Vec<Array4<f32>>,
    truth: Vec<(usize, Option<DetectionSet>)>,
    per_head: Vec<f64>,
    total: f64,
    samples: usize,
}

impl EvaluationLoopDriver {
    /// `batch_size` is the frame step used to merge per-batch ground truth.
    pub fn new(batch_size: usize, device: Device, match_radius: f32) -> Self {
        Self {
            batch_size: batch_size.max(1),
            device,
            match_radius,
        }
    }

    pub fn evaluate<N, I>(
        &self,
        network: &N,
        loss: &dyn Loss,
        post_processor: &dyn PostProcessor,
        batches: I,
        logger: &mut dyn TrainLogger,
        epoch: usize,
    ) -> Result<ValidationReport>
    where
        N: Network + ?Sized,
        I: IntoIterator<Item = Result<Batch>>,
    {
        let start = Instant::now();
        let mut acc = Accumulated {
            input: Vec::new(),
            output: Vec::new(),
            target: Vec::new(),
            weight: Vec::new(),
            truth: Vec::new(),
            per_head: vec![0.0; network.head_count()],
            total: 0.0,
            samples: 0,
        };

        for batch in batches {
            let batch = transfer(batch?, self.device)?;
            let n = batch.len();
            let output = network.infer(&batch.input)?;
            let loss_out = loss.evaluate(&output, &batch.target, &batch.weight)?;
            if loss_out.heads() != acc.per_head.len() {
                return Err(TrainingError::HeadCountMismatch {
                    expected: acc.per_head.len(),
                    actual: loss_out.heads(),
                }
                .into());
            }

            for (sum, &value) in acc.per_head.iter_mut().zip(loss_out.per_head.iter()) {
                *sum += f64::from(value) * n as f64;
            }
            acc.total += f64::from(loss_out.total()) * n as f64;
            acc.samples += n;

            let Batch {
                input,
                target,
                weight,
                ground_truth,
            } = batch;
            acc.input.push(input);
            acc.output.push(output);
            acc.target.push(target);
            acc.weight.push(weight);
            acc.truth.push((n, ground_truth));
        }

        let batches = acc.truth.len();
        if batches == 0 {
            return Err(TrainingError::EmptyEpoch {
                phase: "evaluation".into(),
            }
            .into());
        }

        let samples = acc.samples as f64;
        let metric = acc.total / samples;
        if !metric.is_finite() {
            tracing::warn!(epoch, metric, "validation loss is not finite");
        }

        let dim = acc
            .truth
            .iter()
            .find_map(|(_, gt)| gt.as_ref().map(DetectionSet::dim))
            .unwrap_or(3);
        let truth: Vec<DetectionSet> = acc
            .truth
            .into_iter()
            .map(|(n, gt)| gt.unwrap_or_else(|| DetectionSet::empty(dim, n)))
            .collect();
        let ground_truth = DetectionSet::concat(&truth, self.batch_size)?;

        let output = stack(&acc.output)?;
        let predictions = post_processor.process(&output)?;
        let matching = match_detections(&predictions, &ground_truth, self.match_radius);

        let report = ValidationReport {
            metric,
            per_head_loss: acc.per_head.iter().map(|v| v / samples).collect(),
            samples: acc.samples,
            batches,
            input: stack(&acc.input)?,
            output,
            target: stack(&acc.target)?,
            weight: stack(&acc.weight)?,
            predictions,
            ground_truth,
            matching,
            elapsed: start.elapsed(),
        };
        logger.log_validation(&report, epoch)?;
        Ok(report)
    }
}

fn stack(parts: &[Array4<f32>]) -> Result<Array4<f32>> {
    let views: Vec<ArrayView4<'_, f32>> = parts.iter().map(Array4::view).collect();
    ndarray::concatenate(Axis(0), &views).map_err(|e| {
        TrainingError::Network {
            message: format!("stacking evaluation outputs: {e}"),
        }
        .into()
    })
}
