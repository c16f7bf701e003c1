//! One pass over the training data.

use std::time::{Duration, Instant};

use emitfit_core::{Device, Result, TrainingError};
use indicatif::{ProgressBar, ProgressStyle};

use super::rescale::GradientRescaler;
use super::state::TrainingContext;
use crate::data::{Batch, transfer};
use crate::logging::TrainLogger;
use crate::model::Loss;

const PROGRESS_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} {msg}";

#[derive(Debug, Clone, PartialEq)]
pub struct TrainEpochSummary {
    /// Sample-weighted mean of the summed per-head loss before rescaling.
    pub mean_loss: f64,
    pub per_head_loss: Vec<f64>,
    pub batches: usize,
    pub samples: usize,
    pub elapsed: Duration,
}

/// Runs fetch, transfer, forward, loss, optional rescale, zero-grad,
/// backward and optimizer step for every batch of an epoch.
#[derive(Debug, Clone)]
pub struct TrainingLoopDriver {
    device: Device,
    rescaler: Option<GradientRescaler>,
    log_every: usize,
    show_progress: bool,
}

impl TrainingLoopDriver {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            rescaler: None,
            log_every: 10,
            show_progress: false,
        }
    }

    pub fn with_rescaler(mut self, rescaler: GradientRescaler) -> Self {
        self.rescaler = Some(rescaler);
        self
    }

    pub fn with_log_every(mut self, log_every: usize) -> Self {
        self.log_every = log_every.max(1);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        match ProgressStyle::with_template(PROGRESS_TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(e) => tracing::debug!("default progress style: {e}"),
        }
        bar
    }

    /// Trains on every batch in `batches`. The first error aborts the epoch.
    pub fn train_epoch<I>(
        &self,
        ctx: TrainingContext<'_>,
        loss: &dyn Loss,
        batches: I,
        logger: &mut dyn TrainLogger,
    ) -> Result<TrainEpochSummary>
    where
        I: IntoIterator<Item = Result<Batch>>,
    {
        let TrainingContext {
            network,
            optimizer,
            epoch,
            first_step,
        } = ctx;

        let mut batches = batches.into_iter();
        let bar = self.progress_bar(batches.size_hint().0);
        let start = Instant::now();

        let mut per_head = vec![0.0f64; network.head_count()];
        let mut total = 0.0f64;
        let mut samples = 0usize;
        let mut index = 0usize;

        loop {
            let data_start = Instant::now();
            let Some(batch) = batches.next() else {
                break;
            };
            let batch = batch?;
            let t_data = data_start.elapsed().as_secs_f64();

            let batch_start = Instant::now();
            let batch = transfer(batch, self.device)?;
            let n = batch.len();
            let output = network.forward(&batch.input)?;
            let mut loss_out = loss.evaluate(&output, &batch.target, &batch.weight)?;

            let batch_loss = f64::from(loss_out.total());
            if !batch_loss.is_finite() {
                return Err(TrainingError::NonFinite {
                    what: format!("training loss (epoch {epoch}, batch {index})"),
                }
                .into());
            }
            if loss_out.heads() != per_head.len() {
                return Err(TrainingError::HeadCountMismatch {
                    expected: per_head.len(),
                    actual: loss_out.heads(),
                }
                .into());
            }
            for (sum, &value) in per_head.iter_mut().zip(loss_out.per_head.iter()) {
                *sum += f64::from(value) * n as f64;
            }

            if let Some(rescaler) = &self.rescaler {
                let weights = rescaler.rescale(&*network, &loss_out)?;
                loss_out.reweight(weights.as_slice())?;
            }

            network.zero_grad();
            network.backward(&loss_out.grad)?;
            optimizer.step(&mut network.parameters())?;
            let t_batch = batch_start.elapsed().as_secs_f64();

            total += batch_loss * n as f64;
            samples += n;

            let step = first_step + index;
            if index % self.log_every == 0 {
                logger.add_scalar("train/batch_loss", batch_loss, step)?;
                logger.add_scalar("train/t_batch", t_batch, step)?;
                logger.add_scalar("train/t_data", t_data, step)?;
            }
            bar.set_message(format!(
                "E: {epoch} - t: {t_batch:.2} - t_dat: {t_data:.2} - L: {batch_loss:.3}"
            ));
            bar.inc(1);
            index += 1;
        }
        bar.finish_and_clear();

        if index == 0 {
            return Err(TrainingError::EmptyEpoch {
                phase: "training".into(),
            }
            .into());
        }

        let denom = samples.max(1) as f64;
        let summary = TrainEpochSummary {
            mean_loss: total / denom,
            per_head_loss: per_head.iter().map(|v| v / denom).collect(),
            batches: index,
            samples,
            elapsed: start.elapsed(),
        };
        tracing::debug!(
            epoch,
            batches = summary.batches,
            loss = summary.mean_loss,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "training epoch finished"
        );
        Ok(summary)
    }
}
