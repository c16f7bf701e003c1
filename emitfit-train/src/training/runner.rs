//! The epoch loop: train, evaluate, schedule, checkpoint.

use std::time::{Duration, Instant};

use emitfit_core::config::HyperParams;
use emitfit_core::{DataMode, Result, TrainConfig, TrainingError};
use ndarray::Axis;

use super::checkpoint::{ModelCheckpoint, RotationTimer};
use super::evaluate::{EvaluationLoopDriver, ValidationReport};
use super::metrics::{EpochRecord, TrainingMetrics};
use super::plateau::PlateauScheduler;
use super::rescale::GradientRescaler;
use super::state::{TrainerState, TrainingContext};
use super::train_epoch::{TrainEpochSummary, TrainingLoopDriver};
use crate::data::{DataLoader, OnlineDataset, PrecomputedDataset, SampleSource};
use crate::logging::{JsonlLogger, MultiLogger, TracingLogger, TrainLogger};
use crate::model::{Adam, Loss, Mode, Network, Optimizer, PixelNet, WeightedMse};
use crate::postprocess::{PostProcessor, ThresholdPostProcessor};
use crate::simulation::{GaussianSimulator, Simulator};

/// Where training and validation samples come from.
pub enum DataRegime<S> {
    Precomputed {
        train: PrecomputedDataset,
        test: PrecomputedDataset,
    },
    Online {
        train: OnlineDataset<S>,
        test: OnlineDataset<S>,
    },
}

impl<S: Simulator> DataRegime<S> {
    pub fn mode(&self) -> DataMode {
        match self {
            DataRegime::Precomputed { .. } => DataMode::Precomputed,
            DataRegime::Online { .. } => DataMode::Online,
        }
    }

    /// Current simulation difficulty; `None` for fixed datasets.
    pub fn difficulty(&self) -> Option<f64> {
        match self {
            DataRegime::Precomputed { .. } => None,
            DataRegime::Online { train, .. } => Some(train.difficulty()),
        }
    }

    pub fn train_source(&mut self) -> &mut dyn SampleSource {
        match self {
            DataRegime::Precomputed { train, .. } => train,
            DataRegime::Online { train, .. } => train,
        }
    }

    pub fn test_source(&mut self) -> &mut dyn SampleSource {
        match self {
            DataRegime::Precomputed { test, .. } => test,
            DataRegime::Online { test, .. } => test,
        }
    }

    /// Advances the training set's lifetime counters by one epoch.
    fn step_lifecycle(&mut self) {
        if let DataRegime::Online { train, .. } = self {
            train.step();
        }
    }

    /// Sets a new difficulty on both simulators and invalidates every
    /// cached sample.
    fn apply_difficulty(&mut self, value: f64) {
        if let DataRegime::Online { train, test } = self {
            train.set_difficulty(value);
            test.set_difficulty(value);
            train.force_regeneration();
            test.force_regeneration();
        }
    }
}

/// Collaborators a [`Trainer`] is assembled from.
pub struct TrainerParts<S> {
    pub network: Box<dyn Network>,
    pub optimizer: Box<dyn Optimizer>,
    pub loss: Box<dyn Loss>,
    pub post_processor: Box<dyn PostProcessor>,
    pub logger: Box<dyn TrainLogger>,
    pub data: DataRegime<S>,
}

pub struct Trainer<S> {
    network: Box<dyn Network>,
    optimizer: Box<dyn Optimizer>,
    loss: Box<dyn Loss>,
    post_processor: Box<dyn PostProcessor>,
    logger: Box<dyn TrainLogger>,
    data: DataRegime<S>,
    train_loader: DataLoader,
    test_loader: DataLoader,
    train_driver: TrainingLoopDriver,
    eval_driver: EvaluationLoopDriver,
    checkpoint: ModelCheckpoint,
    rotation: RotationTimer,
    state: TrainerState,
    num_epochs: usize,
    config: TrainConfig,
    graph_logged: bool,
}

impl<S: Simulator> Trainer<S> {
    pub fn new(config: &TrainConfig, parts: TrainerParts<S>) -> Self {
        let TrainerParts {
            network,
            mut optimizer,
            loss,
            post_processor,
            logger,
            data,
        } = parts;
        let hyper = &config.hyper;

        let mut train_driver = TrainingLoopDriver::new(hyper.device)
            .with_log_every(config.logger.log_every)
            .with_progress(config.logger.progress);
        if hyper.grad_rescale {
            train_driver = train_driver.with_rescaler(GradientRescaler::from_config(hyper));
        }

        optimizer.set_learning_rate(hyper.lr);
        let difficulty = data
            .difficulty()
            .unwrap_or(config.simulation.initial_emitter_av());
        let state = TrainerState::new(
            hyper.lr,
            difficulty,
            PlateauScheduler::learning_rate(&config.scheduler.lr),
            PlateauScheduler::curriculum(&config.scheduler.sim),
        );

        Self {
            network,
            optimizer,
            loss,
            post_processor,
            logger,
            data,
            train_loader: DataLoader::new(hyper.batch_size, true, hyper.seed),
            test_loader: DataLoader::new(hyper.batch_size, false, hyper.seed),
            train_driver,
            eval_driver: EvaluationLoopDriver::new(
                hyper.batch_size,
                hyper.device,
                hyper.post_processing.match_radius,
            ),
            checkpoint: ModelCheckpoint::new(&config.io.model_out),
            rotation: RotationTimer::new(Duration::from_secs(config.io.checkpoint_rotate_secs)),
            state,
            num_epochs: hyper.num_epochs,
            config: config.clone(),
            graph_logged: false,
        }
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.state.metrics
    }

    pub fn data(&self) -> &DataRegime<S> {
        &self.data
    }

    pub fn network(&self) -> &dyn Network {
        self.network.as_ref()
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn checkpoint(&self) -> &ModelCheckpoint {
        &self.checkpoint
    }

    /// Sends the run comment, each tag and every parameter group to the
    /// logging sink.
    fn log_run_setup(&mut self) -> Result<()> {
        let config = &self.config;
        let logger = self.logger.as_mut();
        if !config.logger.comment.is_empty() {
            logger.add_text("comment", &config.logger.comment)?;
        }
        for tag in &config.logger.tags {
            logger.add_text("tag", tag)?;
        }
        let groups = [
            ("config/io", serde_json::to_string_pretty(&config.io)?),
            ("config/hyper", serde_json::to_string_pretty(&config.hyper)?),
            (
                "config/simulation",
                serde_json::to_string_pretty(&config.simulation)?,
            ),
            ("config/logger", serde_json::to_string_pretty(&config.logger)?),
            (
                "config/scheduler",
                serde_json::to_string_pretty(&config.scheduler)?,
            ),
        ];
        for (name, text) in &groups {
            logger.add_text(name, text)?;
        }
        Ok(())
    }

    /// Logs the network structure using the first validation sample.
    /// Failures are reported and otherwise ignored.
    fn log_graph(&mut self) {
        self.graph_logged = true;
        let structure = self
            .data
            .test_source()
            .fetch(0)
            .and_then(|sample| self.network.describe(&sample.input.insert_axis(Axis(0))));
        let result = structure.and_then(|s| self.logger.add_graph(&s));
        if let Err(e) = result {
            tracing::warn!("could not log network graph: {e}");
        }
    }

    fn train(&mut self) -> Result<TrainEpochSummary> {
        self.network.set_mode(Mode::Train);
        let ctx = TrainingContext {
            network: self.network.as_mut(),
            optimizer: self.optimizer.as_mut(),
            epoch: self.state.epoch,
            first_step: self.state.global_step,
        };
        let batches = self.train_loader.iter(self.data.train_source());
        self.train_driver
            .train_epoch(ctx, self.loss.as_ref(), batches, self.logger.as_mut())
    }

    fn evaluate(&mut self) -> Result<ValidationReport> {
        self.network.set_mode(Mode::Eval);
        let batches = self.test_loader.iter(self.data.test_source());
        self.eval_driver.evaluate(
            self.network.as_ref(),
            self.loss.as_ref(),
            self.post_processor.as_ref(),
            batches,
            self.logger.as_mut(),
            self.state.epoch,
        )
    }

    /// One full epoch. Returns what was recorded for it.
    pub fn run_epoch(&mut self) -> Result<EpochRecord> {
        let start = Instant::now();
        let epoch = self.state.epoch;
        if !self.graph_logged {
            self.log_graph();
        }

        self.logger
            .add_scalar("learning/learning_rate", self.state.learning_rate, epoch)?;
        self.logger
            .add_scalar("learning/difficulty", self.state.difficulty, epoch)?;

        let train = self.train()?;
        let report = self.evaluate()?;
        let metric = report.metric;

        let mut lr = self.state.learning_rate;
        let lr_reduced = self.state.lr_scheduler.step(metric, &mut lr);
        if lr_reduced {
            self.optimizer.set_learning_rate(lr);
            self.state.learning_rate = lr;
        }

        let mut difficulty = self.state.difficulty;
        let difficulty_raised = self.data.mode() == DataMode::Online
            && self.state.curriculum.step(metric, &mut difficulty)
            && difficulty != self.state.difficulty;

        // Forced expiry comes after the regular step so its flags are the
        // ones visible to the next fetch.
        self.data.step_lifecycle();
        if difficulty_raised {
            self.data.apply_difficulty(difficulty);
            self.state.difficulty = difficulty;
            tracing::info!(epoch, difficulty, "simulation difficulty raised");
        }

        let record = EpochRecord {
            epoch,
            train_loss: train.mean_loss,
            val_loss: metric,
            learning_rate: self.state.learning_rate,
            difficulty: self.state.difficulty,
            matching: report.matching.clone(),
            lr_reduced,
            difficulty_raised,
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        self.state.metrics.record_epoch(record.clone());
        self.state.global_step += train.batches;
        self.state.epoch += 1;

        let rotate = self.rotation.due();
        self.checkpoint.save(self.network.as_ref(), epoch, rotate)?;
        self.logger.flush()?;

        tracing::info!(
            epoch,
            train_loss = record.train_loss,
            val_loss = record.val_loss,
            jaccard = record.matching.jaccard,
            lr = record.learning_rate,
            "epoch finished"
        );
        Ok(record)
    }

    /// Runs the configured number of epochs.
    pub fn run(&mut self) -> Result<&TrainingMetrics> {
        if self.num_epochs == 0 {
            return Err(TrainingError::EmptyEpoch {
                phase: "training run".into(),
            }
            .into());
        }
        self.log_run_setup()?;
        tracing::info!(
            epochs = self.num_epochs,
            data_mode = %self.data.mode(),
            "training started"
        );
        for _ in 0..self.num_epochs {
            self.run_epoch()?;
        }
        Ok(&self.state.metrics)
    }
}

impl Trainer<GaussianSimulator> {
    /// Builds the reference setup described by `config`: a [`PixelNet`]
    /// trained with [`Adam`] on a [`WeightedMse`] loss, thresholded
    /// post-processing, and tracing plus optional JSONL logging.
    pub fn from_config(config: &TrainConfig) -> Result<Self> {
        config.validate()?;
        let hyper = &config.hyper;

        let mut network = PixelNet::from_config(hyper)?;
        ModelCheckpoint::load(config.io.model_init.as_deref(), &mut network)?;

        let reference = GaussianSimulator::new(&config.simulation, hyper, hyper.seed)?;
        let post_processor = ThresholdPostProcessor::new(
            &hyper.post_processing,
            hyper.dimensions,
            reference.photon_scale(),
            reference.z_scale(),
        );

        let mut logger = MultiLogger::new().with(TracingLogger);
        if let Some(path) = &config.logger.scalars_file {
            logger = logger.with(JsonlLogger::create(path)?);
        }

        let data = build_data(config, hyper, reference)?;

        Ok(Self::new(
            config,
            TrainerParts {
                network: Box::new(network),
                optimizer: Box::new(Adam::new(hyper.lr)),
                loss: Box::new(WeightedMse),
                post_processor: Box::new(post_processor),
                logger: Box::new(logger),
                data,
            },
        ))
    }
}

fn build_data(
    config: &TrainConfig,
    hyper: &HyperParams,
    train_sim: GaussianSimulator,
) -> Result<DataRegime<GaussianSimulator>> {
    match config.io.data_mode {
        DataMode::Online => {
            let test_sim =
                GaussianSimulator::new(&config.simulation, hyper, hyper.seed.wrapping_add(1))?;
            let train_size = config.simulation.pseudo_data_size - hyper.test_size;
            Ok(DataRegime::Online {
                train: OnlineDataset::renewing(train_sim, train_size, hyper.data_lifetime),
                test: OnlineDataset::fixed(test_sim, hyper.test_size),
            })
        }
        DataMode::Precomputed => {
            let path = config.io.data_set.as_deref().ok_or_else(|| {
                emitfit_core::ConfigError::MissingField {
                    field: "io.data_set".into(),
                }
            })?;
            let (train, test) = PrecomputedDataset::load(path)?.split(hyper.test_size, hyper.seed)?;
            tracing::info!(train = train.len(), test = test.len(), "precomputed dataset split");
            Ok(DataRegime::Precomputed { train, test })
        }
    }
}
