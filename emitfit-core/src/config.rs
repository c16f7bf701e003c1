//! Configuration system for emitfit.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment (`EMITFIT_` prefix, `__` as the nesting separator) -> explicit
//! overrides. The result is split into five immutable parameter groups: I/O,
//! hyperparameters, simulation, logger and schedulers.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::activation::Activation;
use crate::emitter::Extent;
use crate::error::{ConfigError, DataError, Result};

/// Top-level configuration for a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub io: IoParams,
    pub hyper: HyperParams,
    pub simulation: SimulationParams,
    pub logger: LoggerParams,
    pub scheduler: SchedulerParams,
}

/// How training data is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
    /// A fixed dataset loaded from `io.data_set`.
    Precomputed,
    /// Samples simulated on the fly and regenerated after their lifetime.
    #[default]
    Online,
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataMode::Precomputed => write!(f, "precomputed"),
            DataMode::Online => write!(f, "online"),
        }
    }
}

impl FromStr for DataMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "precomputed" => Ok(DataMode::Precomputed),
            "online" => Ok(DataMode::Online),
            other => Err(ConfigError::UnknownVariant {
                field: "data_mode".into(),
                value: other.to_string(),
                expected: "precomputed, online".into(),
            }),
        }
    }
}

/// Compute device. Only the host CPU backend is built in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

/// Reference norm the per-head gradient norms are rescaled towards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceNorm {
    /// Largest observed head norm.
    #[default]
    Max,
    /// Mean of the observed head norms.
    Mean,
    /// A fixed target norm.
    Fixed(f64),
}

/// Comparison used to decide whether a metric improved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    /// `metric < best - threshold`
    #[default]
    Abs,
    /// `metric < best * (1 - threshold)`
    Rel,
}

/// Paths and data source selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoParams {
    pub data_mode: DataMode,
    /// Precomputed dataset file (required in `precomputed` mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_set: Option<PathBuf>,
    /// Where the model checkpoint is written.
    pub model_out: PathBuf,
    /// Optional checkpoint to warm-start from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_init: Option<PathBuf>,
    /// Seconds between checkpoint file rotations.
    pub checkpoint_rotate_secs: u64,
}

impl Default for IoParams {
    fn default() -> Self {
        Self {
            data_mode: DataMode::Online,
            data_set: None,
            model_out: PathBuf::from("network/model.json"),
            model_init: None,
            checkpoint_rotate_secs: 60 * 60,
        }
    }
}

/// Network architecture knobs for the built-in network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchParams {
    pub activation: Activation,
    pub hidden_features: usize,
    /// Patch size for the background context feature; frame dimensions must
    /// be divisible by it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bg_receptive_field: Option<usize>,
    pub init_scale: f32,
}

impl Default for ArchParams {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            hidden_features: 32,
            bg_receptive_field: None,
            init_scale: 1.0,
        }
    }
}

/// Post-processing and evaluation matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessParams {
    pub prob_threshold: f32,
    /// Only keep detections that are a 3x3 local maximum of the probability map.
    pub local_maximum: bool,
    /// Lateral matching radius in pixels.
    pub match_radius: f32,
}

impl Default for PostProcessParams {
    fn default() -> Self {
        Self {
            prob_threshold: 0.5,
            local_maximum: true,
            match_radius: 1.0,
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperParams {
    /// 2 or 3 spatial dimensions.
    pub dimensions: u8,
    /// Input channels: 1 (target frame) or 3 (one adjacent frame on each side).
    pub channels: usize,
    /// Output heads: 5 (p, photons, dx, dy, z) or 6 (+ background).
    pub heads: usize,
    pub batch_size: usize,
    pub test_size: usize,
    pub num_epochs: usize,
    pub lr: f64,
    pub device: Device,
    /// Epochs an online sample is reused before it is simulated again.
    pub data_lifetime: u32,
    /// Emitters below this photon count are dropped from the targets.
    pub min_photons: f32,
    pub grad_rescale: bool,
    pub rescale_reference: ReferenceNorm,
    pub rescale_epsilon: f64,
    pub seed: u64,
    pub arch: ArchParams,
    pub post_processing: PostProcessParams,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            dimensions: 3,
            channels: 3,
            heads: 5,
            batch_size: 32,
            test_size: 256,
            num_epochs: 100,
            lr: 1e-4,
            device: Device::Cpu,
            data_lifetime: 10,
            min_photons: 600.0,
            grad_rescale: false,
            rescale_reference: ReferenceNorm::Max,
            rescale_epsilon: 1e-8,
            seed: 42,
            arch: ArchParams::default(),
            post_processing: PostProcessParams::default(),
        }
    }
}

/// Parameters of the frame simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParams {
    /// Total number of samples (training + validation).
    pub pseudo_data_size: usize,
    /// Frame height and width in pixels.
    pub img_size: (usize, usize),
    pub emitter_extent: Extent,
    pub photon_range: (f32, f32),
    /// Average number of emitters per frame; the curriculum difficulty.
    pub emitter_av: f64,
    /// Emitters per pixel. When set it replaces `emitter_av` as the initial
    /// average, scaled by the frame area.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<f64>,
    /// Uniform background photons per pixel.
    pub bg_photons: f32,
    /// In-focus PSF standard deviation in pixels.
    pub psf_sigma: f32,
    /// Axial distance (nm) at which the PSF width has grown by sqrt(2).
    pub psf_z_depth: f32,
}

impl SimulationParams {
    /// Initial emitter average per frame, derived from `density` when set.
    pub fn initial_emitter_av(&self) -> f64 {
        match self.density {
            Some(density) => density * (self.img_size.0 * self.img_size.1) as f64,
            None => self.emitter_av,
        }
    }
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            pseudo_data_size: 256 * 32 + 256,
            img_size: (32, 32),
            emitter_extent: [(-0.5, 31.5), (-0.5, 31.5), (-500.0, 500.0)],
            photon_range: (4000.0, 8000.0),
            emitter_av: 15.0,
            density: None,
            bg_photons: 15.0,
            psf_sigma: 1.0,
            psf_z_depth: 500.0,
        }
    }
}

/// Experiment logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerParams {
    pub tags: Vec<String>,
    pub comment: String,
    /// JSON-lines file receiving scalars and validation summaries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scalars_file: Option<PathBuf>,
    /// Batches between per-batch scalar records.
    pub log_every: usize,
    pub progress: bool,
}

impl Default for LoggerParams {
    fn default() -> Self {
        Self {
            tags: vec!["3D".into(), "Coords".into()],
            comment: String::new(),
            scalars_file: None,
            log_every: 10,
            progress: true,
        }
    }
}

/// Plateau detection settings shared by both schedulers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauParams {
    pub patience: usize,
    pub threshold: f64,
    pub threshold_mode: ThresholdMode,
    pub cooldown: usize,
    pub verbose: bool,
    pub disabled: bool,
}

impl Default for PlateauParams {
    fn default() -> Self {
        Self {
            patience: 10,
            threshold: 0.0,
            threshold_mode: ThresholdMode::Abs,
            cooldown: 0,
            verbose: false,
            disabled: false,
        }
    }
}

/// Learning-rate reduction on plateau.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LrSchedulerParams {
    pub factor: f64,
    pub min_lr: f64,
    pub plateau: PlateauParams,
}

impl Default for LrSchedulerParams {
    fn default() -> Self {
        Self {
            factor: 0.1,
            min_lr: 0.0,
            plateau: PlateauParams {
                patience: 10,
                threshold: 0.0025,
                threshold_mode: ThresholdMode::Abs,
                cooldown: 10,
                verbose: true,
                disabled: false,
            },
        }
    }
}

/// Curriculum difficulty increase on plateau.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurriculumParams {
    pub step_size: f64,
    pub max_value: f64,
    pub plateau: PlateauParams,
}

impl Default for CurriculumParams {
    fn default() -> Self {
        Self {
            step_size: 1.0,
            max_value: 50.0,
            plateau: PlateauParams {
                patience: 1,
                threshold: 0.0,
                threshold_mode: ThresholdMode::Abs,
                cooldown: 10,
                verbose: true,
                disabled: true,
            },
        }
    }
}

/// Both plateau schedulers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerParams {
    pub lr: LrSchedulerParams,
    pub sim: CurriculumParams,
}

impl TrainConfig {
    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let hy = &self.hyper;
        let sim = &self.simulation;

        if !matches!(hy.dimensions, 2 | 3) {
            return Err(invalid(format!(
                "dimensions must be 2 or 3, got {}",
                hy.dimensions
            )));
        }
        if !matches!(hy.channels, 1 | 3) {
            return Err(invalid(format!(
                "channels must be 1 (target frame only) or 3 (one adjacent frame on each side), got {}",
                hy.channels
            )));
        }
        if !matches!(hy.heads, 5 | 6) {
            return Err(invalid(format!("heads must be 5 or 6, got {}", hy.heads)));
        }
        if hy.batch_size == 0 || hy.test_size == 0 {
            return Err(invalid("batch_size and test_size must be positive"));
        }
        if !(hy.lr.is_finite() && hy.lr > 0.0) {
            return Err(invalid(format!("lr must be positive, got {}", hy.lr)));
        }
        if hy.data_lifetime == 0 {
            return Err(invalid("data_lifetime must be at least one epoch"));
        }
        if hy.arch.hidden_features == 0 {
            return Err(invalid("arch.hidden_features must be positive"));
        }
        if !(hy.rescale_epsilon > 0.0) {
            return Err(invalid("rescale_epsilon must be positive"));
        }

        let (height, width) = sim.img_size;
        if height == 0 || width == 0 {
            return Err(invalid("img_size must be non-empty"));
        }
        if let Some(field) = hy.arch.bg_receptive_field {
            check_divisible("frame height", height, field)?;
            check_divisible("frame width", width, field)?;
        }
        let (lo, hi) = sim.photon_range;
        if !(lo >= 0.0 && lo <= hi) {
            return Err(invalid(format!(
                "photon_range must satisfy 0 <= low <= high, got ({lo}, {hi})"
            )));
        }
        if !(sim.emitter_av >= 0.0) {
            return Err(invalid("emitter_av must be non-negative"));
        }
        if let Some(density) = sim.density
            && !(density.is_finite() && density >= 0.0)
        {
            return Err(invalid(format!(
                "density must be finite and non-negative, got {density}"
            )));
        }

        let sched = &self.scheduler;
        if !(sched.lr.factor > 0.0 && sched.lr.factor < 1.0) {
            return Err(invalid(format!(
                "scheduler.lr.factor must be in (0, 1), got {}",
                sched.lr.factor
            )));
        }
        if sched.sim.max_value < 0.0 {
            return Err(invalid("scheduler.sim.max_value must be non-negative"));
        }

        match self.io.data_mode {
            DataMode::Precomputed if self.io.data_set.is_none() => {
                Err(ConfigError::MissingField {
                    field: "io.data_set".into(),
                }
                .into())
            }
            DataMode::Online if sim.pseudo_data_size <= hy.test_size => Err(invalid(format!(
                "pseudo_data_size ({}) must exceed test_size ({})",
                sim.pseudo_data_size, hy.test_size
            ))),
            _ => Ok(()),
        }
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

fn invalid(message: impl Into<String>) -> crate::error::EmitfitError {
    ConfigError::Invalid {
        message: message.into(),
    }
    .into()
}

fn check_divisible(dimension: &str, size: usize, divisor: usize) -> Result<()> {
    if divisor == 0 || size % divisor != 0 {
        return Err(DataError::NotDivisible {
            dimension: dimension.to_string(),
            size,
            divisor,
        }
        .into());
    }
    Ok(())
}

/// Dotted-key overrides applied on top of every other configuration source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    entries: Vec<(String, serde_json::Value)>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` (e.g. `"hyper.num_epochs"`) to `value`.
    pub fn set(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.entries.push((key.to_string(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (`EMITFIT_HYPER__BATCH_SIZE`, `EMITFIT_IO__DATA_MODE`, ...)
/// 3. The TOML file at `path`, if given
/// 4. Built-in defaults
///
/// Unknown enum values (such as a data mode other than `precomputed` or
/// `online`) fail here, before anything else runs.
pub fn load_config(
    path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> std::result::Result<TrainConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TrainConfig::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::Invalid {
                message: format!("configuration file not found: {}", path.display()),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("EMITFIT_").split("__"));

    for (key, value) in &overrides.entries {
        figment = figment.merge(Serialized::default(key, value));
    }

    let config: TrainConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    tracing::debug!(data_mode = %config.io.data_mode, "configuration loaded");
    Ok(config)
}
