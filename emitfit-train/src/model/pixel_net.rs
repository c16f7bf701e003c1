//! A per-pixel network: a shared 1x1 trunk followed by one linear head per
//! output channel.
//!
//! Every pixel of every sample is a column of a `(features, n*h*w)` matrix,
//! so forward and backward are two matrix products each. With
//! `bg_receptive_field = Some(r)` an extra input feature carries the mean
//! intensity of the enclosing `r x r` patch.

use emitfit_core::config::{ArchParams, HyperParams};
use emitfit_core::{Activation, DataError, Result, TrainingError};
use ndarray::{Array1, Array2, Array4, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Mode, Network, ParamMut, StateDict, TensorRecord, restore_parameter};

const TRUNK_WEIGHT: &str = "trunk.weight";
const TRUNK_BIAS: &str = "trunk.bias";
const HEADS_WEIGHT: &str = "heads.weight";
const HEADS_BIAS: &str = "heads.bias";

#[derive(Debug, Clone)]
struct ForwardCache {
    x: Array2<f32>,
    z: Array2<f32>,
    h: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct PixelNet {
    in_channels: usize,
    heads: usize,
    activation: Activation,
    bg_receptive_field: Option<usize>,
    mode: Mode,
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
    gw1: Array2<f32>,
    gb1: Array1<f32>,
    gw2: Array2<f32>,
    gb2: Array1<f32>,
    cache: Option<ForwardCache>,
}

impl PixelNet {
    pub fn new(in_channels: usize, heads: usize, arch: &ArchParams, seed: u64) -> Result<Self> {
        let hidden = arch.hidden_features;
        if in_channels == 0 || heads == 0 || hidden == 0 {
            return Err(TrainingError::Network {
                message: format!(
                    "channels ({in_channels}), heads ({heads}) and hidden features ({hidden}) must be positive"
                ),
            }
            .into());
        }
        if arch.bg_receptive_field == Some(0) {
            return Err(TrainingError::Network {
                message: "bg_receptive_field must be positive".into(),
            }
            .into());
        }

        let features = in_channels + usize::from(arch.bg_receptive_field.is_some());
        let mut rng = StdRng::seed_from_u64(seed);
        let w1 = xavier(&mut rng, hidden, features, arch.init_scale);
        let w2 = xavier(&mut rng, heads, hidden, arch.init_scale);

        Ok(Self {
            in_channels,
            heads,
            activation: arch.activation,
            bg_receptive_field: arch.bg_receptive_field,
            mode: Mode::Train,
            gw1: Array2::zeros(w1.dim()),
            gb1: Array1::zeros(hidden),
            gw2: Array2::zeros(w2.dim()),
            gb2: Array1::zeros(heads),
            w1,
            b1: Array1::zeros(hidden),
            w2,
            b2: Array1::zeros(heads),
            cache: None,
        })
    }

    pub fn from_config(hyper: &HyperParams) -> Result<Self> {
        Self::new(hyper.channels, hyper.heads, &hyper.arch, hyper.seed)
    }

    pub fn hidden_features(&self) -> usize {
        self.b1.len()
    }

    fn feature_count(&self) -> usize {
        self.w1.ncols()
    }

    fn features(&self, input: &Array4<f32>) -> Result<Array2<f32>> {
        let (n, c, h, w) = input.dim();
        if c != self.in_channels {
            return Err(DataError::ShapeMismatch {
                what: "network input channels".into(),
                expected: vec![self.in_channels],
                actual: vec![c],
            }
            .into());
        }

        let mut stacked = Array4::<f32>::zeros((self.feature_count(), n, h, w));
        stacked
            .slice_mut(s![..c, .., .., ..])
            .assign(&input.view().permuted_axes([1, 0, 2, 3]));

        if let Some(r) = self.bg_receptive_field {
            for (dimension, size) in [("frame height", h), ("frame width", w)] {
                if size % r != 0 {
                    return Err(DataError::NotDivisible {
                        dimension: dimension.into(),
                        size,
                        divisor: r,
                    }
                    .into());
                }
            }
            for sample in 0..n {
                for row in (0..h).step_by(r) {
                    for col in (0..w).step_by(r) {
                        let mean = input
                            .slice(s![sample, .., row..row + r, col..col + r])
                            .mean()
                            .unwrap_or(0.0);
                        stacked
                            .slice_mut(s![c, sample, row..row + r, col..col + r])
                            .fill(mean);
                    }
                }
            }
        }

        let features = self.feature_count();
        stacked
            .into_shape_with_order((features, n * h * w))
            .map_err(|e| network_error(format!("feature matrix: {e}")))
    }

    fn trunk(&self, x: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
        let z = self.w1.dot(x) + &self.b1.view().insert_axis(Axis(1));
        let activation = self.activation;
        let h = z.mapv(|v| activation.apply(v));
        (z, h)
    }

    fn head_outputs(&self, h: &Array2<f32>) -> Array2<f32> {
        self.w2.dot(h) + &self.b2.view().insert_axis(Axis(1))
    }

    /// `(heads, n*h*w)` columns back to `(n, heads, h, w)`.
    fn to_output(&self, y: Array2<f32>, (n, h, w): (usize, usize, usize)) -> Result<Array4<f32>> {
        let y = y
            .into_shape_with_order((self.heads, n, h, w))
            .map_err(|e| network_error(format!("output reshape: {e}")))?;
        Ok(y.permuted_axes([1, 0, 2, 3]).as_standard_layout().into_owned())
    }

    /// `(n, heads, h, w)` gradient to `(heads, n*h*w)` columns.
    fn to_columns(&self, grad: &Array4<f32>, columns: usize) -> Result<Array2<f32>> {
        let (n, k, h, w) = grad.dim();
        if k != self.heads {
            return Err(TrainingError::HeadCountMismatch {
                expected: self.heads,
                actual: k,
            }
            .into());
        }
        if n * h * w != columns {
            return Err(DataError::ShapeMismatch {
                what: "output gradient".into(),
                expected: vec![columns],
                actual: vec![n * h * w],
            }
            .into());
        }
        grad.view()
            .permuted_axes([1, 0, 2, 3])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((k, columns))
            .map_err(|e| network_error(format!("gradient reshape: {e}")))
    }
}

impl Network for PixelNet {
    fn head_count(&self) -> usize {
        self.heads
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, _, h, w) = input.dim();
        let x = self.features(input)?;
        let (z, hidden) = self.trunk(&x);
        let y = self.head_outputs(&hidden);
        self.cache = Some(ForwardCache { x, z, h: hidden });
        self.to_output(y, (n, h, w))
    }

    fn infer(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, _, h, w) = input.dim();
        let x = self.features(input)?;
        let (_, hidden) = self.trunk(&x);
        self.to_output(self.head_outputs(&hidden), (n, h, w))
    }

    fn probe_head_gradient(&self, head: usize, grad_output: &Array4<f32>) -> Result<f64> {
        if head >= self.heads {
            return Err(TrainingError::HeadOutOfRange {
                head,
                heads: self.heads,
            }
            .into());
        }
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| TrainingError::MissingForward {
                operation: "gradient probe".into(),
            })?;
        let g = self.to_columns(grad_output, cache.x.ncols())?;
        let g_head = g.row(head);
        let w_head = self.w2.row(head);
        let activation = self.activation;

        let dz = Array2::from_shape_fn(cache.z.dim(), |(f, m)| {
            w_head[f] * g_head[m] * activation.derivative(cache.z[[f, m]])
        });
        let gw1 = dz.dot(&cache.x.t());
        let gb1 = dz.sum_axis(Axis(1));
        let squared: f64 = gw1
            .iter()
            .chain(gb1.iter())
            .map(|v| f64::from(*v).powi(2))
            .sum();
        Ok(squared.sqrt())
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<()> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| TrainingError::MissingForward {
                operation: "backward".into(),
            })?;
        let g = self.to_columns(grad_output, cache.x.ncols())?;
        let activation = self.activation;

        let gw2 = g.dot(&cache.h.t());
        let gb2 = g.sum_axis(Axis(1));
        let dz = self.w2.t().dot(&g) * &cache.z.mapv(|v| activation.derivative(v));
        let gw1 = dz.dot(&cache.x.t());
        let gb1 = dz.sum_axis(Axis(1));

        self.gw1 += &gw1;
        self.gb1 += &gb1;
        self.gw2 += &gw2;
        self.gb2 += &gb2;
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.gw1.fill(0.0);
        self.gb1.fill(0.0);
        self.gw2.fill(0.0);
        self.gb2.fill(0.0);
    }

    fn parameters(&mut self) -> Vec<ParamMut<'_>> {
        vec![
            ParamMut {
                name: TRUNK_WEIGHT,
                value: self.w1.view_mut().into_dyn(),
                grad: self.gw1.view().into_dyn(),
            },
            ParamMut {
                name: TRUNK_BIAS,
                value: self.b1.view_mut().into_dyn(),
                grad: self.gb1.view().into_dyn(),
            },
            ParamMut {
                name: HEADS_WEIGHT,
                value: self.w2.view_mut().into_dyn(),
                grad: self.gw2.view().into_dyn(),
            },
            ParamMut {
                name: HEADS_BIAS,
                value: self.b2.view_mut().into_dyn(),
                grad: self.gb2.view().into_dyn(),
            },
        ]
    }

    fn state_dict(&self) -> StateDict {
        [
            (TRUNK_WEIGHT, self.w1.view().into_dyn()),
            (TRUNK_BIAS, self.b1.view().into_dyn()),
            (HEADS_WEIGHT, self.w2.view().into_dyn()),
            (HEADS_BIAS, self.b2.view().into_dyn()),
        ]
        .into_iter()
        .map(|(name, view)| (name.to_string(), TensorRecord::from_view(view)))
        .collect()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        restore_parameter(state, TRUNK_WEIGHT, &mut self.w1.view_mut().into_dyn())?;
        restore_parameter(state, TRUNK_BIAS, &mut self.b1.view_mut().into_dyn())?;
        restore_parameter(state, HEADS_WEIGHT, &mut self.w2.view_mut().into_dyn())?;
        restore_parameter(state, HEADS_BIAS, &mut self.b2.view_mut().into_dyn())?;
        self.zero_grad();
        self.cache = None;
        Ok(())
    }

    fn describe(&self, sample_input: &Array4<f32>) -> Result<String> {
        let x = self.features(sample_input)?;
        let mut out = format!(
            "PixelNet(in={}, features={}, hidden={}, heads={}, activation={})\n",
            self.in_channels,
            x.nrows(),
            self.hidden_features(),
            self.heads,
            self.activation
        );
        if let Some(r) = self.bg_receptive_field {
            out.push_str(&format!("  context: mean over {r}x{r} patches\n"));
        }
        for (name, record) in self.state_dict() {
            out.push_str(&format!("  {name}: {:?}\n", record.shape));
        }
        Ok(out)
    }
}

fn xavier(rng: &mut StdRng, fan_out: usize, fan_in: usize, scale: f32) -> Array2<f32> {
    let bound = scale * (6.0 / (fan_in + fan_out) as f32).sqrt();
    if bound > 0.0 {
        Array2::from_shape_fn((fan_out, fan_in), |_| rng.gen_range(-bound..bound))
    } else {
        Array2::zeros((fan_out, fan_in))
    }
}

fn network_error(message: String) -> emitfit_core::EmitfitError {
    TrainingError::Network { message }.into()
}
