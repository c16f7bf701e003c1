//! Network, loss and optimizer seams plus their reference implementations.

pub mod loss;
pub mod optim;
pub mod pixel_net;

use std::collections::BTreeMap;

use emitfit_core::{CheckpointError, DataError, Result};
use ndarray::{Array4, ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};
use serde::{Deserialize, Serialize};

pub use loss::{Loss, LossOutput, WeightedMse};
pub use optim::{Adam, Optimizer};
pub use pixel_net::PixelNet;

/// Whether the network is being trained or evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

/// Flat, serialisable copy of one parameter tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorRecord {
    pub fn from_view(view: ArrayViewD<'_, f32>) -> Self {
        Self {
            shape: view.shape().to_vec(),
            data: view.iter().copied().collect(),
        }
    }

    pub fn to_array(&self, name: &str) -> Result<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone()).map_err(|_| {
            DataError::ShapeMismatch {
                what: format!("parameter '{name}'"),
                expected: self.shape.clone(),
                actual: vec![self.data.len()],
            }
            .into()
        })
    }
}

/// Parameters by name.
pub type StateDict = BTreeMap<String, TensorRecord>;

/// A parameter together with its accumulated gradient, handed to optimizers.
pub struct ParamMut<'a> {
    pub name: &'static str,
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewD<'a, f32>,
}

/// A multi-head dense regression network.
///
/// Inputs are `(n, channels, height, width)` and outputs
/// `(n, heads, height, width)`. `forward` caches what `backward` and
/// `probe_head_gradient` need; `infer` caches nothing and is the only entry
/// point evaluation uses.
pub trait Network: Send {
    fn head_count(&self) -> usize;

    fn mode(&self) -> Mode;

    fn set_mode(&mut self, mode: Mode);

    fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;

    fn infer(&self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// L2 norm of the gradient that `grad_output` restricted to `head` would
    /// deposit in the last shared layer. Leaves accumulated gradients alone.
    fn probe_head_gradient(&self, head: usize, grad_output: &Array4<f32>) -> Result<f64>;

    /// Accumulates parameter gradients for `grad_output` (d loss / d output).
    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<()>;

    fn zero_grad(&mut self);

    fn parameters(&mut self) -> Vec<ParamMut<'_>>;

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;

    /// Human-readable structure for the experiment logger.
    fn describe(&self, sample_input: &Array4<f32>) -> Result<String>;
}

/// Copies `name` from `state` into `target`, checking presence and shape.
pub(crate) fn restore_parameter(
    state: &StateDict,
    name: &str,
    target: &mut ArrayViewMutD<'_, f32>,
) -> Result<()> {
    let record = state
        .get(name)
        .ok_or_else(|| CheckpointError::MissingParameter {
            name: name.to_string(),
        })?;
    if record.shape != target.shape() {
        return Err(CheckpointError::ParameterShape {
            name: name.to_string(),
            expected: target.shape().to_vec(),
            actual: record.shape.clone(),
        }
        .into());
    }
    target.assign(&record.to_array(name)?);
    Ok(())
}
