//! Frame simulation.
//!
//! [`Simulator`] is the seam the online dataset draws fresh samples from.
//! [`GaussianSimulator`] renders Poisson-distributed emitter counts as
//! Gaussian spots whose width grows with |z|, adds a uniform background and
//! shot noise, and produces the dense target and weight maps the loss
//! consumes.

use emitfit_core::config::{HyperParams, SimulationParams};
use emitfit_core::{DataError, DetectionRecord, DetectionSet, Extent, Result};
use ndarray::{Array2, Array3, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};

use crate::data::Sample;

/// Target channel layout.
pub mod channel {
    pub const PROB: usize = 0;
    pub const PHOTONS: usize = 1;
    pub const DX: usize = 2;
    pub const DY: usize = 3;
    pub const Z: usize = 4;
    pub const BACKGROUND: usize = 5;
}

/// Produces training samples and exposes the difficulty knob the curriculum
/// scheduler turns.
pub trait Simulator: Send {
    fn simulate(&mut self) -> Result<Sample>;

    fn difficulty(&self) -> f64;

    fn set_difficulty(&mut self, value: f64);
}

#[derive(Debug, Clone)]
pub struct GaussianSimulator {
    params: SimulationParams,
    channels: usize,
    heads: usize,
    dim: u8,
    min_photons: f32,
    emitter_av: f64,
    rng: StdRng,
}

impl GaussianSimulator {
    pub fn new(params: &SimulationParams, hyper: &HyperParams, seed: u64) -> Result<Self> {
        for (axis, (lo, hi)) in params.emitter_extent.iter().enumerate() {
            if lo.is_nan() || hi.is_nan() || lo >= hi {
                return Err(DataError::Simulation {
                    message: format!("emitter extent of axis {axis} is empty: ({lo}, {hi})"),
                }
                .into());
            }
        }
        if params.psf_sigma.is_nan()
            || params.psf_z_depth.is_nan()
            || params.psf_sigma <= 0.0
            || params.psf_z_depth <= 0.0
        {
            return Err(DataError::Simulation {
                message: "psf_sigma and psf_z_depth must be positive".into(),
            }
            .into());
        }
        Ok(Self {
            params: params.clone(),
            channels: hyper.channels,
            heads: hyper.heads,
            dim: hyper.dimensions,
            min_photons: hyper.min_photons,
            emitter_av: params.initial_emitter_av(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn extent(&self) -> Extent {
        self.params.emitter_extent
    }

    /// Scale applied to raw photon counts before they reach the network.
    pub fn intensity_scale(&self) -> f32 {
        let peak = self.params.photon_range.1
            / (2.0 * std::f32::consts::PI * self.params.psf_sigma * self.params.psf_sigma);
        peak.max(1.0)
    }

    /// Largest |z| in the extent, used to normalise the z target.
    pub fn z_scale(&self) -> f32 {
        let (lo, hi) = self.params.emitter_extent[2];
        lo.abs().max(hi.abs()).max(f32::EPSILON)
    }

    pub fn photon_scale(&self) -> f32 {
        self.params.photon_range.1.max(1.0)
    }

    fn draw_emitters(&mut self) -> Result<Vec<DetectionRecord>> {
        let count = if self.emitter_av > 0.0 {
            let poisson = Poisson::new(self.emitter_av).map_err(|e| DataError::Simulation {
                message: format!("invalid emitter average {}: {e}", self.emitter_av),
            })?;
            poisson.sample(&mut self.rng) as usize
        } else {
            0
        };

        let [(x0, x1), (y0, y1), (z0, z1)] = self.params.emitter_extent;
        let (p0, p1) = self.params.photon_range;
        let mut emitters = Vec::with_capacity(count);
        for _ in 0..count {
            let x = self.rng.gen_range(x0..x1);
            let y = self.rng.gen_range(y0..y1);
            let z = if self.dim == 3 {
                self.rng.gen_range(z0..z1)
            } else {
                0.0
            };
            let photons = if p0 < p1 {
                self.rng.gen_range(p0..p1)
            } else {
                p0
            };
            emitters.push(DetectionRecord::new(0, [x, y, z], photons, 1.0));
        }
        Ok(emitters)
    }

    /// Expected photon counts of `emitters` on the pixel grid.
    fn render(&self, emitters: &[DetectionRecord]) -> Array2<f32> {
        let (height, width) = self.params.img_size;
        let mut frame = Array2::from_elem((height, width), self.params.bg_photons);
        for emitter in emitters {
            let [x, y, z] = emitter.xyz;
            let zr = z / self.params.psf_z_depth;
            let sigma = self.params.psf_sigma * (1.0 + zr * zr).sqrt();
            let norm = emitter.photons / (2.0 * std::f32::consts::PI * sigma * sigma);
            let reach = (4.0 * sigma).ceil() as isize;
            let (cx, cy) = (x.round() as isize, y.round() as isize);

            let rows = (cy - reach).max(0)..(cy + reach + 1).min(height as isize);
            for row in rows {
                let cols = (cx - reach).max(0)..(cx + reach + 1).min(width as isize);
                for col in cols {
                    let dx = col as f32 - x;
                    let dy = row as f32 - y;
                    frame[[row as usize, col as usize]] +=
                        norm * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                }
            }
        }
        frame
    }

    fn add_shot_noise(&mut self, frame: &mut Array2<f32>) {
        for value in frame.iter_mut() {
            *value = match Poisson::new(f64::from(*value)) {
                Ok(poisson) => poisson.sample(&mut self.rng) as f32,
                Err(_) => 0.0,
            };
        }
    }

    fn targets(&self, emitters: &[DetectionRecord]) -> (Array3<f32>, Array3<f32>) {
        let (height, width) = self.params.img_size;
        let mut target = Array3::<f32>::zeros((self.heads, height, width));
        let mut weight = Array3::<f32>::zeros((self.heads, height, width));
        weight.slice_mut(s![channel::PROB, .., ..]).fill(1.0);

        if self.heads > channel::BACKGROUND {
            target
                .slice_mut(s![channel::BACKGROUND, .., ..])
                .fill(self.params.bg_photons / self.intensity_scale());
            weight.slice_mut(s![channel::BACKGROUND, .., ..]).fill(1.0);
        }

        for emitter in emitters {
            let [x, y, z] = emitter.xyz;
            let (col, row) = (x.round(), y.round());
            if col < 0.0 || row < 0.0 || col >= width as f32 || row >= height as f32 {
                continue;
            }
            let (c, r) = (col as usize, row as usize);
            target[[channel::PROB, r, c]] = 1.0;
            target[[channel::PHOTONS, r, c]] = emitter.photons / self.photon_scale();
            target[[channel::DX, r, c]] = x - col;
            target[[channel::DY, r, c]] = y - row;
            target[[channel::Z, r, c]] = z / self.z_scale();
            for head in channel::PHOTONS..=channel::Z {
                weight[[head, r, c]] = 1.0;
            }
        }
        (target, weight)
    }
}

impl Simulator for GaussianSimulator {
    fn simulate(&mut self) -> Result<Sample> {
        let (height, width) = self.params.img_size;
        let mut input = Array3::<f32>::zeros((self.channels, height, width));
        let center = self.channels / 2;
        let scale = self.intensity_scale();
        let mut center_emitters = Vec::new();

        for ch in 0..self.channels {
            let emitters = self.draw_emitters()?;
            let mut frame = self.render(&emitters);
            self.add_shot_noise(&mut frame);
            input
                .slice_mut(s![ch, .., ..])
                .assign(&frame.mapv(|v| v / scale));
            if ch == center {
                center_emitters = emitters;
            }
        }

        let visible: Vec<DetectionRecord> = center_emitters
            .into_iter()
            .filter(|e| e.photons >= self.min_photons)
            .collect();
        let (target, weight) = self.targets(&visible);
        let ground_truth = DetectionSet::new(visible, self.dim).with_extent(self.extent());
        Sample::new(input, target, weight, ground_truth)
    }

    fn difficulty(&self) -> f64 {
        self.emitter_av
    }

    fn set_difficulty(&mut self, value: f64) {
        self.emitter_av = value.max(0.0);
    }
}
