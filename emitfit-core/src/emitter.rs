//! Emitter records and the frame-indexed record sets built from them.
//!
//! A [`DetectionSet`] holds a variable number of records per sample, which is
//! why batches and evaluation epochs merge them explicitly with
//! [`DetectionSet::concat`] instead of stacking them into a fixed-shape array.

use serde::{Deserialize, Serialize};

use crate::error::{DataError, Result};

/// Lower/upper bound per spatial axis.
pub type Extent = [(f32, f32); 3];

/// A single point source, either simulated ground truth or a network detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Frame the emitter is visible in.
    pub frame: usize,
    /// Coordinates in pixel units (x, y) and nm (z). `z` is ignored for 2D sets.
    pub xyz: [f32; 3],
    /// Photon count.
    pub photons: f32,
    /// Existence probability, 1.0 for ground truth.
    pub prob: f32,
}

impl DetectionRecord {
    pub fn new(frame: usize, xyz: [f32; 3], photons: f32, prob: f32) -> Self {
        Self {
            frame,
            xyz,
            photons,
            prob,
        }
    }

    /// Index of the originating sample after a merge with `frame_step`.
    pub fn source_sample(&self, frame_step: usize) -> usize {
        self.frame / frame_step.max(1)
    }
}

/// Where a set of records came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Number of samples merged into this set.
    pub samples: usize,
    /// Emitter extent of the originating simulation, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extent: Option<Extent>,
}

/// Ordered collection of [`DetectionRecord`]s with provenance metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    records: Vec<DetectionRecord>,
    dim: u8,
    provenance: Provenance,
}

impl DetectionSet {
    /// Creates a set covering a single sample.
    pub fn new(records: Vec<DetectionRecord>, dim: u8) -> Self {
        Self {
            records,
            dim,
            provenance: Provenance {
                samples: 1,
                extent: None,
            },
        }
    }

    /// An empty set standing in for `samples` samples without records.
    pub fn empty(dim: u8, samples: usize) -> Self {
        Self {
            records: Vec::new(),
            dim,
            provenance: Provenance {
                samples,
                extent: None,
            },
        }
    }

    pub fn with_extent(mut self, extent: Extent) -> Self {
        self.provenance.extent = Some(extent);
        self
    }

    /// Marks the set as covering `samples` frames, one per sample.
    pub fn with_samples(mut self, samples: usize) -> Self {
        self.provenance.samples = samples;
        self
    }

    pub fn records(&self) -> &[DetectionRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DetectionRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dim(&self) -> u8 {
        self.dim
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Frame indices in record order.
    pub fn frames(&self) -> Vec<usize> {
        self.records.iter().map(|r| r.frame).collect()
    }

    /// Records located on `frame`.
    pub fn on_frame(&self, frame: usize) -> impl Iterator<Item = &DetectionRecord> {
        self.records.iter().filter(move |r| r.frame == frame)
    }

    /// Highest frame index plus one, or 0 for an empty set.
    pub fn frame_span(&self) -> usize {
        self.records.iter().map(|r| r.frame + 1).max().unwrap_or(0)
    }

    /// Merges `sets` into one, offsetting the frames of the i-th set by
    /// `i * frame_step`.
    ///
    /// Records keep their relative order and sets are appended in input
    /// order, so `record.frame / frame_step` recovers the input position as
    /// long as every input only uses frames below `frame_step`.
    pub fn concat(sets: &[DetectionSet], frame_step: usize) -> Result<DetectionSet> {
        let Some(first) = sets.first() else {
            return Ok(DetectionSet::empty(2, 0));
        };

        let dim = first.dim;
        let total = sets.iter().map(DetectionSet::len).sum();
        let mut records = Vec::with_capacity(total);
        let mut samples = 0;
        let mut extent = first.provenance.extent;

        for (i, set) in sets.iter().enumerate() {
            if set.dim != dim {
                return Err(DataError::DimensionMismatch {
                    left: dim,
                    right: set.dim,
                }
                .into());
            }
            if set.provenance.extent != extent {
                extent = None;
            }
            let offset = i * frame_step;
            records.extend(set.records.iter().map(|r| DetectionRecord {
                frame: r.frame + offset,
                ..*r
            }));
            samples += set.provenance.samples;
        }

        Ok(DetectionSet {
            records,
            dim,
            provenance: Provenance { samples, extent },
        })
    }

    /// Returns a copy with every frame index shifted by `offset`.
    pub fn shifted(&self, offset: usize) -> DetectionSet {
        DetectionSet {
            records: self
                .records
                .iter()
                .map(|r| DetectionRecord {
                    frame: r.frame + offset,
                    ..*r
                })
                .collect(),
            dim: self.dim,
            provenance: self.provenance.clone(),
        }
    }

    /// Keeps records with at least `min_photons` photons.
    pub fn filter_photons(&self, min_photons: f32) -> DetectionSet {
        DetectionSet {
            records: self
                .records
                .iter()
                .filter(|r| r.photons >= min_photons)
                .copied()
                .collect(),
            dim: self.dim,
            provenance: self.provenance.clone(),
        }
    }
}

impl<'a> IntoIterator for &'a DetectionSet {
    type Item = &'a DetectionRecord;
    type IntoIter = std::slice::Iter<'a, DetectionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
