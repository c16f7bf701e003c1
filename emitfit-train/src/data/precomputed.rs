//! Fixed datasets held in memory and stored as JSON.

use std::path::Path;

use chrono::{DateTime, Utc};
use emitfit_core::{DataError, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::{Sample, SampleSource};
use crate::persistence;
use crate::simulation::Simulator;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DatasetFile {
    created_at: DateTime<Utc>,
    samples: Vec<Sample>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrecomputedDataset {
    samples: Vec<Sample>,
}

impl PrecomputedDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Draws `len` samples from `simulator`.
    pub fn generate<S: Simulator + ?Sized>(simulator: &mut S, len: usize) -> Result<Self> {
        let samples = (0..len)
            .map(|_| simulator.simulate())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = DatasetFile {
            created_at: Utc::now(),
            samples: self.samples.clone(),
        };
        persistence::atomic_write_json(path, &file)?;
        tracing::info!(path = %path.display(), samples = self.samples.len(), "dataset saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let Some(file) = persistence::load_json::<DatasetFile>(path)? else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("dataset file {} not found", path.display()),
            )
            .into());
        };
        tracing::info!(
            path = %path.display(),
            samples = file.samples.len(),
            created_at = %file.created_at,
            "dataset loaded"
        );
        Ok(Self {
            samples: file.samples,
        })
    }

    /// Randomly splits off `test_size` samples for validation. Both parts
    /// must be non-empty.
    pub fn split(self, test_size: usize, seed: u64) -> Result<(Self, Self)> {
        let len = self.samples.len();
        if test_size == 0 || test_size >= len {
            return Err(DataError::IndexOutOfRange {
                index: test_size,
                len,
            }
            .into());
        }
        let mut samples = self.samples;
        samples.shuffle(&mut StdRng::seed_from_u64(seed));
        let test = samples.split_off(len - test_size);
        Ok((Self { samples }, Self { samples: test }))
    }
}

impl SampleSource for PrecomputedDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn fetch(&mut self, index: usize) -> Result<Sample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            DataError::IndexOutOfRange {
                index,
                len: self.samples.len(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::test_support::sample;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn dataset(len: usize) -> PrecomputedDataset {
        PrecomputedDataset::new((0..len).map(|i| sample(1, 5, 2, i % 4)).collect())
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("set.json");
        let ds = dataset(3);
        ds.save(&path).unwrap();
        assert_eq!(PrecomputedDataset::load(&path).unwrap(), ds);
    }

    #[test]
    fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        assert!(PrecomputedDataset::load(&dir.path().join("none.json")).is_err());
    }

    #[test]
    fn test_split_sizes() {
        let (train, test) = dataset(10).split(3, 1).unwrap();
        assert_eq!(train.len(), 7);
        assert_eq!(test.len(), 3);
        assert!(dataset(3).split(3, 1).is_err());
        assert!(dataset(3).split(0, 1).is_err());
    }

    #[test]
    fn test_fetch_out_of_range() {
        let mut ds = dataset(2);
        assert!(ds.fetch(1).is_ok());
        assert!(ds.fetch(2).is_err());
    }
}
