//! Datasets simulated on the fly.

use emitfit_core::{DataError, Result};

use super::lifecycle::DatasetLifecycleManager;
use super::{Sample, SampleSource};
use crate::simulation::Simulator;

/// A dataset of `len` simulated samples, each cached until its lifetime
/// counter expires.
///
/// The cache stores the generation stamp a sample was simulated under; a
/// fetch re-simulates whenever the lifecycle manager reports a newer stamp.
pub struct OnlineDataset<S> {
    simulator: S,
    lifecycle: DatasetLifecycleManager,
    cache: Vec<Option<(u64, Sample)>>,
}

impl<S: Simulator> OnlineDataset<S> {
    pub fn new(simulator: S, len: usize, lifecycle: DatasetLifecycleManager) -> Self {
        Self {
            simulator,
            lifecycle,
            cache: vec![None; len],
        }
    }

    /// Training set whose samples are renewed every `lifetime` epochs.
    pub fn renewing(simulator: S, len: usize, lifetime: u32) -> Self {
        Self::new(
            simulator,
            len,
            DatasetLifecycleManager::per_sample(len, lifetime),
        )
    }

    /// Validation set that is only renewed by a forced expiry.
    pub fn fixed(simulator: S, len: usize) -> Self {
        Self::new(simulator, len, DatasetLifecycleManager::fixed(len))
    }

    pub fn lifecycle(&self) -> &DatasetLifecycleManager {
        &self.lifecycle
    }

    /// Whether `index` will be simulated afresh on its next fetch.
    pub fn needs_regeneration(&self, index: usize) -> bool {
        match self.cache.get(index) {
            Some(Some((stamp, _))) => *stamp != self.lifecycle.generation(index),
            _ => true,
        }
    }

    /// Advances the lifetime counters by one epoch.
    pub fn step(&mut self) {
        self.lifecycle.step();
    }

    /// Invalidates every cached sample.
    pub fn force_regeneration(&mut self) {
        self.lifecycle.force_expire();
    }

    pub fn difficulty(&self) -> f64 {
        self.simulator.difficulty()
    }

    pub fn set_difficulty(&mut self, value: f64) {
        self.simulator.set_difficulty(value);
    }

    pub fn simulator(&self) -> &S {
        &self.simulator
    }
}

impl<S: Simulator> SampleSource for OnlineDataset<S> {
    fn len(&self) -> usize {
        self.cache.len()
    }

    fn fetch(&mut self, index: usize) -> Result<Sample> {
        let len = self.cache.len();
        if index >= len {
            return Err(DataError::IndexOutOfRange { index, len }.into());
        }
        let generation = self.lifecycle.generation(index);
        if let Some((stamp, sample)) = &self.cache[index] {
            if *stamp == generation {
                return Ok(sample.clone());
            }
        }
        let sample = self.simulator.simulate()?;
        self.cache[index] = Some((generation, sample.clone()));
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::test_support::sample;

    /// Encodes a running counter and the difficulty in the input so that
    /// fresh simulations are distinguishable.
    struct Counter {
        calls: usize,
        difficulty: f64,
    }

    impl Simulator for Counter {
        fn simulate(&mut self) -> Result<Sample> {
            self.calls += 1;
            let mut s = sample(1, 5, 2, 0);
            s.input.fill(self.calls as f32 + self.difficulty as f32 * 1000.0);
            Ok(s)
        }

        fn difficulty(&self) -> f64 {
            self.difficulty
        }

        fn set_difficulty(&mut self, value: f64) {
            self.difficulty = value;
        }
    }

    fn counter() -> Counter {
        Counter {
            calls: 0,
            difficulty: 0.0,
        }
    }

    #[test]
    fn test_samples_are_cached_within_lifetime() {
        let mut ds = OnlineDataset::renewing(counter(), 2, 3);
        let first = ds.fetch(0).unwrap();
        ds.step();
        assert_eq!(ds.fetch(0).unwrap(), first);
        assert_eq!(ds.simulator().calls, 1);
    }

    #[test]
    fn test_samples_regenerate_after_lifetime() {
        let mut ds = OnlineDataset::renewing(counter(), 1, 2);
        let first = ds.fetch(0).unwrap();
        ds.step();
        assert!(!ds.needs_regeneration(0));
        ds.step();
        assert!(ds.needs_regeneration(0));
        assert_ne!(ds.fetch(0).unwrap(), first);
        assert!(!ds.needs_regeneration(0));
    }

    #[test]
    fn test_force_regeneration_reaches_fixed_sets() {
        let mut ds = OnlineDataset::fixed(counter(), 3);
        for i in 0..3 {
            ds.fetch(i).unwrap();
        }
        for _ in 0..10 {
            ds.step();
        }
        assert!((0..3).all(|i| !ds.needs_regeneration(i)));

        ds.set_difficulty(2.0);
        ds.force_regeneration();
        assert!((0..3).all(|i| ds.needs_regeneration(i)));
        assert!(ds.fetch(1).unwrap().input[[0, 0, 0]] >= 2000.0);
    }

    #[test]
    fn test_out_of_range() {
        let mut ds = OnlineDataset::fixed(counter(), 1);
        assert!(ds.fetch(1).is_err());
    }
}
