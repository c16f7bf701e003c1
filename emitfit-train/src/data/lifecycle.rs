//! Lifetime bookkeeping for samples that are simulated on the fly.
//!
//! Each managed counter starts at the configured lifetime (in epochs) and is
//! decremented once per [`DatasetLifecycleManager::step`]. When it reaches
//! zero it is reset, its regeneration flag is raised, and its generation
//! stamp advances. Data sources compare their cached stamp against
//! [`DatasetLifecycleManager::generation`] at fetch time, so the manager
//! remains the only writer of the state.

use serde::{Deserialize, Serialize};

/// How long a sample may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifetime {
    /// Never regenerated by `step`; used for validation sets.
    Static,
    /// Regenerated every `n` epochs.
    Epochs(u32),
}

/// Whether every sample carries its own counter or the whole set shares one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    PerSample(usize),
    Global,
}

/// Counters, flags and generation stamps. Only the manager mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetState {
    remaining: Vec<u32>,
    expired: Vec<bool>,
    generation: Vec<u64>,
}

impl DatasetState {
    pub fn remaining(&self) -> &[u32] {
        &self.remaining
    }
}

#[derive(Debug, Clone)]
pub struct DatasetLifecycleManager {
    lifetime: Lifetime,
    granularity: Granularity,
    state: DatasetState,
}

impl DatasetLifecycleManager {
    pub fn new(lifetime: Lifetime, granularity: Granularity) -> Self {
        let counters = match granularity {
            Granularity::PerSample(n) => n,
            Granularity::Global => 1,
        };
        let initial = match lifetime {
            Lifetime::Static => 0,
            Lifetime::Epochs(n) => n,
        };
        Self {
            lifetime,
            granularity,
            state: DatasetState {
                remaining: vec![initial; counters],
                expired: vec![false; counters],
                generation: vec![0; counters],
            },
        }
    }

    /// Per-sample counters that expire every `lifetime` epochs.
    pub fn per_sample(samples: usize, lifetime: u32) -> Self {
        Self::new(Lifetime::Epochs(lifetime), Granularity::PerSample(samples))
    }

    /// A fixed set that is never regenerated by `step`.
    pub fn fixed(samples: usize) -> Self {
        Self::new(Lifetime::Static, Granularity::PerSample(samples))
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn is_static(&self) -> bool {
        self.lifetime == Lifetime::Static
    }

    pub fn state(&self) -> &DatasetState {
        &self.state
    }

    /// Advances one epoch.
    pub fn step(&mut self) {
        self.state.expired.iter_mut().for_each(|e| *e = false);

        let Lifetime::Epochs(lifetime) = self.lifetime else {
            return;
        };

        let mut renewed = 0usize;
        for i in 0..self.state.remaining.len() {
            let counter = &mut self.state.remaining[i];
            *counter = counter.saturating_sub(1);
            if *counter == 0 {
                *counter = lifetime;
                self.state.expired[i] = true;
                self.state.generation[i] += 1;
                renewed += 1;
            }
        }
        if renewed > 0 {
            tracing::debug!(renewed, "sample lifetimes expired");
        }
    }

    /// Expires every counter at once so that a new simulation setting takes
    /// effect on the next fetch. Applies to static sets as well.
    pub fn force_expire(&mut self) {
        let reset = match self.lifetime {
            Lifetime::Static => 0,
            Lifetime::Epochs(n) => n,
        };
        for i in 0..self.state.remaining.len() {
            self.state.remaining[i] = reset;
            self.state.expired[i] = true;
            self.state.generation[i] += 1;
        }
        tracing::debug!(
            counters = self.state.remaining.len(),
            "all sample lifetimes force-expired"
        );
    }

    /// Whether the counter owning `sample` expired at the most recent
    /// `step` or `force_expire`.
    pub fn is_expired(&self, sample: usize) -> bool {
        self.state.expired[self.slot(sample)]
    }

    /// Generation stamp of `sample`; changes each time its counter expires.
    pub fn generation(&self, sample: usize) -> u64 {
        self.state.generation[self.slot(sample)]
    }

    fn slot(&self, sample: usize) -> usize {
        match self.granularity {
            Granularity::PerSample(_) => sample,
            Granularity::Global => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_raised_exactly_at_lifetime() {
        let lifetime = 4;
        let mut manager = DatasetLifecycleManager::per_sample(3, lifetime);
        for epoch in 1..lifetime {
            manager.step();
            assert!(!manager.is_expired(0), "epoch {epoch}");
        }
        manager.step();
        assert!(manager.is_expired(0));
        assert_eq!(manager.state().remaining(), &[lifetime; 3]);
        assert_eq!(manager.generation(2), 1);

        manager.step();
        assert!(!manager.is_expired(0));
    }

    #[test]
    fn test_lifetime_of_one_expires_every_epoch() {
        let mut manager = DatasetLifecycleManager::per_sample(2, 1);
        for epoch in 1..=5u64 {
            manager.step();
            assert!(manager.is_expired(1));
            assert_eq!(manager.generation(1), epoch);
        }
    }

    #[test]
    fn test_static_never_expires() {
        let mut manager = DatasetLifecycleManager::fixed(4);
        for _ in 0..100 {
            manager.step();
            assert!((0..4).all(|i| !manager.is_expired(i)));
        }
        assert_eq!(manager.generation(3), 0);
    }

    #[test]
    fn test_force_expire_resets_all_counters() {
        let mut manager = DatasetLifecycleManager::per_sample(3, 10);
        manager.step();
        manager.step();
        manager.force_expire();
        assert!((0..3).all(|i| manager.is_expired(i)));
        assert_eq!(manager.state().remaining(), &[10, 10, 10]);
        assert_eq!(manager.generation(0), 1);
    }

    #[test]
    fn test_force_expire_reaches_static_sets() {
        let mut manager = DatasetLifecycleManager::fixed(2);
        manager.force_expire();
        assert!(manager.is_expired(1));
        assert_eq!(manager.generation(1), 1);
        manager.step();
        assert!(!manager.is_expired(1));
        assert_eq!(manager.generation(1), 1);
    }

    #[test]
    fn test_global_counter_is_shared() {
        let mut manager = DatasetLifecycleManager::new(Lifetime::Epochs(2), Granularity::Global);
        manager.step();
        manager.step();
        assert!(manager.is_expired(0));
        assert!(manager.is_expired(999));
        assert_eq!(manager.generation(17), 1);
    }
}
