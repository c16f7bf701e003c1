//! Batching over a [`SampleSource`].

use emitfit_core::Result;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::{Batch, Sample, SampleSource};

/// Splits a source into batches, optionally reshuffling every epoch.
#[derive(Debug, Clone)]
pub struct DataLoader {
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per epoch for a source of `len` samples; the last
    /// batch may be short.
    pub fn num_batches(&self, len: usize) -> usize {
        len.div_ceil(self.batch_size)
    }

    /// Batches for one epoch, fetched lazily and in order.
    pub fn iter<'a, D: SampleSource + ?Sized>(&mut self, source: &'a mut D) -> Batches<'a, D> {
        let mut order: Vec<usize> = (0..source.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        let chunks: Vec<Vec<usize>> = order
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        Batches {
            source,
            chunks: chunks.into_iter(),
        }
    }
}

/// Iterator returned by [`DataLoader::iter`].
pub struct Batches<'a, D: ?Sized> {
    source: &'a mut D,
    chunks: std::vec::IntoIter<Vec<usize>>,
}

impl<D: SampleSource + ?Sized> Iterator for Batches<'_, D> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.chunks.next()?;
        let samples: Result<Vec<Sample>> = indices.iter().map(|&i| self.source.fetch(i)).collect();
        Some(samples.and_then(|samples| Batch::collate(&samples)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl<D: SampleSource + ?Sized> ExactSizeIterator for Batches<'_, D> {}
