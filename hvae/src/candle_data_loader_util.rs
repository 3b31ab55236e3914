use rand::prelude::SliceRandom;
use rand::Rng;

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    pub samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(size: usize) -> Self {
        Self {
            samples: (0..size).collect(),
            chunks: vec![],
        }
    }

    /// Shuffle with a fresh thread-local generator
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        self.shuffle_minibatch_with(batch_size, &mut rand::rng());
    }

    /// Shuffle all samples and cut them into chunks of `batch_size`; the
    /// last chunk keeps the remainder.
    pub fn shuffle_minibatch_with<R: Rng + ?Sized>(&mut self, batch_size: usize, rng: &mut R) {
        let batch_size = batch_size.max(1);
        self.samples.shuffle(rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn chunks_partition_samples() {
        let mut mb = Minibatches::new(10);
        mb.shuffle_minibatch_with(4, &mut StdRng::seed_from_u64(7));

        assert_eq!(mb.num_chunks(), 3);
        assert_eq!(
            mb.chunks.iter().map(|c| c.len()).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );

        let mut seen = mb.chunks.concat();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }
}
