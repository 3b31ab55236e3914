pub use crate::candle_data_loader_util::Minibatches;

use anyhow::anyhow;
use candle_core::{Device, Tensor};

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> anyhow::Result<Tensor>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for an in-memory 2d matrix. Each row will be
/// considered as a feature vector. The number of samples is the
/// number of rows.
///
pub struct InMemoryData {
    rows: Vec<Tensor>,
    n_features: usize,
    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader from the rows of `data` `(n, d)`
    ///
    pub fn from_tensor(data: &Tensor) -> anyhow::Result<Self> {
        let (n, d) = data.dims2()?;
        if n == 0 {
            return Err(anyhow!("empty data matrix"));
        }
        let rows = (0..n)
            .map(|i| data.narrow(0, i, 1))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(InMemoryData {
            rows,
            n_features: d,
            minibatches: Minibatches::new(n),
        })
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> anyhow::Result<Tensor> {
        let chunk = self.minibatches.chunks.get(batch_idx).ok_or(anyhow!(
            "invalid index = {} vs. total # = {}",
            batch_idx,
            self.minibatches.num_chunks()
        ))?;

        let x = Tensor::cat(
            &chunk.iter().map(|&i| self.rows[i].clone()).collect::<Vec<_>>(),
            0,
        )?;
        Ok(x.to_device(target_device)?)
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.num_chunks()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size == 0 {
            return Err(anyhow!("batch size must be positive"));
        }
        self.minibatches.shuffle_minibatch(batch_size);
        Ok(())
    }
}
