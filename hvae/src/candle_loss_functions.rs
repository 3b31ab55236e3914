use crate::candle_distributions::{expand_samples, Distribution};
use crate::candle_model::{FullyConnectedModel, Generation};
use crate::error::Result;

use candle_core::Tensor;

/// Variational free energy of one minibatch and its parts
pub struct FreeEnergy {
    /// scalar `mean_n(kl_weight * Σ_l KL_l - llik)`
    pub loss: Tensor,
    /// log p(x|z) averaged over samples, `(n,)`
    pub reconstruction: Tensor,
    /// KL(q || p) per level before clamping, each `(n,)`
    pub kl: Vec<Tensor>,
}

impl FreeEnergy {
    pub fn loss_value(&self) -> Result<f32> {
        Ok(self.loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?)
    }

    /// Batch-mean log-likelihood
    pub fn reconstruction_value(&self) -> Result<f32> {
        Ok(self
            .reconstruction
            .mean_all()?
            .to_dtype(candle_core::DType::F32)?
            .to_scalar::<f32>()?)
    }

    /// Batch-mean KL of each level
    pub fn kl_values(&self) -> Result<Vec<f32>> {
        self.kl
            .iter()
            .map(|kl| {
                Ok(kl
                    .mean_all()?
                    .to_dtype(candle_core::DType::F32)?
                    .to_scalar::<f32>()?)
            })
            .collect()
    }
}

/// Log-likelihood of the observations under the generated output
/// distribution, averaged over the samples of each observation
///
/// * `x_nd` - observed data `(n, d)`
/// * `generation` - output of `generate(false, s)`, rows `(n * s, d)`
///
pub fn reconstruction_log_likelihood(x_nd: &Tensor, generation: &Generation) -> Result<Tensor> {
    let s = generation.n_samples;
    let n = x_nd.dim(0)?;
    let x_sd = expand_samples(x_nd, s)?;
    let llik = generation.output.log_prob(&x_sd)?;
    Ok(llik.reshape((n, s))?.mean(1)?)
}

/// Negative evidence lower bound
///
/// loss = mean_n( kl_weight * sum_l max(KL_l(n), kl_min) - llik(n) )
///
/// * `model` - model after `infer` and `generate(false, s)`
/// * `x_nd` - observed data
/// * `generation` - the generation produced from the posterior
/// * `kl_weight` - warm-up weight on the KL terms
/// * `kl_min` - free bits; per-observation lower bound on each level's KL
///
pub fn free_energy(
    model: &FullyConnectedModel,
    x_nd: &Tensor,
    generation: &Generation,
    kl_weight: f64,
    kl_min: f64,
) -> Result<FreeEnergy> {
    let reconstruction = reconstruction_log_likelihood(x_nd, generation)?;
    let kl = model.kl_divergences()?;

    let mut kl_tot = reconstruction.zeros_like()?;
    for kl_n in kl.iter() {
        let kl_n = if kl_min > 0. {
            kl_n.maximum(kl_min)?
        } else {
            kl_n.clone()
        };
        kl_tot = (kl_tot + kl_n)?;
    }

    let loss = ((kl_tot * kl_weight)? - &reconstruction)?.mean_all()?;

    Ok(FreeEnergy {
        loss,
        reconstruction,
        kl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_distributions::Family;
    use crate::config::{ArchConfig, ModelConfig, TrainConfig};
    use candle_core::{DType, Device};

    fn model() -> Result<FullyConnectedModel> {
        let config = ModelConfig {
            train_config: TrainConfig {
                batch_size: 5,
                output_distribution: Family::Bernoulli,
                ..Default::default()
            },
            arch: ArchConfig {
                n_input: 4,
                n_latent: vec![2],
                n_layers_inf: vec![1],
                n_units_inf: vec![6],
                n_layers_gen: vec![1, 0],
                n_units_gen: vec![6, 0],
                ..Default::default()
            },
        };
        FullyConnectedModel::new(&config, DType::F32, &Device::Cpu)
    }

    #[test]
    fn free_energy_parts() -> Result<()> {
        let mut model = model()?;
        let x = Tensor::ones((5, 4), DType::F32, &Device::Cpu)?;
        model.infer(&x)?;
        let generation = model.generate(false, 3)?;
        let fe = free_energy(&model, &x, &generation, 1.0, 0.0)?;

        assert_eq!(fe.reconstruction.dims(), &[5]);
        assert_eq!(fe.kl.len(), 1);
        assert_eq!(fe.kl[0].dims(), &[5]);

        let expected = (fe.kl[0].mean_all()?.to_scalar::<f32>()?) - fe.reconstruction_value()?;
        assert!((fe.loss_value()? - expected).abs() < 1e-4);
        // Bernoulli log-likelihood is never positive
        assert!(fe.reconstruction_value()? <= 0.0);
        Ok(())
    }

    #[test]
    fn free_bits_raise_the_loss() -> Result<()> {
        let mut model = model()?;
        let x = Tensor::zeros((5, 4), DType::F32, &Device::Cpu)?;
        model.infer(&x)?;
        let generation = model.generate(false, 1)?;
        let plain = free_energy(&model, &x, &generation, 1.0, 0.0)?.loss_value()?;
        let clamped = free_energy(&model, &x, &generation, 1.0, 1e3)?.loss_value()?;
        assert!(clamped >= plain);
        assert!(clamped >= 1e3 - 1.0);

        let no_kl = free_energy(&model, &x, &generation, 0.0, 0.0)?;
        let expected = -no_kl.reconstruction_value()?;
        assert!((no_kl.loss_value()? - expected).abs() < 1e-4);
        Ok(())
    }
}
