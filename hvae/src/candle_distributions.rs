//! Parametric distributions for latent variables and observations.
//!
//! Distributions are plain values rebuilt on every pass: a network head
//! produces the parameters, the caller samples or scores with them and hands
//! them on. Each family declares whether it can feed error-based inference
//! (see [`Distribution::error_parameters`]).

use crate::candle_layers::softplus;
use crate::error::{ModelError, Result};
use candle_core::{Tensor, D};
use candle_nn::ops;
use serde::{Deserialize, Serialize};
use std::fmt;

const LN_2PI: f64 = 1.8378770664093453;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Normal,
    Bernoulli,
    Multinomial,
}

impl Family {
    pub fn supports_error_inference(&self) -> bool {
        matches!(self, Family::Normal)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Normal => "normal",
            Family::Bernoulli => "bernoulli",
            Family::Multinomial => "multinomial",
        };
        f.write_str(name)
    }
}

/// Detached location and log-scale used to normalize residuals
pub struct ErrorParameters {
    pub mean: Tensor,
    pub log_var: Tensor,
}

pub trait Distribution {
    fn family(&self) -> Family;

    /// Expected value, `(rows, k)`
    fn mean(&self) -> Result<Tensor>;

    /// One draw per row, `(rows, k)`
    fn sample(&self) -> Result<Tensor>;

    /// Log density of `x` summed over the feature axis, `(rows,)`
    fn log_prob(&self, x: &Tensor) -> Result<Tensor>;

    /// Same parameters without a gradient path
    fn detach(&self) -> Self
    where
        Self: Sized;

    fn supports_error_inference(&self) -> bool {
        self.family().supports_error_inference()
    }

    /// Parameters for normalized residuals `(x - mean) / exp(log_var)`.
    /// Families without a variance report `UnsupportedOutput`.
    fn error_parameters(&self) -> Result<ErrorParameters> {
        Err(ModelError::UnsupportedOutput {
            family: self.family(),
        })
    }
}

/// Repeat every row `n_samples` times: `(n, k) -> (n * s, k)` with row
/// `b * s + j` holding row `b`
pub fn expand_samples(x_nk: &Tensor, n_samples: usize) -> Result<Tensor> {
    if n_samples == 1 {
        return Ok(x_nk.clone());
    }
    let (n, k) = x_nk.dims2()?;
    Ok(x_nk
        .unsqueeze(1)?
        .broadcast_as((n, n_samples, k))?
        .reshape((n * n_samples, k))?)
}

/// Average `(n * s, k)` rows back over the sample axis: `(n, k)`
pub fn average_samples(x_sk: &Tensor, n_samples: usize) -> Result<Tensor> {
    if n_samples == 1 {
        return Ok(x_sk.clone());
    }
    let (ns, k) = x_sk.dims2()?;
    if ns % n_samples != 0 {
        return Err(ModelError::Shape(format!(
            "{} rows cannot be split into {} samples",
            ns, n_samples
        )));
    }
    Ok(x_sk.reshape((ns / n_samples, n_samples, k))?.mean(1)?)
}

/////////////////////////////////
// Diagonal Gaussian N(μ, σ²)  //
/////////////////////////////////

#[derive(Clone, Debug)]
pub struct Normal {
    mean: Tensor,
    log_var: Tensor,
}

impl Normal {
    pub fn new(mean: Tensor, log_var: Tensor) -> Self {
        Self { mean, log_var }
    }

    /// N(0, I) with `rows x k` parameters shaped like `like`'s dtype/device
    pub fn standard(rows: usize, k: usize, like: &Tensor) -> Result<Self> {
        let mean = Tensor::zeros((rows, k), like.dtype(), like.device())?;
        let log_var = mean.zeros_like()?;
        Ok(Self { mean, log_var })
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn log_var(&self) -> &Tensor {
        &self.log_var
    }

    pub fn std(&self) -> Result<Tensor> {
        Ok((&self.log_var * 0.5)?.exp()?)
    }

    pub fn rows(&self) -> Result<usize> {
        Ok(self.mean.dim(0)?)
    }

    pub fn expand_samples(&self, n_samples: usize) -> Result<Self> {
        Ok(Self {
            mean: expand_samples(&self.mean, n_samples)?,
            log_var: expand_samples(&self.log_var, n_samples)?,
        })
    }

    /// KL(self || other) summed over the feature axis
    ///
    /// 0.5 * [lnσ²_p - lnσ²_q + (σ²_q + (μ_q - μ_p)²) / σ²_p - 1]
    pub fn kl_divergence(&self, other: &Normal) -> Result<Tensor> {
        let var_q = self.log_var.exp()?;
        let var_p = other.log_var.exp()?;
        let diff_sq = (&self.mean - &other.mean)?.sqr()?;
        let ratio = ((var_q + diff_sq)? / var_p)?;
        let kl = (((&other.log_var - &self.log_var)? + ratio)? - 1.0)?;
        Ok((kl.sum(D::Minus1)? * 0.5)?)
    }
}

impl Distribution for Normal {
    fn family(&self) -> Family {
        Family::Normal
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(self.mean.clone())
    }

    /// z = μ + σ * ε, where ε ~ N(0, 1)
    fn sample(&self) -> Result<Tensor> {
        let eps = Tensor::randn_like(&self.mean, 0., 1.)?;
        Ok((&self.mean + (self.std()? * eps)?)?)
    }

    /// -0.5 * Σ [ln(2π) + lnσ² + (x - μ)² / σ²]
    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let diff_sq = x.broadcast_sub(&self.mean)?.sqr()?;
        let scaled = (diff_sq / self.log_var.exp()?)?;
        let elem = ((scaled + &self.log_var)? + LN_2PI)?;
        Ok((elem.sum(D::Minus1)? * (-0.5))?)
    }

    fn detach(&self) -> Self {
        Self {
            mean: self.mean.detach(),
            log_var: self.log_var.detach(),
        }
    }

    fn error_parameters(&self) -> Result<ErrorParameters> {
        Ok(ErrorParameters {
            mean: self.mean.detach(),
            log_var: self.log_var.detach(),
        })
    }
}

///////////////
// Bernoulli //
///////////////

#[derive(Clone, Debug)]
pub struct Bernoulli {
    logits: Tensor,
}

impl Bernoulli {
    pub fn from_logits(logits: Tensor) -> Self {
        Self { logits }
    }

    pub fn logits(&self) -> &Tensor {
        &self.logits
    }
}

impl Distribution for Bernoulli {
    fn family(&self) -> Family {
        Family::Bernoulli
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(ops::sigmoid(&self.logits)?)
    }

    /// hard 0/1 draws; no reparameterization path
    fn sample(&self) -> Result<Tensor> {
        let p = ops::sigmoid(&self.logits.detach())?;
        let u = Tensor::rand_like(&p, 0., 1.)?;
        Ok(u.lt(&p)?.to_dtype(p.dtype())?)
    }

    /// Σ [x * logit - softplus(logit)]
    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let elem = (x.broadcast_mul(&self.logits)? - softplus(&self.logits)?)?;
        Ok(elem.sum(D::Minus1)?)
    }

    fn detach(&self) -> Self {
        Self {
            logits: self.logits.detach(),
        }
    }
}

/////////////////
// Multinomial //
/////////////////

#[derive(Clone, Debug)]
pub struct Multinomial {
    logits: Tensor,
}

impl Multinomial {
    pub fn from_logits(logits: Tensor) -> Self {
        Self { logits }
    }

    pub fn logits(&self) -> &Tensor {
        &self.logits
    }
}

impl Distribution for Multinomial {
    fn family(&self) -> Family {
        Family::Multinomial
    }

    fn mean(&self) -> Result<Tensor> {
        Ok(ops::softmax(&self.logits, D::Minus1)?)
    }

    /// one-hot draw per row by the Gumbel-max trick
    fn sample(&self) -> Result<Tensor> {
        let logits = self.logits.detach();
        let u = Tensor::rand_like(&logits, 0., 1.)?.clamp(1e-7, 1. - 1e-7)?;
        let gumbel = u.log()?.neg()?.log()?.neg()?;
        let perturbed = (logits + gumbel)?;
        let max = perturbed.max_keepdim(D::Minus1)?;
        Ok(perturbed
            .broadcast_eq(&max)?
            .to_dtype(perturbed.dtype())?)
    }

    /// Σ x * log softmax(logit)
    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let log_p = ops::log_softmax(&self.logits, D::Minus1)?;
        Ok(x.broadcast_mul(&log_p)?.sum(D::Minus1)?)
    }

    fn detach(&self) -> Self {
        Self {
            logits: self.logits.detach(),
        }
    }
}

/// The observation model held by the hierarchical model
#[derive(Clone, Debug)]
pub enum OutputDistribution {
    Normal(Normal),
    Bernoulli(Bernoulli),
    Multinomial(Multinomial),
}

impl Distribution for OutputDistribution {
    fn family(&self) -> Family {
        match self {
            Self::Normal(d) => d.family(),
            Self::Bernoulli(d) => d.family(),
            Self::Multinomial(d) => d.family(),
        }
    }

    fn mean(&self) -> Result<Tensor> {
        match self {
            Self::Normal(d) => Distribution::mean(d),
            Self::Bernoulli(d) => d.mean(),
            Self::Multinomial(d) => d.mean(),
        }
    }

    fn sample(&self) -> Result<Tensor> {
        match self {
            Self::Normal(d) => d.sample(),
            Self::Bernoulli(d) => d.sample(),
            Self::Multinomial(d) => d.sample(),
        }
    }

    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Normal(d) => d.log_prob(x),
            Self::Bernoulli(d) => d.log_prob(x),
            Self::Multinomial(d) => d.log_prob(x),
        }
    }

    fn detach(&self) -> Self {
        match self {
            Self::Normal(d) => Self::Normal(d.detach()),
            Self::Bernoulli(d) => Self::Bernoulli(d.detach()),
            Self::Multinomial(d) => Self::Multinomial(d.detach()),
        }
    }

    fn error_parameters(&self) -> Result<ErrorParameters> {
        match self {
            Self::Normal(d) => d.error_parameters(),
            Self::Bernoulli(d) => d.error_parameters(),
            Self::Multinomial(d) => d.error_parameters(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn normal_sample_shape() -> Result<()> {
        let dev = Device::Cpu;
        let mean = Tensor::randn(0f32, 1f32, (5, 3), &dev)?;
        let log_var = Tensor::zeros((5, 3), DType::F32, &dev)?;
        let normal = Normal::new(mean, log_var);
        let z = normal.expand_samples(4)?.sample()?;
        assert_eq!(z.dims(), &[20, 3]);
        Ok(())
    }

    #[test]
    fn normal_log_prob_at_mean() -> Result<()> {
        let dev = Device::Cpu;
        let mean = Tensor::new(&[[0.5f64, -1.0]], &dev)?;
        let log_var = Tensor::zeros((1, 2), DType::F64, &dev)?;
        let normal = Normal::new(mean.clone(), log_var);
        let lp: Vec<f64> = normal.log_prob(&mean)?.to_vec1()?;
        let expected = -0.5 * LN_2PI * 2.0;
        assert!((lp[0] - expected).abs() < 1e-8, "{} vs {}", lp[0], expected);
        Ok(())
    }

    #[test]
    fn kl_matches_closed_form_against_standard() -> Result<()> {
        let dev = Device::Cpu;
        let mean = Tensor::new(&[[1.0f64, 0.0], [0.0, 2.0]], &dev)?;
        let log_var = Tensor::new(&[[0.0f64, 1.0], [-1.0, 0.0]], &dev)?;
        let q = Normal::new(mean.clone(), log_var.clone());
        let p = Normal::standard(2, 2, &mean)?;
        let kl: Vec<f64> = q.kl_divergence(&p)?.to_vec1()?;

        // 0.5 * Σ (σ² - 1 + μ² - lnσ²)
        let closed = |m: [f64; 2], lv: [f64; 2]| -> f64 {
            (0..2)
                .map(|j| lv[j].exp() - 1.0 + m[j] * m[j] - lv[j])
                .sum::<f64>()
                * 0.5
        };
        assert!((kl[0] - closed([1.0, 0.0], [0.0, 1.0])).abs() < 1e-8);
        assert!((kl[1] - closed([0.0, 2.0], [-1.0, 0.0])).abs() < 1e-8);

        let self_kl: Vec<f64> = q.kl_divergence(&q)?.to_vec1()?;
        assert!(self_kl.iter().all(|x| x.abs() < 1e-10));
        Ok(())
    }

    #[test]
    fn expand_then_average_recovers_rows() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1f32, 2.], [3., 4.]], &dev)?;
        let x3 = expand_samples(&x, 3)?;
        let rows: Vec<Vec<f32>> = x3.to_vec2()?;
        assert_eq!(rows[0], vec![1., 2.]);
        assert_eq!(rows[2], vec![1., 2.]);
        assert_eq!(rows[3], vec![3., 4.]);
        let back: Vec<Vec<f32>> = average_samples(&x3, 3)?.to_vec2()?;
        assert_eq!(back, vec![vec![1., 2.], vec![3., 4.]]);
        Ok(())
    }

    #[test]
    fn bernoulli_draws_are_binary() -> Result<()> {
        let dev = Device::Cpu;
        let logits = Tensor::randn(0f32, 3f32, (16, 8), &dev)?;
        let x: Vec<Vec<f32>> = Bernoulli::from_logits(logits).sample()?.to_vec2()?;
        assert!(x.iter().flatten().all(|&v| v == 0.0 || v == 1.0));
        Ok(())
    }

    #[test]
    fn multinomial_draws_are_one_hot() -> Result<()> {
        let dev = Device::Cpu;
        let logits = Tensor::randn(0f32, 1f32, (10, 6), &dev)?;
        let dist = Multinomial::from_logits(logits);
        let row_sums: Vec<f32> = dist.sample()?.sum(1)?.to_vec1()?;
        assert!(row_sums.iter().all(|&s| s == 1.0));
        let mean_sums: Vec<f32> = dist.mean()?.sum(1)?.to_vec1()?;
        assert!(mean_sums.iter().all(|&s| (s - 1.0).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn only_normal_has_error_parameters() -> Result<()> {
        let dev = Device::Cpu;
        let t = Tensor::zeros((2, 3), DType::F32, &dev)?;
        let normal = OutputDistribution::Normal(Normal::new(t.clone(), t.clone()));
        assert!(normal.supports_error_inference());
        assert!(normal.error_parameters().is_ok());

        let bern = OutputDistribution::Bernoulli(Bernoulli::from_logits(t.clone()));
        assert!(!bern.supports_error_inference());
        assert!(matches!(
            bern.error_parameters(),
            Err(ModelError::UnsupportedOutput {
                family: Family::Bernoulli
            })
        ));

        let multi = OutputDistribution::Multinomial(Multinomial::from_logits(t));
        assert!(multi.error_parameters().is_err());
        Ok(())
    }
}
