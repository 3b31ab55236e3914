//! Hierarchical fully connected latent variable model.
//!
//! Inference runs bottom-up: the observation is turned into an encoding
//! (see [`FullyConnectedModel::encoding_form`]) and each level updates its
//! approximate posterior and hands its inference output to the level above.
//! Generation runs top-down: each level draws a latent sample conditioned on
//! the level above, and the bottom sample feeds the output network.

use crate::candle_distributions::{
    Bernoulli, Distribution, Family, Multinomial, Normal, OutputDistribution,
};
use crate::candle_latent_level::{vars_with_prefix, FullyConnectedLatentLevel, GaussianLatent};
use crate::candle_layers::{layer_normalize, FullyConnectedNetwork};
use crate::config::{EncodingForm, ModelConfig};
use crate::error::{ModelError, Result};

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module, ModuleT, VarBuilder, VarMap};
use log::{debug, info};
use std::path::Path;

const MIN_OUTPUT_LOG_VAR: f64 = -10.;
const MAX_OUTPUT_LOG_VAR: f64 = 10.;

/// Result of one top-down pass
#[derive(Clone, Debug)]
pub struct Generation {
    /// observation model, parameters `(batch_size * n_samples, d)`
    pub output: OutputDistribution,
    /// one draw from `output`, `(batch_size * n_samples, d)`
    pub sample: Tensor,
    pub batch_size: usize,
    pub n_samples: usize,
}

enum OutputLogVar {
    Head(Linear),
    /// learned `(1, d)` vector shared by all rows
    Constant(Tensor),
}

/// Maps the output network's hidden units to the output distribution
enum OutputHead {
    Normal { mean: Linear, log_var: OutputLogVar },
    /// Bernoulli or Multinomial logits
    Logits { family: Family, logits: Linear },
}

impl OutputHead {
    fn new(
        family: Family,
        n_in: usize,
        n_out: usize,
        constant_variances: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mean = candle_nn::linear(n_in, n_out, vb.pp("mean"))?;
        let ret = match family {
            Family::Normal => {
                let log_var = if constant_variances {
                    OutputLogVar::Constant(vb.get_with_hints(
                        (1, n_out),
                        "log_var",
                        candle_nn::Init::Const(0.),
                    )?)
                } else {
                    OutputLogVar::Head(candle_nn::linear(n_in, n_out, vb.pp("log_var"))?)
                };
                OutputHead::Normal { mean, log_var }
            }
            Family::Bernoulli | Family::Multinomial => OutputHead::Logits {
                family,
                logits: mean,
            },
        };
        Ok(ret)
    }

    fn forward(&self, h: &Tensor) -> Result<OutputDistribution> {
        let ret = match self {
            OutputHead::Normal { mean, log_var } => {
                let mean = mean.forward(h)?;
                let log_var = match log_var {
                    OutputLogVar::Head(head) => head.forward(h)?,
                    OutputLogVar::Constant(lv) => lv.broadcast_as(mean.dims())?.contiguous()?,
                };
                let log_var = log_var.clamp(MIN_OUTPUT_LOG_VAR, MAX_OUTPUT_LOG_VAR)?;
                OutputDistribution::Normal(Normal::new(mean, log_var))
            }
            OutputHead::Logits { family, logits } => {
                let logits = logits.forward(h)?;
                match family {
                    Family::Multinomial => {
                        OutputDistribution::Multinomial(Multinomial::from_logits(logits))
                    }
                    _ => OutputDistribution::Bernoulli(Bernoulli::from_logits(logits)),
                }
            }
        };
        Ok(ret)
    }
}

pub struct FullyConnectedModel {
    config: ModelConfig,
    varmap: VarMap,
    device: Device,
    levels: Vec<FullyConnectedLatentLevel>,
    output_network: FullyConnectedNetwork,
    output_head: OutputHead,
    batch_size: usize,
    train: bool,
    last_generation: Option<Generation>,
}

impl FullyConnectedModel {
    /// Build the model described by `config`.
    ///
    /// Variables live in one `VarMap` under two roots:
    /// * `inference.level.{i}.*` - inference networks and posterior heads
    /// * `generative.level.{i}.*`, `generative.output.*` - generative
    ///   networks, prior heads, output network and output heads
    pub fn new(config: &ModelConfig, dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;

        let arch = &config.arch;
        let level_configs = arch.levels()?;
        let output_config = arch.output_network()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let mut levels = Vec::with_capacity(level_configs.len());
        for (lv, level_config) in level_configs.iter().enumerate() {
            debug!(
                "level {}: {} latent, inference {} -> {}, generative {:?}",
                lv,
                level_config.n_latent,
                level_config.inference.n_in,
                level_config.inference.n_out(),
                level_config
                    .generative
                    .as_ref()
                    .map(|g| (g.n_in, g.n_out()))
            );
            levels.push(FullyConnectedLatentLevel::new(
                lv,
                level_config,
                vb.pp("inference").pp(format!("level.{}", lv)),
                vb.pp("generative").pp(format!("level.{}", lv)),
            )?);
        }

        let vb_out = vb.pp("generative").pp("output");
        let output_network = FullyConnectedNetwork::new(&output_config, vb_out.pp("net"))?;
        let output_head = OutputHead::new(
            config.train_config.output_distribution,
            output_network.n_out(),
            arch.n_input,
            arch.constant_variances_gen,
            vb_out,
        )?;

        info!(
            "built a {}-level model: latent {:?}, {} output, {} variables",
            levels.len(),
            arch.n_latent,
            config.train_config.output_distribution,
            varmap.all_vars().len()
        );

        Ok(Self {
            config: config.clone(),
            varmap,
            device: device.clone(),
            levels,
            output_network,
            output_head,
            batch_size: config.train_config.batch_size,
            train: true,
            last_generation: None,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn levels(&self) -> &[FullyConnectedLatentLevel] {
        &self.levels
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn n_input(&self) -> usize {
        self.config.arch.n_input
    }

    pub fn output_family(&self) -> Family {
        self.config.train_config.output_distribution
    }

    /// Batch size used by prior passes (`generate(true, ..)`, `re_init`)
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size;
    }

    /// Toggle dropout and batch-norm training behaviour
    pub fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    pub fn last_generation(&self) -> Option<&Generation> {
        self.last_generation.as_ref()
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        Ok(self.varmap.save(path)?)
    }

    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        Ok(self.varmap.load(path)?)
    }

    /// Infer the approximate posterior of every level from `observation`
    /// `(n, n_input)`, bottom to top.
    ///
    /// All posteriors are computed before any is installed, so on error no
    /// level changes. The model batch size is left alone; see
    /// [`Self::set_batch_size`].
    pub fn infer(&mut self, observation: &Tensor) -> Result<()> {
        let (_, d) = observation.dims2()?;
        if d != self.n_input() {
            return Err(ModelError::Shape(format!(
                "observation has {} features, the model expects {}",
                d,
                self.n_input()
            )));
        }

        let mut encoding = self.encoding_form(observation)?;
        let mut updates = Vec::with_capacity(self.levels.len());
        for level in self.levels.iter() {
            let (h, update) = level.propose(&encoding, self.train)?;
            updates.push(update);
            encoding = h;
        }

        for (level, update) in self.levels.iter_mut().zip(updates) {
            level.latent_mut().commit(update);
        }
        Ok(())
    }

    /// Run the generative model top-down.
    ///
    /// * `gen` - sample every level from its prior (batch size
    ///   [`Self::batch_size`]) instead of the approximate posterior
    /// * `n_samples` - draws per observation
    pub fn generate(&mut self, gen: bool, n_samples: usize) -> Result<Generation> {
        if n_samples == 0 {
            return Err(ModelError::config("n_samples must be positive"));
        }

        let batch = if gen {
            self.batch_size
        } else {
            let top = self
                .levels
                .last()
                .ok_or(ModelError::MissingState("latent levels"))?;
            top.latent()
                .posterior()
                .ok_or(ModelError::MissingState(
                    "approximate posterior (call infer or re_init first)",
                ))?
                .rows()?
        };

        let train = self.train;
        let mut decoding: Option<Tensor> = None;
        for level in self.levels.iter_mut().rev() {
            decoding = Some(level.generate(decoding.as_ref(), batch, gen, n_samples, train)?);
        }
        let decoding = decoding.ok_or(ModelError::MissingState("latent levels"))?;

        let h = self.output_network.forward_t(&decoding, train)?;
        let output = self.output_head.forward(&h)?;
        let sample = output.sample()?;

        let generation = Generation {
            output,
            sample,
            batch_size: batch,
            n_samples,
        };
        self.last_generation = Some(generation.clone());
        Ok(generation)
    }

    /// One prior pass, then reset every level's posterior to its prior
    pub fn re_init(&mut self) -> Result<()> {
        self.generate(true, 1)?;
        for level in self.levels.iter_mut() {
            level.latent_mut().re_init()?;
        }
        Ok(())
    }

    /// Assemble the bottom-level encoding from the active input forms,
    /// always in the order observation, gradient, error:
    ///
    /// * observation: `x - 0.5`
    /// * gradient: `LN(∇μ), LN(∇lnσ²), LN(μ), LN(lnσ²)` of the bottom latent
    /// * error: `LN(output error), LN(latent error), LN(μ), LN(lnσ²)`
    ///
    /// where `LN` normalizes each row.
    pub fn encoding_form(&self, observation: &Tensor) -> Result<Tensor> {
        let arch = &self.config.arch;
        let mut encoding = Vec::with_capacity(3);

        if arch.uses_form(EncodingForm::Observation) {
            encoding.push((observation - 0.5)?);
        }

        if arch.uses_form(EncodingForm::Gradient) {
            let bottom = self.bottom_latent_checked(observation)?;
            let [d_mean, d_log_var] = bottom.approx_posterior_gradients()?;
            let [mean, log_var] = bottom.approx_posterior_parameters()?;
            encoding.push(normalize_concat(&[d_mean, d_log_var, mean, log_var])?);
        }

        if arch.uses_form(EncodingForm::Error) {
            let generation = self.last_generation.as_ref().ok_or(ModelError::MissingState(
                "output distribution (call generate or re_init first)",
            ))?;
            let output_error = self.output_error(observation, generation)?;
            let bottom = self.bottom_latent_checked(observation)?;
            let latent_error = bottom.error()?;
            let [mean, log_var] = bottom.approx_posterior_parameters()?;
            encoding.push(normalize_concat(&[output_error, latent_error, mean, log_var])?);
        }

        if encoding.len() == 1 {
            Ok(encoding.remove(0))
        } else {
            Ok(Tensor::cat(&encoding, 1)?)
        }
    }

    fn bottom_latent_checked(
        &self,
        observation: &Tensor,
    ) -> Result<&GaussianLatent> {
        let bottom = self
            .levels
            .first()
            .ok_or(ModelError::MissingState("latent levels"))?
            .latent();
        let n = observation.dim(0)?;
        let held = bottom
            .posterior()
            .ok_or(ModelError::MissingState(
                "approximate posterior (call re_init first)",
            ))?
            .rows()?;
        if held != n {
            return Err(ModelError::Shape(format!(
                "latent state holds a batch of {}, observation has {} rows; re_init after changing the batch",
                held, n
            )));
        }
        Ok(bottom)
    }

    /// Normalized residual of the observation under the output distribution,
    /// `(x - μ) / exp(lnσ² + 1e-7)` with detached parameters, averaged over
    /// samples: `(n, d)`.
    ///
    /// Output families without a variance fail with `UnsupportedOutput`.
    pub fn output_error(&self, observation: &Tensor, generation: &Generation) -> Result<Tensor> {
        let params = generation.output.error_parameters()?;

        let (n, d) = observation.dims2()?;
        let s = generation.n_samples;
        if generation.batch_size != n {
            return Err(ModelError::Shape(format!(
                "output distribution has batch {}, observation has {} rows",
                generation.batch_size, n
            )));
        }

        let mean = params.mean.reshape((n, s, d))?;
        let scale = (params.log_var + 1e-7)?.exp()?.reshape((n, s, d))?;
        let err = observation.unsqueeze(1)?.broadcast_sub(&mean)?.div(&scale)?;
        Ok(err.mean(1)?)
    }

    /// Store posterior gradients from a backward pass for the `gradient`
    /// input form
    pub fn record_posterior_gradients(&mut self, grads: &GradStore) -> Result<()> {
        for level in self.levels.iter_mut() {
            level.latent_mut().record_gradients(grads)?;
        }
        Ok(())
    }

    /// KL(q || p) per level after a `generate(false, ..)` pass, each `(n,)`
    pub fn kl_divergences(&self) -> Result<Vec<Tensor>> {
        self.levels
            .iter()
            .map(|level| level.latent().kl_divergence())
            .collect()
    }

    /// Inference networks and posterior heads of every level
    pub fn inference_parameters(&self) -> Result<Vec<Var>> {
        let mut params = vec![];
        for level in self.levels.iter() {
            params.extend(level.inference_parameters(&self.varmap)?);
        }
        Ok(params)
    }

    /// Generative networks and prior heads of every level, plus the output
    /// network and output heads
    pub fn generative_parameters(&self) -> Result<Vec<Var>> {
        let mut params = vec![];
        for level in self.levels.iter() {
            params.extend(level.generative_parameters(&self.varmap)?);
        }
        params.extend(vars_with_prefix(&self.varmap, "generative.output.")?);
        Ok(params)
    }
}

fn normalize_concat(parts: &[Tensor]) -> Result<Tensor> {
    let normalized = parts
        .iter()
        .map(|t| layer_normalize(&t.detach()))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&normalized, 1)?)
}
