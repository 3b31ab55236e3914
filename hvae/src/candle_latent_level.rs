//! One level of the latent hierarchy.
//!
//! A level owns a bottom-up inference network, an optional top-down
//! generative network and a Gaussian latent variable. Its approximate
//! posterior q(z|·) reads the inference network; its prior p(z|z_above)
//! reads the generative network, or is N(0, I) at a top level without one.

use crate::candle_distributions::{average_samples, Distribution, Normal};
use crate::candle_layers::FullyConnectedNetwork;
use crate::config::{LevelConfig, VariableUpdateForm};
use crate::error::{ModelError, Result};

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{ops, Linear, Module, ModuleT, VarBuilder, VarMap};

const MIN_LOG_VAR: f64 = -8.;
const MAX_LOG_VAR: f64 = 8.;

/// Variables whose name starts with `prefix`, sorted by name
pub(crate) fn vars_with_prefix(varmap: &VarMap, prefix: &str) -> Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| ModelError::MissingState("variable map lock was poisoned"))?;
    let mut named = data
        .iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .collect::<Vec<_>>();
    named.sort_by(|a, b| a.0.cmp(b.0));
    Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
}

/// Most recent values produced by `infer`/`generate`
#[derive(Default)]
struct LatentState {
    /// q(z|x), `(n, k)`
    posterior: Option<Normal>,
    /// p(z|z_above), `(n * s, k)`
    prior: Option<Normal>,
    /// `(n * s, k)`
    sample: Option<Tensor>,
    /// zero-valued variables added to the posterior (mean, log_var) so
    /// that a backward pass keeps their gradients
    taps: Option<(Var, Var)>,
    /// d loss / d (mean, log_var) of the posterior
    posterior_gradients: Option<(Tensor, Tensor)>,
    n_samples: usize,
}

enum PriorLogVar {
    Head(Linear),
    /// learned `(1, k)` vector shared by all rows
    Constant(Tensor),
}

struct PriorHeads {
    mean: Linear,
    log_var: PriorLogVar,
}

impl PriorHeads {
    fn forward(&self, h: &Tensor) -> Result<Normal> {
        let mean = self.mean.forward(h)?;
        let log_var = match &self.log_var {
            PriorLogVar::Head(head) => head.forward(h)?,
            PriorLogVar::Constant(lv) => lv.broadcast_as(mean.dims())?.contiguous()?,
        };
        Ok(Normal::new(mean, log_var.clamp(MIN_LOG_VAR, MAX_LOG_VAR)?))
    }
}

/// Sigmoid gates mixing the previous posterior into a new one
struct UpdateGates {
    mean: Linear,
    log_var: Linear,
}

/// A posterior computed from one inference pass, not yet installed
pub struct PosteriorUpdate {
    posterior: Normal,
    taps: (Var, Var),
}

impl PosteriorUpdate {
    pub fn posterior(&self) -> &Normal {
        &self.posterior
    }
}

/// Gaussian latent variable with amortized posterior and conditional prior
pub struct GaussianLatent {
    n_variables: usize,
    posterior_mean: Linear,
    posterior_log_var: Linear,
    update_gates: Option<UpdateGates>,
    prior: Option<PriorHeads>,
    state: LatentState,
}

impl GaussianLatent {
    /// Will create these variables:
    /// * `{vb_inf}.posterior.mean.*`, `{vb_inf}.posterior.log_var.*`
    /// * `{vb_inf}.posterior.{mean,log_var}_gate.*` for gated updates
    /// * `{vb_gen}.prior.mean.*` and `{vb_gen}.prior.log_var.*` when the prior
    ///   is conditional (`n_in_gen` given)
    ///
    /// # Arguments
    /// * `n_variables` - latent dimension k
    /// * `n_in_inf` - width of the inference network output
    /// * `n_in_gen` - width of the generative network output, `None` for N(0, I)
    /// * `constant_prior_variances` - learn one prior log-variance per dimension
    /// * `update_form` - how `infer` revises an existing posterior
    pub fn new(
        n_variables: usize,
        n_in_inf: usize,
        n_in_gen: Option<usize>,
        constant_prior_variances: bool,
        update_form: VariableUpdateForm,
        vb_inf: VarBuilder,
        vb_gen: VarBuilder,
    ) -> Result<Self> {
        let posterior_mean = candle_nn::linear(n_in_inf, n_variables, vb_inf.pp("posterior.mean"))?;
        let posterior_log_var =
            candle_nn::linear(n_in_inf, n_variables, vb_inf.pp("posterior.log_var"))?;

        let update_gates = match update_form {
            VariableUpdateForm::Direct => None,
            VariableUpdateForm::Gated => Some(UpdateGates {
                mean: candle_nn::linear(n_in_inf, n_variables, vb_inf.pp("posterior.mean_gate"))?,
                log_var: candle_nn::linear(
                    n_in_inf,
                    n_variables,
                    vb_inf.pp("posterior.log_var_gate"),
                )?,
            }),
        };

        let prior = match n_in_gen {
            Some(n_in_gen) => {
                let mean = candle_nn::linear(n_in_gen, n_variables, vb_gen.pp("prior.mean"))?;
                let log_var = if constant_prior_variances {
                    PriorLogVar::Constant(vb_gen.get_with_hints(
                        (1, n_variables),
                        "prior.log_var",
                        candle_nn::Init::Const(0.),
                    )?)
                } else {
                    PriorLogVar::Head(candle_nn::linear(
                        n_in_gen,
                        n_variables,
                        vb_gen.pp("prior.log_var"),
                    )?)
                };
                Some(PriorHeads { mean, log_var })
            }
            None => None,
        };

        Ok(Self {
            n_variables,
            posterior_mean,
            posterior_log_var,
            update_gates,
            prior,
            state: LatentState::default(),
        })
    }

    pub fn n_variables(&self) -> usize {
        self.n_variables
    }

    pub fn posterior(&self) -> Option<&Normal> {
        self.state.posterior.as_ref()
    }

    pub fn prior(&self) -> Option<&Normal> {
        self.state.prior.as_ref()
    }

    pub fn sample(&self) -> Option<&Tensor> {
        self.state.sample.as_ref()
    }

    fn require_posterior(&self) -> Result<&Normal> {
        self.state
            .posterior
            .as_ref()
            .ok_or(ModelError::MissingState(
                "approximate posterior (call infer or re_init first)",
            ))
    }

    fn require_prior(&self) -> Result<&Normal> {
        self.state
            .prior
            .as_ref()
            .ok_or(ModelError::MissingState("prior (call generate first)"))
    }

    /// Compute q(z|h) from the inference network output `h` without
    /// touching the current state.
    ///
    /// With gated updates and a current posterior of the same batch, each
    /// parameter becomes `g * old + (1 - g) * new`, the old value detached.
    pub fn propose(&self, h: &Tensor) -> Result<PosteriorUpdate> {
        let mean = self.posterior_mean.forward(h)?;
        let log_var = self
            .posterior_log_var
            .forward(h)?
            .clamp(MIN_LOG_VAR, MAX_LOG_VAR)?;

        let rows = mean.dim(0)?;
        let previous = self
            .state
            .posterior
            .as_ref()
            .filter(|old| old.mean().dim(0).ok() == Some(rows));

        let (mean, log_var) = match (&self.update_gates, previous) {
            (Some(gates), Some(old)) => {
                let g_mean = ops::sigmoid(&gates.mean.forward(h)?)?;
                let g_log_var = ops::sigmoid(&gates.log_var.forward(h)?)?;
                let mean = (g_mean.mul(&old.mean().detach())?
                    + g_mean.affine(-1., 1.)?.mul(&mean)?)?;
                let log_var = (g_log_var.mul(&old.log_var().detach())?
                    + g_log_var.affine(-1., 1.)?.mul(&log_var)?)?;
                (mean, log_var)
            }
            _ => (mean, log_var),
        };

        let tap_mean = Var::zeros(mean.dims(), mean.dtype(), mean.device())?;
        let tap_log_var = Var::zeros(log_var.dims(), log_var.dtype(), log_var.device())?;
        let mean = (mean + tap_mean.as_tensor())?;
        let log_var = (log_var + tap_log_var.as_tensor())?;

        Ok(PosteriorUpdate {
            posterior: Normal::new(mean, log_var),
            taps: (tap_mean, tap_log_var),
        })
    }

    /// Install a posterior from `propose`
    pub fn commit(&mut self, update: PosteriorUpdate) {
        self.state.posterior = Some(update.posterior);
        self.state.taps = Some(update.taps);
    }

    /// Set q(z|h) from the inference network output `h`
    pub fn infer(&mut self, h: &Tensor) -> Result<()> {
        let update = self.propose(h)?;
        self.commit(update);
        Ok(())
    }

    /// Evaluate the prior and draw `(batch * n_samples, k)` latent values,
    /// from the prior when `gen` is set and from the posterior otherwise.
    ///
    /// * `h_gen` - generative network output, `(batch * n_samples, ·)`
    pub fn generate(
        &mut self,
        h_gen: Option<&Tensor>,
        batch: usize,
        gen: bool,
        n_samples: usize,
    ) -> Result<Tensor> {
        let rows = batch * n_samples;

        let prior = match (&self.prior, h_gen) {
            (Some(heads), Some(h)) => heads.forward(h)?,
            (None, _) => Normal::standard(rows, self.n_variables, self.posterior_mean.weight())?,
            (Some(_), None) => {
                return Err(ModelError::MissingState(
                    "generative input for a conditional prior",
                ))
            }
        };
        if prior.rows()? != rows {
            return Err(ModelError::Shape(format!(
                "prior has {} rows, expected {} x {} samples",
                prior.rows()?,
                batch,
                n_samples
            )));
        }

        let z = if gen {
            prior.sample()?
        } else {
            let posterior = self.require_posterior()?;
            if posterior.rows()? != batch {
                return Err(ModelError::Shape(format!(
                    "posterior batch {} differs from requested batch {}",
                    posterior.rows()?,
                    batch
                )));
            }
            posterior.expand_samples(n_samples)?.sample()?
        };

        self.state.prior = Some(prior);
        self.state.sample = Some(z.clone());
        self.state.n_samples = n_samples;
        Ok(z)
    }

    /// Posterior `(mean, log_var)`, each `(n, k)`
    pub fn approx_posterior_parameters(&self) -> Result<[Tensor; 2]> {
        let posterior = self.require_posterior()?;
        Ok([posterior.mean().clone(), posterior.log_var().clone()])
    }

    /// Loss gradients w.r.t. the posterior `(mean, log_var)`; zeros until
    /// `record_gradients` has seen a backward pass
    pub fn approx_posterior_gradients(&self) -> Result<[Tensor; 2]> {
        match &self.state.posterior_gradients {
            Some((d_mean, d_log_var)) => Ok([d_mean.clone(), d_log_var.clone()]),
            None => {
                let posterior = self.require_posterior()?;
                Ok([
                    posterior.mean().zeros_like()?,
                    posterior.log_var().zeros_like()?,
                ])
            }
        }
    }

    /// Keep the gradients of the current posterior parameters
    pub fn record_gradients(&mut self, grads: &GradStore) -> Result<()> {
        let Some((tap_mean, tap_log_var)) = self.state.taps.as_ref() else {
            return Ok(());
        };
        let take = |t: &Tensor| -> Result<Tensor> {
            match grads.get(t) {
                Some(g) => Ok(g.detach()),
                None => Ok(t.zeros_like()?),
            }
        };
        let d_mean = take(tap_mean.as_tensor())?;
        let d_log_var = take(tap_log_var.as_tensor())?;
        self.state.posterior_gradients = Some((d_mean, d_log_var));
        Ok(())
    }

    /// Prior-normalized error of the latest sample, averaged over samples:
    /// `(z - μ_p) / exp(lnσ²_p + 1e-7)`, `(n, k)`, detached; zeros until a
    /// sample has been drawn since the last `re_init`
    pub fn error(&self) -> Result<Tensor> {
        let Some(z) = self.state.sample.as_ref() else {
            return Ok(self.require_posterior()?.mean().zeros_like()?.detach());
        };
        let prior = self.require_prior()?;
        let scale = (prior.log_var().detach() + 1e-7)?.exp()?;
        let err = (z.detach() - prior.mean().detach())?.div(&scale)?;
        average_samples(&err, self.state.n_samples.max(1))
    }

    /// Monte Carlo average over samples of KL(q || p), `(n,)`
    pub fn kl_divergence(&self) -> Result<Tensor> {
        let n_samples = self.state.n_samples.max(1);
        let posterior = self.require_posterior()?.expand_samples(n_samples)?;
        let prior = self.require_prior()?;
        let kl = posterior.kl_divergence(prior)?;
        let rows = kl.dim(0)?;
        Ok(kl.reshape((rows / n_samples, n_samples))?.mean(1)?)
    }

    /// Reset the posterior to the latest (detached) prior and forget samples
    /// and gradients
    pub fn re_init(&mut self) -> Result<()> {
        let prior = self.require_prior()?.detach();
        let n_samples = self.state.n_samples.max(1);
        let mean = average_samples(prior.mean(), n_samples)?;
        let log_var = average_samples(prior.log_var(), n_samples)?;
        self.state.posterior = Some(Normal::new(mean, log_var));
        self.state.taps = None;
        self.state.sample = None;
        self.state.posterior_gradients = None;
        Ok(())
    }
}

/// A latent level with fully connected inference and generative networks
pub struct FullyConnectedLatentLevel {
    index: usize,
    inference: FullyConnectedNetwork,
    generative: Option<FullyConnectedNetwork>,
    latent: GaussianLatent,
}

impl FullyConnectedLatentLevel {
    /// Variables are created under `inference.level.{index}` and
    /// `generative.level.{index}` of the given builders' roots.
    pub fn new(
        index: usize,
        config: &LevelConfig,
        vb_inf: VarBuilder,
        vb_gen: VarBuilder,
    ) -> Result<Self> {
        let inference = FullyConnectedNetwork::new(&config.inference, vb_inf.pp("net"))?;

        let generative = match config.generative.as_ref() {
            Some(gen_config) => Some(FullyConnectedNetwork::new(gen_config, vb_gen.pp("net"))?),
            None => None,
        };

        let latent = GaussianLatent::new(
            config.n_latent,
            inference.n_out(),
            generative.as_ref().map(|net| net.n_out()),
            config.constant_prior_variances,
            config.variable_update_form,
            vb_inf,
            vb_gen,
        )?;

        Ok(Self {
            index,
            inference,
            generative,
            latent,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn latent(&self) -> &GaussianLatent {
        &self.latent
    }

    pub fn latent_mut(&mut self) -> &mut GaussianLatent {
        &mut self.latent
    }

    /// Width of the encoding handed to the level above
    pub fn n_encoding_out(&self) -> usize {
        self.inference.n_out()
    }

    /// Update q(z|·) from the encoding below; returns the encoding for the
    /// level above
    pub fn infer(&mut self, encoding: &Tensor, train: bool) -> Result<Tensor> {
        let (h, update) = self.propose(encoding, train)?;
        self.latent.commit(update);
        Ok(h)
    }

    /// Like `infer`, but returns the posterior instead of installing it
    pub fn propose(&self, encoding: &Tensor, train: bool) -> Result<(Tensor, PosteriorUpdate)> {
        let h = self.inference.forward_t(encoding, train)?;
        let update = self.latent.propose(&h)?;
        Ok((h, update))
    }

    /// Run the generative network on the decoding from above (a constant
    /// input at a learned top prior) and draw this level's latent sample,
    /// which is the decoding handed to the level below.
    pub fn generate(
        &mut self,
        decoding: Option<&Tensor>,
        batch: usize,
        gen: bool,
        n_samples: usize,
        train: bool,
    ) -> Result<Tensor> {
        let h_gen = match (&self.generative, decoding) {
            (Some(net), Some(z_above)) => Some(net.forward_t(z_above, train)?),
            (Some(net), None) => {
                let anchor = self.latent.posterior_mean.weight();
                let top = Tensor::ones(
                    (batch * n_samples, net.n_in()),
                    anchor.dtype(),
                    anchor.device(),
                )?;
                Some(net.forward_t(&top, train)?)
            }
            (None, None) => None,
            (None, Some(_)) => {
                return Err(ModelError::Shape(format!(
                    "level {} has a fixed prior but received a decoding from above",
                    self.index
                )))
            }
        };
        self.latent.generate(h_gen.as_ref(), batch, gen, n_samples)
    }

    pub fn inference_parameters(&self, varmap: &VarMap) -> Result<Vec<Var>> {
        vars_with_prefix(varmap, &format!("inference.level.{}.", self.index))
    }

    pub fn generative_parameters(&self, varmap: &VarMap) -> Result<Vec<Var>> {
        vars_with_prefix(varmap, &format!("generative.level.{}.", self.index))
    }
}
