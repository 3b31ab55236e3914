//! Training driver: minibatch steps with separate encoder and decoder
//! optimizers.

use crate::candle_data_loader::DataLoader;
use crate::candle_loss_functions::free_energy;
use crate::candle_model::FullyConnectedModel;
use crate::config::{OptimizerKind, TrainConfig};
use crate::error::{ModelError, Result};

use candle_core::backprop::GradStore;
use candle_core::{Tensor, TensorId, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use std::collections::HashMap;

/// Optimizer over one parameter partition
pub enum PathwayOptimizer {
    Adam(AdamW),
    Sgd(SGD),
}

impl PathwayOptimizer {
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, learning_rate: f64) -> Result<Self> {
        let ret = match kind {
            OptimizerKind::Adam => Self::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: learning_rate,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Sgd => Self::Sgd(SGD::new(vars, learning_rate)?),
        };
        Ok(ret)
    }

    /// Apply `grads`; variables without a gradient are left alone
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::Adam(adam) => adam.step(grads)?,
            Self::Sgd(sgd) => sgd.step(grads)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(adam) => adam.learning_rate(),
            Self::Sgd(sgd) => sgd.learning_rate(),
        }
    }
}

/// Running sum of the gradients of a fixed set of variables over several
/// backward passes
pub struct GradientSum {
    vars: Vec<Var>,
    sums: HashMap<TensorId, Tensor>,
    count: usize,
}

impl GradientSum {
    pub fn new(vars: Vec<Var>) -> Self {
        Self {
            vars,
            sums: HashMap::new(),
            count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.sums.clear();
        self.count = 0;
    }

    /// Add the gradients found in `grads`; missing ones count as zero
    pub fn add(&mut self, grads: &GradStore) -> Result<()> {
        for var in self.vars.iter() {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let g = g.detach();
            let sum = match self.sums.remove(&var.id()) {
                Some(prev) => (prev + g)?,
                None => g,
            };
            self.sums.insert(var.id(), sum);
        }
        self.count += 1;
        Ok(())
    }

    /// Replace the gradients in `grads` by the mean over the added passes
    pub fn average_into(&self, grads: &mut GradStore) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        let denom = self.count as f64;
        for var in self.vars.iter() {
            if let Some(sum) = self.sums.get(&var.id()) {
                grads.insert(var.as_tensor(), (sum / denom)?);
            }
        }
        Ok(())
    }
}

/// Scalars of the last inference iteration of a step
#[derive(Clone, Debug)]
pub struct StepSummary {
    pub free_energy: f32,
    pub log_likelihood: f32,
    pub kl: Vec<f32>,
}

pub struct Trainer {
    config: TrainConfig,
    encoder: PathwayOptimizer,
    decoder: PathwayOptimizer,
    decoder_grads: GradientSum,
    step: usize,
    pub verbose: bool,
}

impl Trainer {
    /// Optimizers over `model`'s inference and generative partitions
    pub fn new(model: &FullyConnectedModel, config: &TrainConfig) -> Result<Self> {
        config.validate()?;
        let encoder = PathwayOptimizer::new(
            config.encoder_optimizer,
            model.inference_parameters()?,
            config.encoder_learning_rate,
        )?;
        let generative = model.generative_parameters()?;
        let decoder = PathwayOptimizer::new(
            config.decoder_optimizer,
            generative.clone(),
            config.decoder_learning_rate,
        )?;
        Ok(Self {
            config: config.clone(),
            encoder,
            decoder,
            decoder_grads: GradientSum::new(generative),
            step: 0,
            verbose: false,
        })
    }

    /// Minibatches processed so far
    pub fn num_steps(&self) -> usize {
        self.step
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Train on one minibatch `x_nd`.
    ///
    /// The posterior starts from the prior (`re_init`) and is refined for
    /// `n_iterations` rounds, each ending with an encoder update. The
    /// decoder is updated once every `encoder_decoder_train_multiple`
    /// minibatches, from the gradients averaged over the rounds when
    /// `average_gradient` is set and from the last round's otherwise.
    pub fn train_step(
        &mut self,
        model: &mut FullyConnectedModel,
        x_nd: &Tensor,
    ) -> Result<StepSummary> {
        let n = x_nd.dim(0)?;
        model.set_train(true);
        model.set_batch_size(n);
        model.re_init()?;

        let kl_weight = self.config.kl_weight(self.step);
        let mut last = None;
        self.decoder_grads.clear();

        for _ in 0..self.config.n_iterations {
            model.infer(x_nd)?;
            let generation = model.generate(false, self.config.n_samples)?;
            let fe = free_energy(model, x_nd, &generation, kl_weight, self.config.kl_min)?;
            let grads = fe.loss.backward()?;
            model.record_posterior_gradients(&grads)?;
            self.encoder.step(&grads)?;
            if self.config.average_gradient {
                self.decoder_grads.add(&grads)?;
            }
            last = Some((fe, grads));
        }

        let (fe, mut grads) = last.ok_or(ModelError::config("n_iterations must be positive"))?;

        self.step += 1;
        if self.step % self.config.encoder_decoder_train_multiple == 0 {
            if self.config.average_gradient {
                self.decoder_grads.average_into(&mut grads)?;
            }
            self.decoder.step(&grads)?;
        }

        Ok(StepSummary {
            free_energy: fe.loss_value()?,
            log_likelihood: fe.reconstruction_value()?,
            kl: fe.kl_values()?,
        })
    }

    /// Train for `num_epochs` passes over `data`; returns the mean free
    /// energy of each epoch
    pub fn fit<DataL>(
        &mut self,
        model: &mut FullyConnectedModel,
        data: &mut DataL,
        num_epochs: usize,
    ) -> anyhow::Result<Vec<f32>>
    where
        DataL: DataLoader,
    {
        let device = model.device().clone();
        let pb = ProgressBar::new(num_epochs as u64);

        if self.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut trace = Vec::with_capacity(num_epochs);

        for epoch in 0..num_epochs {
            data.shuffle_minibatch(self.config.batch_size)?;
            let num_minibatches = data.num_minibatch();
            let mut free_energy_tot = 0f32;

            for b in 0..num_minibatches {
                let x_nd = data.minibatch_data(b, &device)?;
                let summary = self.train_step(model, &x_nd)?;
                free_energy_tot += summary.free_energy;

                if self.config.display_iter > 0 && self.step % self.config.display_iter == 0 {
                    info!(
                        "[step {}] free energy: {:.4}, log-likelihood: {:.4}, kl: {:?}",
                        self.step, summary.free_energy, summary.log_likelihood, summary.kl
                    );
                }
            }

            trace.push(free_energy_tot / num_minibatches.max(1) as f32);
            pb.inc(1);

            if self.verbose {
                info!(
                    "[{}] free energy: {}",
                    epoch + 1,
                    trace.last().ok_or(anyhow::anyhow!("free energy"))?
                );
            }
        }

        pb.finish_and_clear();
        model.set_train(false);
        Ok(trace)
    }
}
