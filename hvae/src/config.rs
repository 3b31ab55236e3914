//! Model and training configuration.
//!
//! The file format follows two nested records, `train_config` and `arch`.
//! `arch` keeps per-level settings as parallel lists: inference lists carry
//! one entry per level, generative lists carry one extra entry. Generative
//! entry `0` configures the output network and entry `i + 1` the generative
//! network of level `i`. [`ArchConfig::levels`] resolves that offset once
//! and hands out validated per-level records.

use crate::candle_distributions::Family;
use crate::candle_layers::{ConnectionType, NonLinearity};
use crate::config_bail;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EncodingForm {
    Observation,
    Gradient,
    Error,
}

/// How a new inference pass revises the approximate posterior
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VariableUpdateForm {
    /// the heads' output replaces the posterior
    Direct,
    /// `g * old + (1 - g) * new` with learned sigmoid gates
    Gated,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ModelConfig {
    #[serde(default)]
    pub train_config: TrainConfig,
    #[serde(default)]
    pub arch: ArchConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    /// Monte Carlo samples per observation
    pub n_samples: usize,
    /// inference iterations per minibatch
    pub n_iterations: usize,
    pub output_distribution: Family,
    pub encoder_optimizer: OptimizerKind,
    pub decoder_optimizer: OptimizerKind,
    pub encoder_learning_rate: f64,
    pub decoder_learning_rate: f64,
    /// decoder step on the mean of the iterations' gradients instead of
    /// the last iteration's
    pub average_gradient: bool,
    /// one decoder step every this many minibatches
    pub encoder_decoder_train_multiple: usize,
    /// free bits per level
    pub kl_min: f64,
    pub kl_warm_up: bool,
    pub kl_warm_up_steps: usize,
    pub cuda_device: Option<usize>,
    pub display_iter: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            n_samples: 1,
            n_iterations: 1,
            output_distribution: Family::Bernoulli,
            encoder_optimizer: OptimizerKind::Adam,
            decoder_optimizer: OptimizerKind::Adam,
            encoder_learning_rate: 2e-4,
            decoder_learning_rate: 2e-4,
            average_gradient: true,
            encoder_decoder_train_multiple: 1,
            kl_min: 0.0,
            kl_warm_up: false,
            kl_warm_up_steps: 1000,
            cuda_device: None,
            display_iter: 50,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ArchConfig {
    /// observation width
    pub n_input: usize,
    pub inference_input_form: Vec<EncodingForm>,
    pub variable_update_form: VariableUpdateForm,
    /// learned constant output log-variance instead of a head (Normal output)
    pub constant_variances_gen: bool,
    /// learned constant prior log-variance instead of a head
    pub constant_prior_variances: bool,
    /// top prior from a learned network over a constant input
    pub learn_top_prior: bool,
    pub top_size: usize,

    pub n_latent: Vec<usize>,

    pub n_layers_inf: Vec<usize>,
    pub n_layers_gen: Vec<usize>,

    pub n_units_inf: Vec<usize>,
    pub n_units_gen: Vec<usize>,

    pub non_linearity_inf: NonLinearity,
    pub non_linearity_gen: NonLinearity,

    pub connection_type_inf: ConnectionType,
    pub connection_type_gen: ConnectionType,

    pub batch_norm_inf: bool,
    pub batch_norm_gen: bool,

    pub weight_norm_inf: bool,
    pub weight_norm_gen: bool,

    pub dropout_inf: f64,
    pub dropout_gen: f64,
}

impl Default for ArchConfig {
    fn default() -> Self {
        Self {
            n_input: 784,
            inference_input_form: vec![EncodingForm::Observation],
            variable_update_form: VariableUpdateForm::Direct,
            constant_variances_gen: false,
            constant_prior_variances: false,
            learn_top_prior: false,
            top_size: 1,
            n_latent: vec![64],
            n_layers_inf: vec![2],
            n_layers_gen: vec![2, 1],
            n_units_inf: vec![512],
            n_units_gen: vec![512, 1],
            non_linearity_inf: NonLinearity::Elu,
            non_linearity_gen: NonLinearity::Elu,
            connection_type_inf: ConnectionType::Highway,
            connection_type_gen: ConnectionType::Sequential,
            batch_norm_inf: false,
            batch_norm_gen: false,
            weight_norm_inf: false,
            weight_norm_gen: false,
            dropout_inf: 0.0,
            dropout_gen: 0.0,
        }
    }
}

/// Shape and style of one fully-connected network
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkConfig {
    pub n_in: usize,
    pub n_units: usize,
    pub n_layers: usize,
    pub non_linearity: NonLinearity,
    pub connection_type: ConnectionType,
    pub batch_norm: bool,
    pub weight_norm: bool,
    pub dropout: f64,
}

impl NetworkConfig {
    /// output width; a network without layers passes its input through
    pub fn n_out(&self) -> usize {
        if self.n_layers == 0 {
            self.n_in
        } else {
            self.n_units
        }
    }

    pub fn validate(&self, what: &str) -> Result<()> {
        if self.n_in == 0 {
            config_bail!("{}: input width must be positive", what);
        }
        if self.n_layers > 0 && self.n_units == 0 {
            config_bail!(
                "{}: {} layers requested with zero units",
                what,
                self.n_layers
            );
        }
        if !(0.0..1.0).contains(&self.dropout) {
            config_bail!("{}: dropout {} outside [0, 1)", what, self.dropout);
        }
        Ok(())
    }
}

/// Everything one latent level needs, resolved from the parallel lists
#[derive(Clone, Debug, PartialEq)]
pub struct LevelConfig {
    pub n_latent: usize,
    pub inference: NetworkConfig,
    /// `None` for a top level with a fixed N(0, I) prior
    pub generative: Option<NetworkConfig>,
    pub constant_prior_variances: bool,
    pub variable_update_form: VariableUpdateForm,
}

impl ArchConfig {
    pub fn n_levels(&self) -> usize {
        self.n_latent.len()
    }

    fn check_lengths(&self) -> Result<()> {
        let n_levels = self.n_levels();
        if n_levels == 0 {
            config_bail!("n_latent must name at least one level");
        }
        if let Some(lv) = self.n_latent.iter().position(|&k| k == 0) {
            config_bail!("n_latent[{}] must be positive", lv);
        }

        let inf_lists = [
            ("n_layers_inf", self.n_layers_inf.len()),
            ("n_units_inf", self.n_units_inf.len()),
        ];
        for (name, len) in inf_lists {
            if len != n_levels {
                config_bail!(
                    "{} has {} entries, expected one per level ({})",
                    name,
                    len,
                    n_levels
                );
            }
        }

        let gen_lists = [
            ("n_layers_gen", self.n_layers_gen.len()),
            ("n_units_gen", self.n_units_gen.len()),
        ];
        for (name, len) in gen_lists {
            if len != n_levels + 1 {
                config_bail!(
                    "{} has {} entries, expected one per level plus the top ({})",
                    name,
                    len,
                    n_levels + 1
                );
            }
        }

        if self.learn_top_prior && self.top_size == 0 {
            config_bail!("learn_top_prior requires a positive top_size");
        }
        Ok(())
    }

    fn check_encoding_form(&self) -> Result<()> {
        if self.inference_input_form.is_empty() {
            config_bail!("inference_input_form must contain at least one mode");
        }
        for (j, form) in self.inference_input_form.iter().enumerate() {
            if self.inference_input_form[..j].contains(form) {
                config_bail!("inference_input_form repeats {:?}", form);
            }
        }
        Ok(())
    }

    pub fn uses_form(&self, form: EncodingForm) -> bool {
        self.inference_input_form.contains(&form)
    }

    /// Width of the bottom-level encoding: the sum over active modes
    /// * observation: `n_input`
    /// * gradient: `4 * n_latent[0]` (two gradients, two parameters)
    /// * error: `n_input + 3 * n_latent[0]`
    pub fn encoding_width(&self) -> usize {
        let k0 = self.n_latent.first().copied().unwrap_or(0);
        let mut width = 0;
        if self.uses_form(EncodingForm::Observation) {
            width += self.n_input;
        }
        if self.uses_form(EncodingForm::Gradient) {
            width += 4 * k0;
        }
        if self.uses_form(EncodingForm::Error) {
            width += self.n_input + 3 * k0;
        }
        width
    }

    fn inference_network(&self, lv: usize, n_in: usize) -> NetworkConfig {
        NetworkConfig {
            n_in,
            n_units: self.n_units_inf[lv],
            n_layers: self.n_layers_inf[lv],
            non_linearity: self.non_linearity_inf,
            connection_type: self.connection_type_inf,
            batch_norm: self.batch_norm_inf,
            weight_norm: self.weight_norm_inf,
            dropout: self.dropout_inf,
        }
    }

    /// generative network at list position `gen_idx` (0 = output network)
    fn generative_network(&self, gen_idx: usize, n_in: usize) -> NetworkConfig {
        NetworkConfig {
            n_in,
            n_units: self.n_units_gen[gen_idx],
            n_layers: self.n_layers_gen[gen_idx],
            non_linearity: self.non_linearity_gen,
            connection_type: self.connection_type_gen,
            batch_norm: self.batch_norm_gen,
            weight_norm: self.weight_norm_gen,
            dropout: self.dropout_gen,
        }
    }

    /// Resolve and validate per-level records, bottom level first.
    pub fn levels(&self) -> Result<Vec<LevelConfig>> {
        self.check_lengths()?;
        self.check_encoding_form()?;
        if self.n_input == 0 {
            config_bail!("n_input must be positive");
        }

        let n_levels = self.n_levels();
        let mut ret = Vec::with_capacity(n_levels);
        let mut n_in = self.encoding_width();

        for lv in 0..n_levels {
            let inference = self.inference_network(lv, n_in);
            inference.validate(&format!("level {} inference", lv))?;
            n_in = inference.n_out();

            let is_top = lv + 1 == n_levels;
            let generative = if !is_top {
                Some(self.generative_network(lv + 1, self.n_latent[lv + 1]))
            } else if self.learn_top_prior {
                Some(self.generative_network(lv + 1, self.top_size))
            } else {
                None
            };
            if let Some(generative) = generative.as_ref() {
                generative.validate(&format!("level {} generative", lv))?;
            }

            ret.push(LevelConfig {
                n_latent: self.n_latent[lv],
                inference,
                generative,
                constant_prior_variances: self.constant_prior_variances,
                variable_update_form: self.variable_update_form,
            });
        }
        Ok(ret)
    }

    /// The network mapping the bottom latent sample to the output heads
    pub fn output_network(&self) -> Result<NetworkConfig> {
        self.check_lengths()?;
        let ret = self.generative_network(0, self.n_latent[0]);
        ret.validate("output")?;
        Ok(ret)
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("n_samples", self.n_samples),
            ("n_iterations", self.n_iterations),
            (
                "encoder_decoder_train_multiple",
                self.encoder_decoder_train_multiple,
            ),
        ];
        for (name, val) in positive {
            if val == 0 {
                config_bail!("{} must be positive", name);
            }
        }
        let rates = [
            ("encoder_learning_rate", self.encoder_learning_rate),
            ("decoder_learning_rate", self.decoder_learning_rate),
        ];
        for (name, lr) in rates {
            if !(lr > 0.0 && lr.is_finite()) {
                config_bail!("{} must be a positive number, got {}", name, lr);
            }
        }
        if !(self.kl_min >= 0.0) {
            config_bail!("kl_min must be a non-negative number, got {}", self.kl_min);
        }
        Ok(())
    }

    /// `cuda_device` if a CUDA build can open it, the CPU otherwise
    pub fn device(&self) -> Result<candle_core::Device> {
        match self.cuda_device {
            Some(ordinal) => Ok(candle_core::Device::cuda_if_available(ordinal)?),
            None => Ok(candle_core::Device::Cpu),
        }
    }

    /// KL weight for a training step under linear warm-up
    pub fn kl_weight(&self, step: usize) -> f64 {
        if self.kl_warm_up && self.kl_warm_up_steps > 0 {
            (step as f64 / self.kl_warm_up_steps as f64).min(1.0)
        } else {
            1.0
        }
    }
}

impl ModelConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let ret: Self = serde_json::from_str(json)?;
        ret.validate()?;
        Ok(ret)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks both records and the combinations between them
    pub fn validate(&self) -> Result<()> {
        self.train_config.validate()?;
        self.arch.levels()?;
        self.arch.output_network()?;

        let family = self.train_config.output_distribution;
        if self.arch.uses_form(EncodingForm::Error) && !family.supports_error_inference() {
            config_bail!(
                "the `error` inference input form needs a normal output distribution, got {}",
                family
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;

    fn two_level_arch() -> ArchConfig {
        ArchConfig {
            n_input: 10,
            n_latent: vec![4, 2],
            n_layers_inf: vec![1, 1],
            n_units_inf: vec![8, 6],
            n_layers_gen: vec![1, 2, 1],
            n_units_gen: vec![8, 5, 3],
            ..Default::default()
        }
    }

    #[test]
    fn generative_lists_are_offset_by_one() -> Result<()> {
        let arch = two_level_arch();
        let levels = arch.levels()?;
        assert_eq!(levels.len(), 2);

        assert_eq!(levels[0].inference.n_in, 10);
        assert_eq!(levels[1].inference.n_in, 8);

        let gen0 = levels[0].generative.as_ref().unwrap();
        assert_eq!(gen0.n_in, 2);
        assert_eq!(gen0.n_units, 5);
        assert_eq!(gen0.n_layers, 2);

        // fixed top prior
        assert!(levels[1].generative.is_none());

        let out = arch.output_network()?;
        assert_eq!(out.n_in, 4);
        assert_eq!(out.n_units, 8);
        Ok(())
    }

    #[test]
    fn learned_top_prior_reads_top_entry() -> Result<()> {
        let arch = ArchConfig {
            learn_top_prior: true,
            top_size: 1,
            ..two_level_arch()
        };
        let levels = arch.levels()?;
        let top = levels[1].generative.as_ref().unwrap();
        assert_eq!(top.n_in, 1);
        assert_eq!(top.n_units, 3);
        Ok(())
    }

    #[test]
    fn inconsistent_lengths_fail() {
        let arch = ArchConfig {
            n_units_gen: vec![8, 5],
            ..two_level_arch()
        };
        assert!(matches!(arch.levels(), Err(ModelError::Config(_))));

        let arch = ArchConfig {
            n_layers_inf: vec![1],
            ..two_level_arch()
        };
        assert!(matches!(arch.levels(), Err(ModelError::Config(_))));
    }

    #[test]
    fn encoding_width_sums_modes() {
        let mut arch = two_level_arch();
        assert_eq!(arch.encoding_width(), 10);
        arch.inference_input_form = vec![EncodingForm::Observation, EncodingForm::Gradient];
        assert_eq!(arch.encoding_width(), 10 + 16);
        arch.inference_input_form.push(EncodingForm::Error);
        assert_eq!(arch.encoding_width(), 10 + 16 + 10 + 12);
    }

    #[test]
    fn repeated_form_fails() {
        let arch = ArchConfig {
            inference_input_form: vec![EncodingForm::Observation, EncodingForm::Observation],
            ..two_level_arch()
        };
        assert!(arch.levels().is_err());
    }

    #[test]
    fn error_form_needs_normal_output() {
        let mut config = ModelConfig {
            train_config: TrainConfig::default(),
            arch: ArchConfig {
                inference_input_form: vec![EncodingForm::Error],
                ..two_level_arch()
            },
        };
        config.train_config.output_distribution = Family::Bernoulli;
        assert!(matches!(config.validate(), Err(ModelError::Config(_))));

        config.train_config.output_distribution = Family::Normal;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_json() -> Result<()> {
        let json = r#"{
            "train_config": { "batch_size": 8, "output_distribution": "normal" },
            "arch": {
                "n_input": 12,
                "inference_input_form": ["observation", "gradient"],
                "n_latent": [3],
                "n_layers_inf": [1],
                "n_units_inf": [16],
                "n_layers_gen": [1, 0],
                "n_units_gen": [16, 0],
                "non_linearity_inf": "relu",
                "connection_type_gen": "residual"
            }
        }"#;
        let config = ModelConfig::from_json_str(json)?;
        assert_eq!(config.train_config.batch_size, 8);
        assert_eq!(config.train_config.output_distribution, Family::Normal);
        assert_eq!(config.arch.non_linearity_inf, NonLinearity::Relu);
        assert_eq!(config.arch.connection_type_gen, ConnectionType::Residual);
        assert_eq!(config.arch.encoding_width(), 12 + 12);
        Ok(())
    }

    #[test]
    fn kl_min_must_be_a_number() {
        let config = TrainConfig {
            kl_min: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ModelError::Config(_))));

        let config = TrainConfig {
            kl_min: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn update_form_and_weight_norm_reach_levels() -> Result<()> {
        let json = r#"{
            "train_config": { "average_gradient": false },
            "arch": {
                "n_input": 5,
                "variable_update_form": "gated",
                "weight_norm_inf": true,
                "n_latent": [3],
                "n_layers_inf": [1],
                "n_units_inf": [4],
                "n_layers_gen": [1, 0],
                "n_units_gen": [4, 0]
            }
        }"#;
        let config = ModelConfig::from_json_str(json)?;
        assert!(!config.train_config.average_gradient);
        assert!(TrainConfig::default().average_gradient);

        let levels = config.arch.levels()?;
        assert_eq!(levels[0].variable_update_form, VariableUpdateForm::Gated);
        assert!(levels[0].inference.weight_norm);
        assert!(!config.arch.output_network()?.weight_norm);
        Ok(())
    }

    #[test]
    fn kl_warm_up_is_linear() {
        let config = TrainConfig {
            kl_warm_up: true,
            kl_warm_up_steps: 4,
            ..Default::default()
        };
        assert_eq!(config.kl_weight(0), 0.0);
        assert_eq!(config.kl_weight(2), 0.5);
        assert_eq!(config.kl_weight(10), 1.0);
        assert_eq!(TrainConfig::default().kl_weight(0), 1.0);
    }
}
