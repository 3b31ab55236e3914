use candle_core::{Result, Tensor, D};
use candle_nn::{ops, BatchNorm, Dropout, Linear, Module, ModuleT, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::config::NetworkConfig;

const SELU_ALPHA: f64 = 1.6732632423543772;
const SELU_SCALE: f64 = 1.0507009873554805;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NonLinearity {
    Linear,
    Relu,
    LeakyRelu,
    Elu,
    Selu,
    Tanh,
    Sigmoid,
    Softplus,
}

impl Module for NonLinearity {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            NonLinearity::Linear => Ok(x.clone()),
            NonLinearity::Relu => x.relu(),
            NonLinearity::LeakyRelu => ops::leaky_relu(x, 0.01),
            NonLinearity::Elu => x.elu(1.0),
            NonLinearity::Selu => x.elu(SELU_ALPHA)? * SELU_SCALE,
            NonLinearity::Tanh => x.tanh(),
            NonLinearity::Sigmoid => ops::sigmoid(x),
            NonLinearity::Softplus => softplus(x),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Sequential,
    Residual,
    Highway,
}

/// log(1 + exp(x)) = max(x, 0) + log(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    x.relu()? + tail
}

/// Normalize each row to zero mean and unit variance (no learned scale)
pub fn layer_normalize(x: &Tensor) -> Result<Tensor> {
    let eps = 1e-5;
    let centered = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    centered.broadcast_div(&(var + eps)?.sqrt()?)
}

/////////////////////////////
// Weight-normalized linear //
/////////////////////////////

/// `y = x (g * v / ||v||)^T + b`, the norm taken over each output row
pub struct WeightNormLinear {
    weight_v: Tensor,
    weight_g: Tensor,
    bias: Tensor,
}

impl WeightNormLinear {
    /// Creates `weight_v` `(n_out, n_in)`, `weight_g` `(n_out, 1)` and
    /// `bias` `(n_out,)` under `vb`
    pub fn new(n_in: usize, n_out: usize, vb: VarBuilder) -> Result<Self> {
        let weight_v = vb.get_with_hints(
            (n_out, n_in),
            "weight_v",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let weight_g = vb.get_with_hints((n_out, 1), "weight_g", candle_nn::Init::Const(1.))?;
        let bias = vb.get_with_hints(n_out, "bias", candle_nn::Init::Const(0.))?;
        Ok(Self {
            weight_v,
            weight_g,
            bias,
        })
    }

    /// The effective `(n_out, n_in)` weight
    pub fn weight(&self) -> Result<Tensor> {
        let norm = (self.weight_v.sqr()?.sum_keepdim(1)? + 1e-12)?.sqrt()?;
        self.weight_v.broadcast_mul(&self.weight_g.broadcast_div(&norm)?)
    }
}

impl Module for WeightNormLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.matmul(&self.weight()?.t()?)?.broadcast_add(&self.bias)
    }
}

enum LayerLinear {
    Plain(Linear),
    WeightNorm(WeightNormLinear),
}

impl Module for LayerLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            LayerLinear::Plain(linear) => linear.forward(x),
            LayerLinear::WeightNorm(linear) => linear.forward(x),
        }
    }
}

////////////////////////////
// Fully connected layer //
////////////////////////////

/// linear -> (batch norm) -> non-linearity -> (dropout)
pub struct FullyConnectedLayer {
    linear: LayerLinear,
    batch_norm: Option<BatchNorm>,
    non_linearity: NonLinearity,
    dropout: Option<Dropout>,
}

impl ModuleT for FullyConnectedLayer {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = self.linear.forward(x)?;
        if let Some(bn) = &self.batch_norm {
            h = bn.forward_t(&h, train)?;
        }
        h = self.non_linearity.forward(&h)?;
        match &self.dropout {
            Some(dropout) => dropout.forward_t(&h, train),
            None => Ok(h),
        }
    }
}

/// Creates these variables under `vb`:
/// * `linear.weight`, `linear.bias`, or `linear.{weight_v,weight_g,bias}`
///   if `weight_norm`
/// * `bn.{weight,bias,running_mean,running_var}` if `batch_norm`
pub fn fully_connected_layer(
    n_in: usize,
    n_out: usize,
    non_linearity: NonLinearity,
    batch_norm: bool,
    weight_norm: bool,
    dropout: f64,
    vb: VarBuilder,
) -> Result<FullyConnectedLayer> {
    let linear = if weight_norm {
        LayerLinear::WeightNorm(WeightNormLinear::new(n_in, n_out, vb.pp("linear"))?)
    } else {
        LayerLinear::Plain(candle_nn::linear(n_in, n_out, vb.pp("linear"))?)
    };

    let batch_norm = if batch_norm {
        let bn_config = candle_nn::BatchNormConfig {
            eps: 1e-4,
            remove_mean: true,
            affine: true,
            momentum: 0.1,
        };
        Some(candle_nn::batch_norm(n_out, bn_config, vb.pp("bn"))?)
    } else {
        None
    };

    let dropout = (dropout > 0.0).then(|| Dropout::new(dropout as f32));

    Ok(FullyConnectedLayer {
        linear,
        batch_norm,
        non_linearity,
        dropout,
    })
}

//////////////////////////////
// Fully connected network //
//////////////////////////////

/// A stack of fully connected layers wired by `ConnectionType`
///
/// * sequential: `x <- f(x)`
/// * residual: `x <- f(x) + s(x)`
/// * highway: `x <- g(x) * f(x) + (1 - g(x)) * s(x)`, `g = sigmoid(W x)`
///
/// where `s` is the identity, or a learned projection when the layer
/// changes the width.
pub struct FullyConnectedNetwork {
    n_in: usize,
    n_out: usize,
    connection_type: ConnectionType,
    layers: Vec<FullyConnectedLayer>,
    shortcuts: Vec<Option<Linear>>,
    gates: Vec<Option<Linear>>,
}

impl FullyConnectedNetwork {
    /// Will create a network with these variables:
    /// * `fc.{j}.linear.*` (and `fc.{j}.bn.*`) for each layer `j`
    /// * `shortcut.{j}.*` where layer `j` changes width (residual, highway)
    /// * `gate.{j}.*` for highway connectivity
    pub fn new(config: &NetworkConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.n_layers);
        let mut shortcuts = Vec::with_capacity(config.n_layers);
        let mut gates = Vec::with_capacity(config.n_layers);

        let mut prev_dim = config.n_in;
        for j in 0..config.n_layers {
            let next_dim = config.n_units;
            layers.push(fully_connected_layer(
                prev_dim,
                next_dim,
                config.non_linearity,
                config.batch_norm,
                config.weight_norm,
                config.dropout,
                vb.pp(format!("fc.{}", j)),
            )?);

            let needs_skip = config.connection_type != ConnectionType::Sequential;
            shortcuts.push(if needs_skip && prev_dim != next_dim {
                Some(candle_nn::linear_no_bias(
                    prev_dim,
                    next_dim,
                    vb.pp(format!("shortcut.{}", j)),
                )?)
            } else {
                None
            });

            gates.push(if config.connection_type == ConnectionType::Highway {
                Some(candle_nn::linear(
                    prev_dim,
                    next_dim,
                    vb.pp(format!("gate.{}", j)),
                )?)
            } else {
                None
            });

            prev_dim = next_dim;
        }

        Ok(Self {
            n_in: config.n_in,
            n_out: prev_dim,
            connection_type: config.connection_type,
            layers,
            shortcuts,
            gates,
        })
    }

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    pub fn n_out(&self) -> usize {
        self.n_out
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    fn shortcut(&self, j: usize, x: &Tensor) -> Result<Tensor> {
        match &self.shortcuts[j] {
            Some(proj) => proj.forward(x),
            None => Ok(x.clone()),
        }
    }
}

impl ModuleT for FullyConnectedNetwork {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for (j, layer) in self.layers.iter().enumerate() {
            let h = layer.forward_t(&x, train)?;
            x = match self.connection_type {
                ConnectionType::Sequential => h,
                ConnectionType::Residual => (h + self.shortcut(j, &x)?)?,
                ConnectionType::Highway => {
                    let gate = match &self.gates[j] {
                        Some(gate) => ops::sigmoid(&gate.forward(&x)?)?,
                        None => candle_core::bail!("highway layer {} without a gate", j),
                    };
                    let carry = (gate.affine(-1., 1.)? * self.shortcut(j, &x)?)?;
                    ((gate * h)? + carry)?
                }
            };
        }
        Ok(x)
    }
}
