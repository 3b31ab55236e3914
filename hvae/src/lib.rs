pub mod candle_data_loader;
pub mod candle_data_loader_util;
pub mod candle_distributions;
pub mod candle_inference;
pub mod candle_latent_level;
pub mod candle_layers;
pub mod candle_loss_functions;
pub mod candle_model;
pub mod cli;
pub mod config;
pub mod error;

pub use candle_core;
pub use candle_nn;

pub use candle_model::{FullyConnectedModel, Generation};
pub use config::ModelConfig;
pub use error::{ModelError, Result};
