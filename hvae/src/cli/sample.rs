use crate::candle_distributions::Distribution;
use crate::candle_model::FullyConnectedModel;
use crate::config::ModelConfig;

use super::io::{open_buf_writer, write_matrix};

use anyhow::Result;
use candle_core::DType;
use clap::Args;
use log::info;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct SampleArgs {
    #[arg(short, long, help = "Model configuration (JSON)")]
    pub config: PathBuf,

    #[arg(short, long, help = "Trained weights (.safetensors)")]
    pub weights: Option<PathBuf>,

    #[arg(short, long, default_value = "10")]
    pub n: usize,

    #[arg(long, help = "Print the output distribution's mean instead of a draw")]
    pub mean: bool,

    #[arg(short, long, default_value = "stdout")]
    pub out: String,
}

pub fn run(args: &SampleArgs) -> Result<()> {
    if args.n == 0 {
        anyhow::bail!("--n must be positive");
    }

    let config = ModelConfig::from_json_file(&args.config)?;
    let device = config.train_config.device()?;

    let mut model = FullyConnectedModel::new(&config, DType::F32, &device)?;
    match &args.weights {
        Some(weights) => {
            model.load_weights(weights)?;
            info!("loaded weights from {:?}", weights);
        }
        None => info!("no weights given; sampling an untrained model"),
    }

    model.set_train(false);
    model.set_batch_size(args.n);
    let generation = model.generate(true, 1)?;

    let x_nd = if args.mean {
        generation.output.mean()?
    } else {
        generation.sample
    };

    let mut out = open_buf_writer(&args.out)?;
    write_matrix(&x_nd, out.as_mut())
}
