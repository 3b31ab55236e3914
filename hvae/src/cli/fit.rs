use crate::candle_data_loader::InMemoryData;
use crate::candle_inference::Trainer;
use crate::candle_model::FullyConnectedModel;
use crate::config::ModelConfig;

use super::io::{open_buf_writer, read_matrix};

use anyhow::Result;
use candle_core::DType;
use clap::Args;
use log::info;
use std::io::Write;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(help = "Data matrix, one observation per row (.gz ok)")]
    pub data: PathBuf,

    #[arg(short, long, help = "Model configuration (JSON)")]
    pub config: PathBuf,

    #[arg(
        short,
        long,
        help = "Output prefix (creates {out}.safetensors and {out}.trace.tsv)"
    )]
    pub out: String,

    #[arg(long, default_value = "100")]
    pub epochs: usize,

    #[arg(long, help = "Start from previously saved weights")]
    pub weights: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

pub fn run(args: &FitArgs) -> Result<()> {
    let config = ModelConfig::from_json_file(&args.config)?;
    let device = config.train_config.device()?;
    info!("device: {:?}", device);

    let x_nd = read_matrix(&args.data, &device)?;
    info!("data: {:?} from {:?}", x_nd.dims(), args.data);

    let mut model = FullyConnectedModel::new(&config, DType::F32, &device)?;
    if let Some(weights) = &args.weights {
        model.load_weights(weights)?;
        info!("loaded weights from {:?}", weights);
    }

    let mut trainer = Trainer::new(&model, &config.train_config)?;
    trainer.verbose = args.verbose;

    let mut data = InMemoryData::from_tensor(&x_nd)?;
    let trace = trainer.fit(&mut model, &mut data, args.epochs)?;

    let weights_file = format!("{}.safetensors", args.out);
    model.save_weights(&weights_file)?;
    info!("saved weights to {}", weights_file);

    let trace_file = format!("{}.trace.tsv", args.out);
    let mut out = open_buf_writer(&trace_file)?;
    writeln!(out, "epoch\tfree_energy")?;
    for (epoch, fe) in trace.iter().enumerate() {
        writeln!(out, "{}\t{}", epoch + 1, fe)?;
    }
    out.flush()?;
    info!("saved trace to {}", trace_file);

    Ok(())
}
