pub mod fit;
pub mod io;
pub mod sample;

use clap::{Parser, Subcommand};

pub use fit::FitArgs;
pub use sample::SampleArgs;

#[derive(Parser)]
#[command(name = "hvae")]
#[command(about = "Hierarchical variational autoencoders with iterative inference")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a model on a whitespace-separated data matrix
    Fit(FitArgs),
    /// Draw observations from the prior of a (trained) model
    Sample(SampleArgs),
}
