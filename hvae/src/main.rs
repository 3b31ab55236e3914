use anyhow::Result;
use clap::Parser;
use hvae::cli::{fit, sample, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Fit(args) => {
            fit::run(args)?;
        }
        Commands::Sample(args) => {
            sample::run(args)?;
        }
    }

    Ok(())
}
