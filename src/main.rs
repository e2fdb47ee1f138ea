use anyhow::Result;
use clap::Parser;
use milpa::cli::{predict, train, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => {
            train::run(args)?;
        }
        Commands::Predict(args) => {
            predict::run(args)?;
        }
    }

    Ok(())
}
