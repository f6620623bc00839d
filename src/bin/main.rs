//! scanserve binary.
//!
//! Entry point for the scan classification service: serves predictions over
//! HTTP and folds user feedback into the live model.

use anyhow::Result;
use clap::Parser;
use scanserve_core::{
    cli::commands::{Commands, LoggingArgs},
    cli::handlers::{handle_evaluate, handle_init, handle_predict, handle_serve, init_logging},
    config::{ConfigArgs, ServiceConfig},
};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ServiceConfig::load(&cli.config)?;
    let _guard = init_logging(&cli.logging, &config.logging)?;

    info!("scanserve {} starting up", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Serve(cmd) => handle_serve(config, cmd).await?,
        Commands::Predict(cmd) => handle_predict(&config, cmd)?,
        Commands::Evaluate(cmd) => {
            tokio::task::spawn_blocking(move || handle_evaluate(&config, cmd)).await??
        }
        Commands::Init(cmd) => handle_init(&config, cmd)?,
    }

    Ok(())
}
