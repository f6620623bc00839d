pub mod logging;

pub use logging::LoggingArgs;

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve predictions and accept feedback over HTTP
    Serve(ServeCommand),
    /// Classify a single image file with the configured model
    Predict(PredictCommand),
    /// Score the configured model on a labeled image folder
    Evaluate(EvaluateCommand),
    /// Write a freshly initialised parameter file
    Init(InitCommand),
}

#[derive(Debug, Args)]
pub struct ServeCommand {
    /// Address to bind
    #[arg(long, env = "SCANSERVE_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "SCANSERVE_PORT")]
    pub port: Option<u16>,
}

#[derive(Debug, Args)]
pub struct PredictCommand {
    /// Image to classify
    pub image: PathBuf,
}

#[derive(Debug, Args)]
pub struct EvaluateCommand {
    /// `root/<class>/<image>` folder; defaults to the configured dataset
    pub dataset: Option<PathBuf>,

    /// Samples per forward pass
    #[arg(long)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Args)]
pub struct InitCommand {
    /// Output file; defaults to the configured model path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Replace an existing file
    #[arg(long)]
    pub force: bool,
}
