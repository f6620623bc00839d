use anyhow::{bail, Context, Result};
use candle_core::Device;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::cli::commands::{EvaluateCommand, InitCommand, LoggingArgs, PredictCommand, ServeCommand};
use crate::config::{LoggingSettings, ServiceConfig};
use crate::evaluation::{evaluate, ImageFolderDataset};
use crate::inference::{predict, Preprocessor};
use crate::model::{checkpoint, NetworkConfig};
use crate::server::{start_server, state::ServerState};

/// Install the global subscriber: stderr, plus a daily rolling file when a
/// log directory is configured. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init_logging(args: &LoggingArgs, settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let level = args.get_effective_level(&settings.level);
    let directives = args
        .log_filter
        .clone()
        .or_else(|| settings.filter.clone())
        .unwrap_or_default();
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(level.parse().unwrap_or(LevelFilter::INFO).into())
            .parse_lossy(&directives)
    };

    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter());

    match &settings.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "scanserve.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter());
            tracing_subscriber::registry()
                .with(stderr)
                .with(file)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(None)
        }
    }
}

pub async fn handle_serve(mut config: ServiceConfig, cmd: ServeCommand) -> Result<()> {
    if let Some(host) = cmd.host {
        config.server.host = host;
    }
    if let Some(port) = cmd.port {
        config.server.port = port;
    }
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;

    let state = ServerState::from_config(&config)
        .await
        .context("Failed to initialise service")?;
    start_server(addr, state).await
}

pub fn handle_predict(config: &ServiceConfig, cmd: PredictCommand) -> Result<()> {
    let device = Device::Cpu;
    let snapshot = checkpoint::load_snapshot(
        &config.model.path,
        Arc::new(config.model.class_set()?),
        config.model.dropout,
        &device,
    )?;
    let preprocessor = Preprocessor::new(config.model.preprocess.clone(), device);

    let input = preprocessor
        .load(&cmd.image)
        .with_context(|| format!("Failed to read {}", cmd.image.display()))?;
    let prediction = predict(&snapshot, &input)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "file": cmd.image,
            "snapshot_version": prediction.snapshot_version,
            "predicted_class": prediction.predicted_class,
            "confidence": prediction.confidence,
            "all_confidences": prediction.confidences(snapshot.classes()),
        }))?
    );
    Ok(())
}

pub fn handle_evaluate(config: &ServiceConfig, cmd: EvaluateCommand) -> Result<()> {
    let Some(root) = cmd.dataset.or_else(|| config.evaluation.dataset.clone()) else {
        bail!("No dataset given and evaluation.dataset is not configured");
    };
    let device = Device::Cpu;
    let classes = Arc::new(config.model.class_set()?);
    let snapshot =
        checkpoint::load_snapshot(&config.model.path, Arc::clone(&classes), config.model.dropout, &device)?;
    let preprocessor = Arc::new(Preprocessor::new(config.model.preprocess.clone(), device));
    let dataset = ImageFolderDataset::open(&root, &classes, preprocessor)?;

    let batch_size = cmd.batch_size.unwrap_or(config.evaluation.batch_size);
    let report = evaluate(&snapshot, &dataset, batch_size)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub fn handle_init(config: &ServiceConfig, cmd: InitCommand) -> Result<()> {
    let output = cmd.output.unwrap_or_else(|| config.model.path.clone());
    if output.exists() && !cmd.force {
        bail!("{} already exists (use --force to replace it)", output.display());
    }

    let classes = config.model.class_set()?;
    let network = NetworkConfig {
        dropout: config.model.dropout,
        ..NetworkConfig::for_classes(classes.len())
    };
    let parameters = checkpoint::initialize(&network, &Device::Cpu)?;
    checkpoint::save_parameters(&parameters, &output)?;
    info!(
        "Wrote {} tensors for {} classes to {}",
        parameters.len(),
        classes.len(),
        output.display()
    );
    Ok(())
}
