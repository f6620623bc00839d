//! Configuration management for the scanserve service.
//!
//! Sources, in increasing order of precedence:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/scanserve/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (`SCANSERVE__<SECTION>__<KEY>`, e.g.
//!    `SCANSERVE__SERVER__PORT=9000`)
//! 5. Command-line arguments

use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::classes::{ClassSet, DEFAULT_CLASS_NAMES};
use crate::error::{Error, Result};
use crate::inference::{PreprocessConfig, MAX_IMAGE_SIZE};
use crate::training::{FineTuneConfig, PersistPolicy};

/// Command-line overrides shared by every subcommand
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, env = "SCANSERVE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Model parameter file (safetensors)
    #[arg(long, global = true)]
    pub model: Option<PathBuf>,

    /// Directory for prediction records and uploaded images
    #[arg(long, global = true)]
    pub archive_dir: Option<PathBuf>,

    /// Labeled image folder used for evaluation
    #[arg(long, global = true)]
    pub eval_dataset: Option<PathBuf>,

    /// Fine-tune learning rate
    #[arg(long, global = true)]
    pub learning_rate: Option<f64>,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub persist: PersistSettings,
    #[serde(default)]
    pub fine_tune: FineTuneConfig,
    #[serde(default)]
    pub evaluation: EvaluationSettings,
    #[serde(default)]
    pub archive: ArchiveSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Largest accepted request body; images arrive base64-encoded
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// Allowed CORS origins; empty disables the CORS layer
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Fine-tune statuses remembered for `GET /feedback/:id`
    #[serde(default = "default_status_capacity")]
    pub status_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            body_limit_bytes: default_body_limit(),
            cors_origins: Vec::new(),
            status_capacity: default_status_capacity(),
        }
    }
}

/// Model location and architecture options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_model_path")]
    pub path: PathBuf,
    /// Class names in output order
    #[serde(default = "default_classes")]
    pub classes: Vec<String>,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            classes: default_classes(),
            dropout: default_dropout(),
            preprocess: PreprocessConfig::default(),
        }
    }
}

impl ModelSettings {
    pub fn class_set(&self) -> Result<ClassSet> {
        ClassSet::new(self.classes.iter().cloned())
    }
}

/// Where committed snapshots are written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub policy: PersistPolicy,
    /// Target file; defaults to the model path
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Versioned files kept on disk, 0 for unlimited
    #[serde(default)]
    pub max_versions: usize,
}

impl Default for PersistSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: PersistPolicy::default(),
            path: None,
            max_versions: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSettings {
    /// `root/<class>/<image>` folder
    #[serde(default)]
    pub dataset: Option<PathBuf>,
    #[serde(default = "default_eval_batch_size")]
    pub batch_size: usize,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            dataset: None,
            batch_size: default_eval_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveSettings {
    /// Records are kept in memory when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Full `EnvFilter` directive, takes precedence over `level`
    #[serde(default)]
    pub filter: Option<String>,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
            directory: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/scanserve/config.toml").required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SCANSERVE")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ServiceConfig = builder.build()?.try_deserialize()?;
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    fn apply_args(&mut self, args: &ConfigArgs) {
        if let Some(model) = &args.model {
            self.model.path = model.clone();
        }
        if let Some(dir) = &args.archive_dir {
            self.archive.directory = Some(dir.clone());
        }
        if let Some(dataset) = &args.eval_dataset {
            self.evaluation.dataset = Some(dataset.clone());
        }
        if let Some(lr) = args.learning_rate {
            self.fine_tune.learning_rate = lr;
        }
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        self.model.class_set()?;
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(Error::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.model.dropout
            )));
        }
        let image_size = self.model.preprocess.image_size;
        if !(1..=MAX_IMAGE_SIZE).contains(&image_size) {
            return Err(Error::Config(format!(
                "image_size must be in 1..={}, got {}",
                MAX_IMAGE_SIZE, image_size
            )));
        }
        if self.evaluation.batch_size == 0 {
            return Err(Error::Config("evaluation batch_size must be at least 1".into()));
        }
        self.fine_tune.validate()
    }

    /// File committed snapshots are persisted to
    pub fn persist_path(&self) -> PathBuf {
        self.persist
            .path
            .clone()
            .unwrap_or_else(|| self.model.path.clone())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_body_limit() -> usize {
    16 * 1024 * 1024
}

fn default_status_capacity() -> usize {
    1024
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/model.safetensors")
}

fn default_classes() -> Vec<String> {
    DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_dropout() -> f32 {
    0.2
}

fn default_true() -> bool {
    true
}

fn default_eval_batch_size() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::OptimizerKind;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = ServiceConfig::load(&ConfigArgs::default()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.body_limit_bytes, 16 * 1024 * 1024);
        assert_eq!(config.model.classes.len(), 4);
        assert_eq!(config.model.preprocess.image_size, 224);
        assert_eq!(config.fine_tune.learning_rate, 5e-5);
        assert_eq!(config.fine_tune.optimizer, OptimizerKind::Adam);
        assert!(!config.fine_tune.update_norm_statistics);
        assert!(!config.fine_tune.evaluate_after_commit);
        assert_eq!(config.persist.policy, PersistPolicy::Overwrite);
        assert_eq!(config.persist_path(), PathBuf::from("models/model.safetensors"));
    }

    #[test]
    fn test_user_file_and_args_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[fine_tune]\noptimizer = \"sgd\"\n\n[persist]\npolicy = \"versioned\"\npath = \"out/m.safetensors\""
        )
        .unwrap();

        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            model: Some(PathBuf::from("elsewhere.safetensors")),
            learning_rate: Some(1e-5),
            ..Default::default()
        };
        let config = ServiceConfig::load(&args).unwrap();
        assert_eq!(config.fine_tune.optimizer, OptimizerKind::Sgd);
        assert_eq!(config.fine_tune.learning_rate, 1e-5);
        assert_eq!(config.persist.policy, PersistPolicy::Versioned);
        assert_eq!(config.persist_path(), PathBuf::from("out/m.safetensors"));
        assert_eq!(config.model.path, PathBuf::from("elsewhere.safetensors"));
    }

    #[test]
    fn test_rejects_fine_tune_rate_at_training_rate() {
        let args = ConfigArgs {
            learning_rate: Some(1e-4),
            ..Default::default()
        };
        assert!(matches!(ServiceConfig::load(&args), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_out_of_range_image_size() {
        let mut config = ServiceConfig::load(&ConfigArgs::default()).unwrap();
        config.model.preprocess.image_size = MAX_IMAGE_SIZE;
        assert!(config.validate().is_ok());

        config.model.preprocess.image_size = u32::MAX as usize + 1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.model.preprocess.image_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_classes() {
        let mut config = ServiceConfig::load(&ConfigArgs::default()).unwrap();
        config.model.classes = vec!["normal".into(), "normal".into()];
        assert!(config.validate().is_err());
    }
}
