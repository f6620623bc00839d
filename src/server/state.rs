//! Server state management

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use candle_core::Device;
use tracing::{info, warn};

use crate::config::{ServerSettings, ServiceConfig};
use crate::error::Result;
use crate::evaluation::{ImageFolderDataset, LabeledDataset};
use crate::inference::Preprocessor;
use crate::model::{checkpoint, ModelStateManager};
use crate::storage::{FsArchive, MemoryArchive, PredictionArchive};
use crate::training::{FineTunePipeline, FineTuneService, SafetensorsStore};

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    /// Publishes the snapshot every prediction runs against
    pub manager: Arc<ModelStateManager>,

    pub preprocessor: Arc<Preprocessor>,

    /// Background fine-tunes triggered by feedback
    pub fine_tune: FineTuneService,

    /// Prediction records and uploaded images
    pub archive: Arc<dyn PredictionArchive>,

    /// Dataset for `POST /evaluate`, if configured
    pub eval_dataset: Option<Arc<dyn LabeledDataset>>,

    pub eval_batch_size: usize,

    pub config: Arc<ServerSettings>,

    pub metrics: Arc<Metrics>,
}

/// Request counters
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_predictions: AtomicU64,
    pub failed_predictions: AtomicU64,
    pub feedback_received: AtomicU64,
    /// Sum of prediction latencies in microseconds
    pub prediction_latency_us: AtomicU64,
}

impl Metrics {
    pub fn record_prediction(&self, latency_seconds: f64) {
        self.total_predictions.fetch_add(1, Ordering::Relaxed);
        self.prediction_latency_us
            .fetch_add((latency_seconds * 1e6) as u64, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> serde_json::Value {
        let total = self.total_predictions.load(Ordering::Relaxed);
        let latency_us = self.prediction_latency_us.load(Ordering::Relaxed);
        let avg_latency_ms = if total > 0 {
            latency_us as f64 / total as f64 / 1000.0
        } else {
            0.0
        };
        serde_json::json!({
            "total_predictions": total,
            "failed_predictions": self.failed_predictions.load(Ordering::Relaxed),
            "feedback_received": self.feedback_received.load(Ordering::Relaxed),
            "avg_latency_ms": avg_latency_ms,
        })
    }
}

impl ServerState {
    /// Assemble state from already-constructed collaborators
    pub fn new(
        manager: Arc<ModelStateManager>,
        preprocessor: Arc<Preprocessor>,
        fine_tune: FineTuneService,
        archive: Arc<dyn PredictionArchive>,
        config: ServerSettings,
    ) -> Self {
        Self {
            manager,
            preprocessor,
            fine_tune,
            archive,
            eval_dataset: None,
            eval_batch_size: crate::evaluation::DEFAULT_EVAL_BATCH_SIZE,
            config: Arc::new(config),
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_eval_dataset(mut self, dataset: Arc<dyn LabeledDataset>, batch_size: usize) -> Self {
        self.eval_dataset = Some(dataset);
        self.eval_batch_size = batch_size;
        self
    }

    /// Load the initial snapshot and wire every collaborator from configuration.
    ///
    /// With versioned persistence enabled the newest `model-vN` file is served
    /// as version N; otherwise `model.path` is served as version 1. A snapshot
    /// that cannot be loaded is fatal.
    pub async fn from_config(config: &ServiceConfig) -> Result<Self> {
        let device = Device::Cpu;
        let classes = Arc::new(config.model.class_set()?);

        let store = config.persist.enabled.then(|| {
            SafetensorsStore::new(config.persist_path(), config.persist.policy)
                .with_max_versions(config.persist.max_versions)
        });
        let resume = match &store {
            Some(store) => store.latest()?,
            None => None,
        };
        let snapshot = match resume {
            Some((version, path)) => {
                info!("Resuming from persisted snapshot v{}", version);
                checkpoint::load_snapshot_at(
                    &path,
                    version,
                    Arc::clone(&classes),
                    config.model.dropout,
                    &device,
                )?
            }
            None => checkpoint::load_snapshot(
                &config.model.path,
                Arc::clone(&classes),
                config.model.dropout,
                &device,
            )?,
        };
        let manager = Arc::new(ModelStateManager::new(snapshot));
        let preprocessor = Arc::new(Preprocessor::new(config.model.preprocess.clone(), device));

        let eval_dataset: Option<Arc<dyn LabeledDataset>> = match &config.evaluation.dataset {
            Some(root) => match ImageFolderDataset::open(root, &classes, Arc::clone(&preprocessor)) {
                Ok(dataset) => {
                    info!("Evaluation dataset: {} samples from {}", dataset.len(), root.display());
                    Some(Arc::new(dataset))
                }
                Err(e) => {
                    warn!("Evaluation dataset unavailable: {}", e);
                    None
                }
            },
            None => None,
        };

        let mut pipeline = FineTunePipeline::new(
            Arc::clone(&manager),
            Arc::clone(&preprocessor),
            config.fine_tune.clone(),
        );
        if let Some(store) = store {
            pipeline = pipeline.with_store(Arc::new(store));
        }
        if let Some(dataset) = &eval_dataset {
            pipeline = pipeline.with_eval_dataset(Arc::clone(dataset));
        }
        let fine_tune = FineTuneService::new(pipeline, config.server.status_capacity);

        let archive: Arc<dyn PredictionArchive> = match &config.archive.directory {
            Some(dir) => Arc::new(FsArchive::open(dir.clone()).await?),
            None => {
                warn!("No archive directory configured; prediction records are kept in memory");
                Arc::new(MemoryArchive::new())
            }
        };

        let mut state = Self::new(
            manager,
            preprocessor,
            fine_tune,
            archive,
            config.server.clone(),
        );
        if let Some(dataset) = eval_dataset {
            state = state.with_eval_dataset(dataset, config.evaluation.batch_size);
        }
        Ok(state)
    }
}
