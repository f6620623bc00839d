//! Fine-Tune Pipeline: turns one feedback event into at most one committed
//! snapshot.
//!
//! ```text
//! Received -> Validating -> CheckedOut -> Updated -> Committed -> Persisted -> Evaluated -> Done
//!     \___________\______________\____________\__________________________________________-> Failed
//! ```
//!
//! Every failure between checkout and commit aborts the working copy, so the
//! current snapshot is untouched. Persistence and evaluation happen after
//! the commit and only annotate the outcome.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::persistence::SnapshotStore;
use crate::error::{Error, Result};
use crate::evaluation::{evaluate, EvaluationReport, LabeledDataset, DEFAULT_EVAL_BATCH_SIZE};
use crate::inference::Preprocessor;
use crate::model::{Mode, ModelStateManager, WorkingCopy};

/// Learning rate the shipped model was trained with
pub const TRAINING_LEARNING_RATE: f64 = 1e-4;

/// Default single-sample fine-tune learning rate
pub const DEFAULT_FINE_TUNE_LEARNING_RATE: f64 = 5e-5;

/// A user's correction of a past prediction
#[derive(Clone, PartialEq, Eq)]
pub struct FeedbackEvent {
    pub prediction_id: Uuid,
    pub correct_label: String,
    /// Encoded image as uploaded
    pub image_bytes: Vec<u8>,
}

impl std::fmt::Debug for FeedbackEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackEvent")
            .field("prediction_id", &self.prediction_id)
            .field("correct_label", &self.correct_label)
            .field("image_bytes", &self.image_bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FineTuneStage {
    Received,
    Validating,
    CheckedOut,
    Updated,
    Committed,
    Persisted,
    Evaluated,
    Done,
    Failed,
}

impl FineTuneStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FineTuneStage::Done | FineTuneStage::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Adam,
    Sgd,
}

fn default_learning_rate() -> f64 {
    DEFAULT_FINE_TUNE_LEARNING_RATE
}

fn default_training_learning_rate() -> f64 {
    TRAINING_LEARNING_RATE
}

fn default_eval_batch_size() -> usize {
    DEFAULT_EVAL_BATCH_SIZE
}

/// Single-step fine-tune settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuneConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Rate of the original training run; the fine-tune rate must stay
    /// strictly below it
    #[serde(default = "default_training_learning_rate")]
    pub training_learning_rate: f64,
    #[serde(default)]
    pub optimizer: OptimizerKind,
    /// Move normalisation running averages toward the example's batch
    /// statistics during the step
    #[serde(default)]
    pub update_norm_statistics: bool,
    #[serde(default)]
    pub evaluate_after_commit: bool,
    #[serde(default = "default_eval_batch_size")]
    pub eval_batch_size: usize,
}

impl Default for FineTuneConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            training_learning_rate: default_training_learning_rate(),
            optimizer: OptimizerKind::default(),
            update_norm_statistics: false,
            evaluate_after_commit: false,
            eval_batch_size: default_eval_batch_size(),
        }
    }
}

impl FineTuneConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "fine-tune learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.learning_rate >= self.training_learning_rate {
            return Err(Error::Config(format!(
                "fine-tune learning rate {} must be below the training rate {}",
                self.learning_rate, self.training_learning_rate
            )));
        }
        if self.eval_batch_size == 0 {
            return Err(Error::Config("eval_batch_size must be at least 1".into()));
        }
        Ok(())
    }

    fn mode(&self) -> Mode {
        Mode::Training {
            update_norm_statistics: self.update_norm_statistics,
        }
    }
}

/// What a completed fine-tune produced
#[derive(Debug, Clone, Serialize)]
pub struct FineTuneOutcome {
    pub prediction_id: Uuid,
    pub label: String,
    pub base_version: u64,
    pub new_version: u64,
    pub loss: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted_to: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_error: Option<String>,
    pub duration_seconds: f64,
}

/// Runs feedback events against a [`ModelStateManager`]
#[derive(Clone)]
pub struct FineTunePipeline {
    manager: Arc<ModelStateManager>,
    preprocessor: Arc<Preprocessor>,
    config: FineTuneConfig,
    store: Option<Arc<dyn SnapshotStore>>,
    eval_dataset: Option<Arc<dyn LabeledDataset>>,
}

impl FineTunePipeline {
    pub fn new(
        manager: Arc<ModelStateManager>,
        preprocessor: Arc<Preprocessor>,
        config: FineTuneConfig,
    ) -> Self {
        Self {
            manager,
            preprocessor,
            config,
            store: None,
            eval_dataset: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_eval_dataset(mut self, dataset: Arc<dyn LabeledDataset>) -> Self {
        self.eval_dataset = Some(dataset);
        self
    }

    pub fn manager(&self) -> &Arc<ModelStateManager> {
        &self.manager
    }

    pub fn config(&self) -> &FineTuneConfig {
        &self.config
    }

    /// Resolve a label against the current snapshot's class set
    pub fn validate_label(&self, label: &str) -> Result<usize> {
        self.manager.current_snapshot().classes().resolve(label)
    }

    pub fn process(&self, event: &FeedbackEvent) -> Result<FineTuneOutcome> {
        self.process_observed(event, |_| {})
    }

    /// Run `event` to completion, reporting each stage entered to `observer`
    #[instrument(skip_all, fields(prediction_id = %event.prediction_id, label = %event.correct_label))]
    pub fn process_observed<F>(&self, event: &FeedbackEvent, mut observer: F) -> Result<FineTuneOutcome>
    where
        F: FnMut(FineTuneStage),
    {
        observer(FineTuneStage::Received);
        let result = self.run(event, &mut observer);
        match &result {
            Ok(outcome) => {
                observer(FineTuneStage::Done);
                info!(
                    "Fine-tune v{} -> v{} done (loss {:.5}, {:.3}s)",
                    outcome.base_version, outcome.new_version, outcome.loss, outcome.duration_seconds
                );
            }
            Err(e) => {
                observer(FineTuneStage::Failed);
                if e.is_client_error() {
                    warn!("Fine-tune rejected: {}", e);
                } else {
                    error!("Fine-tune failed: {}", e);
                }
            }
        }
        result
    }

    fn run<F>(&self, event: &FeedbackEvent, observer: &mut F) -> Result<FineTuneOutcome>
    where
        F: FnMut(FineTuneStage),
    {
        let start = Instant::now();

        observer(FineTuneStage::Validating);
        let label = self.validate_label(&event.correct_label)?;
        let input = self.preprocessor.decode(&event.image_bytes)?;

        let mut working = self.manager.begin_fine_tune()?;
        observer(FineTuneStage::CheckedOut);
        let base_version = working.base_version();

        let loss = match self.step(&mut working, &input, label) {
            Ok(loss) => loss,
            Err(e) => {
                self.manager.abort(working);
                return Err(e);
            }
        };
        observer(FineTuneStage::Updated);
        debug!("Gradient step on v{} (loss {:.5})", base_version, loss);

        let snapshot = self.manager.commit(working)?;
        observer(FineTuneStage::Committed);

        let mut outcome = FineTuneOutcome {
            prediction_id: event.prediction_id,
            label: event.correct_label.clone(),
            base_version,
            new_version: snapshot.version(),
            loss,
            persisted_to: None,
            persistence_error: None,
            evaluation: None,
            evaluation_error: None,
            duration_seconds: 0.0,
        };

        if let Some(store) = &self.store {
            match store.persist(&snapshot) {
                Ok(path) => {
                    debug!("Persisted v{} to {}", snapshot.version(), path.display());
                    outcome.persisted_to = Some(path);
                }
                Err(e) => {
                    error!("Snapshot v{} is live but not persisted: {}", snapshot.version(), e);
                    outcome.persistence_error = Some(e.to_string());
                }
            }
            observer(FineTuneStage::Persisted);
        }

        if self.config.evaluate_after_commit {
            if let Some(dataset) = &self.eval_dataset {
                match evaluate(&snapshot, dataset.as_ref(), self.config.eval_batch_size) {
                    Ok(report) => outcome.evaluation = Some(report),
                    Err(e) => {
                        warn!("Post-commit evaluation of v{} failed: {}", snapshot.version(), e);
                        outcome.evaluation_error = Some(e.to_string());
                    }
                }
                observer(FineTuneStage::Evaluated);
            }
        }

        outcome.duration_seconds = start.elapsed().as_secs_f64();
        Ok(outcome)
    }

    /// One optimiser step on the cross-entropy of a single labelled sample
    fn step(&self, working: &mut WorkingCopy, input: &Tensor, label: usize) -> Result<f32> {
        working.set_mode(self.config.mode());
        let input = input.to_device(working.device())?;
        let logits = working.forward(&input)?;
        let target = Tensor::new(&[label as u32], working.device())?;
        let loss = candle_nn::loss::cross_entropy(&logits, &target)?;
        let value = loss.to_scalar::<f32>()?;
        if !value.is_finite() {
            return Err(Error::internal(format!("non-finite loss {}", value)));
        }

        let vars = working.trainable_vars()?;
        match self.config.optimizer {
            OptimizerKind::Adam => {
                let params = ParamsAdamW {
                    lr: self.config.learning_rate,
                    weight_decay: 0.0,
                    ..Default::default()
                };
                AdamW::new(vars, params)?.backward_step(&loss)?;
            }
            OptimizerKind::Sgd => {
                SGD::new(vars, self.config.learning_rate)?.backward_step(&loss)?;
            }
        }
        Ok(value)
    }
}

impl std::fmt::Debug for FineTunePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FineTunePipeline")
            .field("config", &self.config)
            .field("persists", &self.store.is_some())
            .field("evaluates", &self.eval_dataset.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = FineTuneConfig::default();
        assert_eq!(config.learning_rate, 5e-5);
        assert_eq!(config.optimizer, OptimizerKind::Adam);
        assert!(!config.update_norm_statistics);
        assert!(!config.evaluate_after_commit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_rate_at_training_rate() {
        let config = FineTuneConfig {
            learning_rate: TRAINING_LEARNING_RATE,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = FineTuneConfig {
            learning_rate: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_partial() {
        let config: FineTuneConfig =
            serde_json::from_str(r#"{"optimizer": "sgd", "update_norm_statistics": true}"#).unwrap();
        assert_eq!(config.optimizer, OptimizerKind::Sgd);
        assert!(config.update_norm_statistics);
        assert_eq!(config.learning_rate, DEFAULT_FINE_TUNE_LEARNING_RATE);
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&FineTuneStage::CheckedOut).unwrap(),
            "\"checked_out\""
        );
        assert!(FineTuneStage::Failed.is_terminal());
        assert!(!FineTuneStage::Committed.is_terminal());
    }
}
