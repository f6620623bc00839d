//! Inference Executor: stateless prediction against a fixed snapshot.
//!
//! Both entry points are pure with respect to the snapshot argument, so they
//! can be called concurrently from any number of threads holding the same
//! `Arc<ModelSnapshot>`.

pub mod preprocess;

use std::collections::BTreeMap;
use std::time::Instant;

use candle_core::{DType, Tensor, D};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classes::ClassSet;
use crate::error::{Error, Result};
use crate::model::ModelSnapshot;

pub use preprocess::{PreprocessConfig, Preprocessor, MAX_IMAGE_SIZE};

/// Result of one forward pass over a single sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// Version of the snapshot that produced this result
    pub snapshot_version: u64,
    /// Softmax probabilities indexed by class position
    pub distribution: Vec<f32>,
    pub predicted_index: usize,
    pub predicted_class: String,
    /// Probability of the predicted class
    pub confidence: f32,
    pub latency_seconds: f64,
}

impl Prediction {
    /// Probability assigned to a class index, 0 when out of range
    pub fn probability(&self, index: usize) -> f32 {
        self.distribution.get(index).copied().unwrap_or(0.0)
    }

    /// Probabilities keyed by class name
    pub fn confidences(&self, classes: &ClassSet) -> BTreeMap<String, f32> {
        classes
            .names()
            .iter()
            .cloned()
            .zip(self.distribution.iter().copied())
            .collect()
    }
}

/// Immutable audit record of a served prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: Uuid,
    pub snapshot_version: u64,
    pub predicted_class: String,
    pub confidence: f32,
    pub all_confidences: BTreeMap<String, f32>,
    pub latency_seconds: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl PredictionRecord {
    pub fn from_prediction(prediction: &Prediction, classes: &ClassSet) -> Self {
        Self {
            id: Uuid::new_v4(),
            snapshot_version: prediction.snapshot_version,
            predicted_class: prediction.predicted_class.clone(),
            confidence: prediction.confidence,
            all_confidences: prediction.confidences(classes),
            latency_seconds: prediction.latency_seconds,
            created_at: Utc::now(),
            user_id: None,
            filename: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_filename(mut self, filename: Option<String>) -> Self {
        self.filename = filename;
        self
    }
}

/// Predict a single preprocessed sample of shape `[3, H, W]` or `[1, 3, H, W]`
pub fn predict(snapshot: &ModelSnapshot, input: &Tensor) -> Result<Prediction> {
    let start = Instant::now();
    let batch = validate_input(snapshot, input)?;
    let n = batch.dim(0)?;
    if n != 1 {
        return Err(Error::invalid_input(format!(
            "predict expects a single sample, got a batch of {}",
            n
        )));
    }
    let mut predictions = run(snapshot, &batch, start)?;
    predictions
        .pop()
        .ok_or_else(|| Error::internal("forward pass returned no rows"))
}

/// Predict every sample of a `[N, 3, H, W]` batch, in order
pub fn predict_batch(snapshot: &ModelSnapshot, input: &Tensor) -> Result<Vec<Prediction>> {
    let start = Instant::now();
    let batch = validate_input(snapshot, input)?;
    run(snapshot, &batch, start)
}

fn validate_input(snapshot: &ModelSnapshot, input: &Tensor) -> Result<Tensor> {
    if input.elem_count() == 0 {
        return Err(Error::invalid_input(format!(
            "empty tensor of shape {:?}",
            input.dims()
        )));
    }
    let batch = match input.rank() {
        3 => input.unsqueeze(0)?,
        4 => input.clone(),
        rank => {
            return Err(Error::invalid_input(format!(
                "expected [C, H, W] or [N, C, H, W], got rank {}",
                rank
            )))
        }
    };
    let channels = batch.dim(1)?;
    let expected = snapshot.config().in_channels;
    if channels != expected {
        return Err(Error::invalid_input(format!(
            "expected {} channels, got {}",
            expected, channels
        )));
    }
    Ok(batch.to_dtype(DType::F32)?.to_device(snapshot.device())?)
}

fn run(snapshot: &ModelSnapshot, batch: &Tensor, start: Instant) -> Result<Vec<Prediction>> {
    let logits = snapshot.logits(batch)?;
    let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
    let rows: Vec<Vec<f32>> = probs.to_vec2()?;
    let latency_seconds = start.elapsed().as_secs_f64() / rows.len().max(1) as f64;

    let classes = snapshot.classes();
    rows.into_iter()
        .map(|distribution| {
            let (predicted_index, confidence) = argmax(&distribution)
                .ok_or_else(|| Error::internal("empty probability row"))?;
            let predicted_class = classes
                .name(predicted_index)
                .ok_or_else(|| Error::internal(format!("no class at index {}", predicted_index)))?
                .to_string();
            Ok(Prediction {
                snapshot_version: snapshot.version(),
                distribution,
                predicted_index,
                predicted_class,
                confidence,
                latency_seconds,
            })
        })
        .collect()
}

/// Index and value of the largest entry; the first one wins ties
fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::checkpoint::initialize;
    use crate::model::NetworkConfig;
    use candle_core::Device;
    use std::sync::Arc;

    fn snapshot() -> ModelSnapshot {
        let classes = Arc::new(ClassSet::default());
        let params = initialize(&NetworkConfig::for_classes(classes.len()), &Device::Cpu).unwrap();
        ModelSnapshot::new(1, params, classes, 0.2, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_argmax_ties_pick_first() {
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.1]), Some((1, 0.4)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_distribution_is_normalised() {
        let snapshot = snapshot();
        let input = Tensor::randn(0f32, 1.0, (3, 16, 16), &Device::Cpu).unwrap();
        let prediction = predict(&snapshot, &input).unwrap();

        let sum: f32 = prediction.distribution.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(prediction.distribution.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(prediction.confidence, prediction.probability(prediction.predicted_index));
        assert_eq!(prediction.snapshot_version, 1);
    }

    #[test]
    fn test_rejects_wrong_channels_and_empty() {
        let snapshot = snapshot();
        let gray = Tensor::zeros((1, 1, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(predict(&snapshot, &gray), Err(Error::InvalidInput(_))));

        let empty = Tensor::zeros((1, 3, 0, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(predict(&snapshot, &empty), Err(Error::InvalidInput(_))));

        let flat = Tensor::zeros(12, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(predict(&snapshot, &flat), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_batch_matches_single() {
        let snapshot = snapshot();
        let a = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let b = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let batch = Tensor::cat(&[&a, &b], 0).unwrap();

        let batched = predict_batch(&snapshot, &batch).unwrap();
        assert_eq!(batched.len(), 2);
        let single = predict(&snapshot, &b).unwrap();
        assert_eq!(batched[1].predicted_index, single.predicted_index);
        for (x, y) in batched[1].distribution.iter().zip(single.distribution.iter()) {
            assert!((x - y).abs() < 1e-5);
        }

        assert!(matches!(predict(&snapshot, &batch), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_record_carries_version_and_confidences() {
        let snapshot = snapshot();
        let input = Tensor::randn(0f32, 1.0, (3, 8, 8), &Device::Cpu).unwrap();
        let prediction = predict(&snapshot, &input).unwrap();
        let record = PredictionRecord::from_prediction(&prediction, snapshot.classes())
            .with_user(Some("user-1".into()));

        assert_eq!(record.snapshot_version, 1);
        assert_eq!(record.all_confidences.len(), 4);
        assert_eq!(record.all_confidences[&record.predicted_class], record.confidence);
        assert_eq!(record.user_id.as_deref(), Some("user-1"));
    }
}
