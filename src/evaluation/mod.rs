//! Evaluation Harness: aggregate metrics of one snapshot over a labeled
//! dataset. Read-only with respect to model state.

pub mod dataset;
pub mod metrics;

use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::inference::predict_batch;
use crate::model::ModelSnapshot;

pub use dataset::{ImageFolderDataset, InMemoryDataset, LabeledDataset, LabeledSample};
pub use metrics::{ClassMetrics, ConfusionMatrix};

pub const DEFAULT_EVAL_BATCH_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub snapshot_version: u64,
    pub sample_count: usize,
    pub overall_accuracy: f64,
    pub overall_precision_weighted: f64,
    pub overall_recall_weighted: f64,
    pub overall_f1_weighted: f64,
    pub per_class: BTreeMap<String, ClassMetrics>,
}

/// Run `snapshot` over every sample of `dataset` in order, `batch_size`
/// samples per forward pass.
#[instrument(skip_all, fields(version = snapshot.version(), samples = dataset.len()))]
pub fn evaluate(
    snapshot: &ModelSnapshot,
    dataset: &dyn LabeledDataset,
    batch_size: usize,
) -> Result<EvaluationReport> {
    if dataset.is_empty() {
        return Err(Error::EmptyDataset);
    }
    let batch_size = batch_size.max(1);
    let classes = snapshot.classes();
    let mut matrix = ConfusionMatrix::new(classes.len());

    let mut start = 0;
    while start < dataset.len() {
        let end = (start + batch_size).min(dataset.len());
        let mut inputs = Vec::with_capacity(end - start);
        let mut labels = Vec::with_capacity(end - start);
        for index in start..end {
            let sample = dataset.get(index)?;
            if sample.label >= classes.len() {
                return Err(Error::Dataset(format!(
                    "sample {} has label index {} but only {} classes exist",
                    index,
                    sample.label,
                    classes.len()
                )));
            }
            let input = match sample.input.rank() {
                3 => sample.input.unsqueeze(0)?,
                _ => sample.input,
            };
            inputs.push(input);
            labels.push(sample.label);
        }

        let batch = Tensor::cat(&inputs, 0)?;
        for (prediction, label) in predict_batch(snapshot, &batch)?.iter().zip(labels) {
            matrix.record(label, prediction.predicted_index);
        }
        start = end;
    }

    let (precision, recall, f1) = matrix.weighted();
    let per_class = classes
        .names()
        .iter()
        .enumerate()
        .map(|(index, name)| (name.clone(), matrix.class_metrics(index)))
        .collect();

    let report = EvaluationReport {
        snapshot_version: snapshot.version(),
        sample_count: matrix.total(),
        overall_accuracy: matrix.accuracy(),
        overall_precision_weighted: precision,
        overall_recall_weighted: recall,
        overall_f1_weighted: f1,
        per_class,
    };
    info!(
        "Evaluated snapshot v{}: accuracy {:.4}, weighted F1 {:.4} over {} samples",
        report.snapshot_version, report.overall_accuracy, report.overall_f1_weighted, report.sample_count
    );
    Ok(report)
}
