//! Prediction archive: audit records of served predictions, the uploaded
//! images, and feedback corrections applied to them.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::inference::PredictionRecord;

pub use fs::FsArchive;
pub use memory::MemoryArchive;

/// A stored prediction and any correction supplied for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedPrediction {
    pub record: PredictionRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_label: Option<String>,
}

impl ArchivedPrediction {
    /// The user's label if one was given, else the model's
    pub fn effective_label(&self) -> &str {
        self.corrected_label
            .as_deref()
            .unwrap_or(&self.record.predicted_class)
    }
}

/// Result of applying a correction to a stored prediction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeedbackUpdate {
    NotFound,
    /// The stored label changed; `previous` is the label it replaced
    Updated { previous: String },
    /// The correction matches what is already stored
    AlreadyCorrect,
}

#[async_trait]
pub trait PredictionArchive: Send + Sync {
    /// Store a record and, optionally, the image it was computed from
    async fn store(&self, record: &PredictionRecord, image: Option<&[u8]>) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<ArchivedPrediction>>;

    async fn apply_feedback(&self, id: Uuid, correct_label: &str) -> Result<FeedbackUpdate>;
}

/// Shared correction rule for every archive implementation
pub(crate) fn correct(entry: &mut ArchivedPrediction, correct_label: &str) -> FeedbackUpdate {
    let current = entry.effective_label().to_string();
    if current == correct_label {
        FeedbackUpdate::AlreadyCorrect
    } else {
        entry.corrected_label = Some(correct_label.to_string());
        FeedbackUpdate::Updated { previous: current }
    }
}
