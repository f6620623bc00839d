//! In-process archive, used by tests and when no archive directory is set.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{correct, ArchivedPrediction, FeedbackUpdate, PredictionArchive};
use crate::error::Result;
use crate::inference::PredictionRecord;

#[derive(Debug, Default)]
pub struct MemoryArchive {
    entries: RwLock<HashMap<Uuid, ArchivedPrediction>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PredictionArchive for MemoryArchive {
    async fn store(&self, record: &PredictionRecord, _image: Option<&[u8]>) -> Result<()> {
        self.entries.write().insert(
            record.id,
            ArchivedPrediction {
                record: record.clone(),
                image_path: None,
                corrected_label: None,
            },
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ArchivedPrediction>> {
        Ok(self.entries.read().get(&id).cloned())
    }

    async fn apply_feedback(&self, id: Uuid, correct_label: &str) -> Result<FeedbackUpdate> {
        let mut entries = self.entries.write();
        Ok(match entries.get_mut(&id) {
            Some(entry) => correct(entry, correct_label),
            None => FeedbackUpdate::NotFound,
        })
    }
}
