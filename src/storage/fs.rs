//! Directory-backed archive.
//!
//! ```text
//! <root>/records/<id>.json
//! <root>/images/<id>.<ext>
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{correct, ArchivedPrediction, FeedbackUpdate, PredictionArchive};
use crate::error::{Error, Result};
use crate::inference::PredictionRecord;

#[derive(Debug)]
pub struct FsArchive {
    root: PathBuf,
    /// Serialises read-modify-write of record files
    write_lock: Mutex<()>,
}

impl FsArchive {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("records")).await?;
        fs::create_dir_all(root.join("images")).await?;
        debug!("Opened prediction archive at {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.root.join("records").join(format!("{}.json", id))
    }

    async fn read(&self, id: Uuid) -> Result<Option<ArchivedPrediction>> {
        let path = self.record_path(id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, entry: &ArchivedPrediction) -> Result<()> {
        let path = self.record_path(entry.record.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entry)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn image_extension(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("bin")
}

#[async_trait]
impl PredictionArchive for FsArchive {
    async fn store(&self, record: &PredictionRecord, image: Option<&[u8]>) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let image_path = match image {
            Some(bytes) => {
                let relative = format!("images/{}.{}", record.id, image_extension(bytes));
                fs::write(self.root.join(&relative), bytes).await?;
                Some(relative)
            }
            None => None,
        };

        self.write(&ArchivedPrediction {
            record: record.clone(),
            image_path,
            corrected_label: None,
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ArchivedPrediction>> {
        self.read(id).await
    }

    async fn apply_feedback(&self, id: Uuid, correct_label: &str) -> Result<FeedbackUpdate> {
        let _guard = self.write_lock.lock().await;
        let Some(mut entry) = self.read(id).await? else {
            return Ok(FeedbackUpdate::NotFound);
        };
        let update = correct(&mut entry, correct_label);
        if matches!(update, FeedbackUpdate::Updated { .. }) {
            self.write(&entry).await.map_err(|e| {
                Error::Persistence(format!("failed to record feedback for {}: {}", id, e))
            })?;
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(predicted: &str) -> PredictionRecord {
        PredictionRecord {
            id: Uuid::new_v4(),
            snapshot_version: 1,
            predicted_class: predicted.to_string(),
            confidence: 0.6,
            all_confidences: BTreeMap::from([(predicted.to_string(), 0.6)]),
            latency_seconds: 0.01,
            created_at: Utc::now(),
            user_id: None,
            filename: Some("scan.png".into()),
        }
    }

    #[tokio::test]
    async fn test_store_and_correct() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FsArchive::open(dir.path()).await.unwrap();
        let record = record("normal");
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

        archive.store(&record, Some(&png)).await.unwrap();
        let stored = archive.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.record, record);
        assert_eq!(stored.image_path.as_deref(), Some(format!("images/{}.png", record.id).as_str()));

        assert_eq!(
            archive.apply_feedback(record.id, "normal").await.unwrap(),
            FeedbackUpdate::AlreadyCorrect
        );
        assert_eq!(
            archive.apply_feedback(record.id, "adenocarcinoma").await.unwrap(),
            FeedbackUpdate::Updated {
                previous: "normal".into()
            }
        );
        assert_eq!(
            archive.apply_feedback(record.id, "adenocarcinoma").await.unwrap(),
            FeedbackUpdate::AlreadyCorrect
        );

        // Survives reopening
        let reopened = FsArchive::open(dir.path()).await.unwrap();
        let stored = reopened.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.effective_label(), "adenocarcinoma");
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FsArchive::open(dir.path()).await.unwrap();
        assert!(archive.get(Uuid::new_v4()).await.unwrap().is_none());
        assert_eq!(
            archive.apply_feedback(Uuid::new_v4(), "normal").await.unwrap(),
            FeedbackUpdate::NotFound
        );
    }
}
