//! Background execution of fine-tunes.
//!
//! Gradient steps are CPU-bound, so each event runs on tokio's blocking pool
//! and never occupies the async workers that serve predictions.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::pipeline::{FeedbackEvent, FineTuneOutcome, FineTunePipeline, FineTuneStage};
use crate::error::{Error, Result};

pub const DEFAULT_STATUS_CAPACITY: usize = 1024;

/// Last known state of the fine-tune triggered by one prediction's feedback
#[derive(Debug, Clone, Serialize)]
pub struct FineTuneStatus {
    pub prediction_id: Uuid,
    pub stage: FineTuneStage,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bounded, most-recently-updated history of fine-tune statuses
pub struct StatusBoard {
    entries: Mutex<LruCache<Uuid, FineTuneStatus>>,
}

impl StatusBoard {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, prediction_id: &Uuid) -> Option<FineTuneStatus> {
        self.entries.lock().peek(prediction_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_stage(&self, prediction_id: Uuid, stage: FineTuneStage) {
        let mut entries = self.entries.lock();
        let now = Utc::now();
        match entries.get_mut(&prediction_id) {
            Some(status) => {
                status.stage = stage;
                status.updated_at = now;
            }
            None => {
                entries.put(
                    prediction_id,
                    FineTuneStatus {
                        prediction_id,
                        stage,
                        updated_at: now,
                        new_version: None,
                        loss: None,
                        error: None,
                    },
                );
            }
        }
    }

    fn finish(&self, prediction_id: Uuid, result: &Result<FineTuneOutcome>) {
        let stage = if result.is_ok() {
            FineTuneStage::Done
        } else {
            FineTuneStage::Failed
        };
        self.set_stage(prediction_id, stage);
        if let Some(status) = self.entries.lock().get_mut(&prediction_id) {
            match result {
                Ok(outcome) => {
                    status.new_version = Some(outcome.new_version);
                    status.loss = Some(outcome.loss);
                    status.error = None;
                }
                Err(e) => status.error = Some(e.to_string()),
            }
        }
    }
}

impl std::fmt::Debug for StatusBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusBoard").field("len", &self.len()).finish()
    }
}

/// Counters since startup
#[derive(Debug, Default)]
pub struct FineTuneStats {
    submitted: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    busy: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FineTuneStatsSnapshot {
    pub submitted: u64,
    pub committed: u64,
    pub failed: u64,
    pub busy_rejections: u64,
}

impl FineTuneStats {
    pub fn snapshot(&self) -> FineTuneStatsSnapshot {
        FineTuneStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            busy_rejections: self.busy.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &Result<FineTuneOutcome>) {
        match result {
            Ok(_) => self.committed.fetch_add(1, Ordering::Relaxed),
            Err(Error::Busy { .. }) => {
                self.busy.fetch_add(1, Ordering::Relaxed);
                self.failed.fetch_add(1, Ordering::Relaxed)
            }
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Submits feedback events to the fine-tune pipeline in the background
#[derive(Debug, Clone)]
pub struct FineTuneService {
    pipeline: Arc<FineTunePipeline>,
    board: Arc<StatusBoard>,
    stats: Arc<FineTuneStats>,
}

impl FineTuneService {
    pub fn new(pipeline: FineTunePipeline, status_capacity: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            board: Arc::new(StatusBoard::new(status_capacity)),
            stats: Arc::new(FineTuneStats::default()),
        }
    }

    pub fn pipeline(&self) -> &FineTunePipeline {
        &self.pipeline
    }

    /// Queue `event` on the blocking pool.
    ///
    /// The label is checked before anything is spawned, so an unknown class
    /// is reported to the caller directly. Must be called from within a
    /// tokio runtime.
    pub fn submit(&self, event: FeedbackEvent) -> Result<JoinHandle<Result<FineTuneOutcome>>> {
        self.pipeline.validate_label(&event.correct_label)?;

        let prediction_id = event.prediction_id;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.board.set_stage(prediction_id, FineTuneStage::Received);
        debug!("Queued fine-tune for prediction {}", prediction_id);

        let pipeline = Arc::clone(&self.pipeline);
        let board = Arc::clone(&self.board);
        let stats = Arc::clone(&self.stats);
        Ok(tokio::task::spawn_blocking(move || {
            let result =
                pipeline.process_observed(&event, |stage| board.set_stage(prediction_id, stage));
            board.finish(prediction_id, &result);
            stats.record(&result);
            result
        }))
    }

    pub fn status(&self, prediction_id: &Uuid) -> Option<FineTuneStatus> {
        self.board.get(prediction_id)
    }

    pub fn stats(&self) -> FineTuneStatsSnapshot {
        self.stats.snapshot()
    }
}
