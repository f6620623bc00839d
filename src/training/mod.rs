//! Online fine-tuning from user feedback

pub mod persistence;
pub mod pipeline;
pub mod service;

pub use persistence::{PersistPolicy, SafetensorsStore, SnapshotStore};
pub use pipeline::{
    FeedbackEvent, FineTuneConfig, FineTuneOutcome, FineTunePipeline, FineTuneStage, OptimizerKind,
};
pub use service::{FineTuneService, FineTuneStatus};
