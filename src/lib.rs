//! Scan classification service with online fine-tuning from user feedback.
//!
//! Predictions always run against an immutable, versioned [`ModelSnapshot`]
//! published by the [`ModelStateManager`]. A feedback event checks out a
//! private working copy, takes one gradient step on the corrected sample and
//! commits it as the next version, while concurrent predictions keep using
//! whichever snapshot they loaded.

pub mod classes;
pub mod cli;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod inference;
pub mod model;
pub mod server;
pub mod storage;
pub mod training;

pub use classes::ClassSet;
pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use evaluation::{evaluate, EvaluationReport, LabeledDataset};
pub use inference::{predict, predict_batch, Prediction, PredictionRecord, Preprocessor};
pub use model::{Mode, ModelSnapshot, ModelStateManager, WorkingCopy};
pub use training::{FeedbackEvent, FineTuneConfig, FineTunePipeline, FineTuneService};
