//! Error types for the scanserve service.

use std::result;
use thiserror::Error;

/// A specialized Result type for scanserve operations.
pub type Result<T> = result::Result<T, Error>;

/// The error type for scanserve operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Tensor handed to the inference executor has the wrong shape or is empty
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Image bytes could not be decoded or preprocessed
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Label is not one of the known classes
    #[error("Invalid label '{label}': must be one of {expected:?}")]
    InvalidLabel { label: String, expected: Vec<String> },

    /// A fine-tune operation already holds the working copy slot
    #[error("Fine-tune already in progress (lease {active_lease})")]
    Busy { active_lease: u64 },

    /// Commit attempted with a working copy the manager no longer tracks
    #[error("Working copy with lease {lease} is not the active checkout")]
    StaleWorkingCopy { lease: u64 },

    #[error("No previous snapshot to roll back to")]
    NoPreviousSnapshot,

    /// Evaluation requested on a dataset with no samples
    #[error("Evaluation dataset is empty")]
    EmptyDataset,

    /// The initial model could not be constructed
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// The durable storage collaborator rejected a write
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether the error was caused by the caller's request rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_)
                | Error::InvalidImage(_)
                | Error::InvalidLabel { .. }
                | Error::EmptyDataset
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::InvalidImage(err.to_string())
    }
}
