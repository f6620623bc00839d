//! Classifier model: architecture, immutable snapshots, and the state manager
//! that publishes them.
//!
//! Readers only ever see [`ModelSnapshot`]s, which always run in
//! [`Mode::Inference`]. Training mode and normalisation statistics updates
//! exist only on a [`WorkingCopy`] checked out from the [`ModelStateManager`].

pub mod checkpoint;
pub mod network;
pub mod snapshot;
pub mod state;

use serde::{Deserialize, Serialize};

pub use network::{Classifier, NetworkConfig};
pub use snapshot::ModelSnapshot;
pub use state::{ModelStateManager, WorkingCopy};

/// Forward-pass behaviour of the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Normalisation uses running statistics, dropout disabled
    Inference,
    /// Dropout enabled; normalisation uses batch statistics and updates the
    /// running averages unless `update_norm_statistics` is false, in which
    /// case the running statistics are used and left untouched
    Training { update_norm_statistics: bool },
}

impl Mode {
    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Training { .. })
    }

    /// Whether normalisation layers should run on batch statistics
    pub(crate) fn uses_batch_statistics(&self) -> bool {
        matches!(
            self,
            Mode::Training {
                update_norm_statistics: true
            }
        )
    }
}
