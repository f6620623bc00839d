//! Durable storage of committed snapshots.
//!
//! Called from the fine-tune worker after a commit has been published. A
//! failure here never un-publishes the snapshot; the pipeline records it on
//! the outcome and moves on.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::checkpoint::save_parameters;
use crate::model::ModelSnapshot;

/// Destination for committed snapshots
pub trait SnapshotStore: Send + Sync {
    /// Write `snapshot` and return the path of the parameter file
    fn persist(&self, snapshot: &ModelSnapshot) -> Result<PathBuf>;
}

/// How successive commits are laid out on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    /// Replace the configured file on every commit
    #[default]
    Overwrite,
    /// Write `<stem>-v<version>.safetensors` next to the configured file
    Versioned,
}

/// Sidecar written next to each parameter file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub persisted_at: DateTime<Utc>,
    pub classes: Vec<String>,
}

/// Safetensors files on the local filesystem.
///
/// Writes are serialised. Under [`PersistPolicy::Overwrite`] a snapshot older
/// than the last one written is refused so the file never moves backwards.
#[derive(Debug)]
pub struct SafetensorsStore {
    path: PathBuf,
    policy: PersistPolicy,
    /// Versioned files to keep; 0 keeps all of them
    max_versions: usize,
    last_persisted: Mutex<u64>,
}

impl SafetensorsStore {
    pub fn new(path: impl Into<PathBuf>, policy: PersistPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            max_versions: 0,
            last_persisted: Mutex::new(0),
        }
    }

    pub fn with_max_versions(mut self, max_versions: usize) -> Self {
        self.max_versions = max_versions;
        self
    }

    pub fn policy(&self) -> PersistPolicy {
        self.policy
    }

    /// Parameter file a snapshot of `version` is written to
    pub fn target_for(&self, version: u64) -> PathBuf {
        match self.policy {
            PersistPolicy::Overwrite => self.path.clone(),
            PersistPolicy::Versioned => {
                let stem = self
                    .path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("model");
                self.path
                    .with_file_name(format!("{}-v{}.safetensors", stem, version))
            }
        }
    }

    /// Versioned files already on disk, oldest first
    pub fn versions(&self) -> Result<Vec<(u64, PathBuf)>> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model");
        let prefix = format!("{}-v", stem);

        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let version = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|n| n.strip_suffix(".safetensors"))
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(version) = version {
                found.push((version, path));
            }
        }
        found.sort_by_key(|(v, _)| *v);
        Ok(found)
    }

    /// Newest versioned file, the one a restarted service resumes from.
    /// Always `None` under [`PersistPolicy::Overwrite`].
    pub fn latest(&self) -> Result<Option<(u64, PathBuf)>> {
        if self.policy != PersistPolicy::Versioned {
            return Ok(None);
        }
        let latest = self.versions()?.pop();
        if let Some((version, _)) = &latest {
            let mut last = self.last_persisted.lock();
            *last = (*last).max(*version);
        }
        Ok(latest)
    }

    fn prune(&self) -> Result<()> {
        if self.policy != PersistPolicy::Versioned || self.max_versions == 0 {
            return Ok(());
        }
        let versions = self.versions()?;
        let excess = versions.len().saturating_sub(self.max_versions);
        for (version, path) in versions.into_iter().take(excess) {
            debug!("Pruning persisted snapshot v{}", version);
            fs::remove_file(&path)?;
            let _ = fs::remove_file(metadata_path(&path));
        }
        Ok(())
    }

    fn write(&self, snapshot: &ModelSnapshot) -> Result<PathBuf> {
        let target = self.target_for(snapshot.version());
        save_parameters(snapshot.parameters(), &target)?;

        let metadata = SnapshotMetadata {
            version: snapshot.version(),
            created_at: snapshot.created_at(),
            persisted_at: Utc::now(),
            classes: snapshot.classes().names().to_vec(),
        };
        fs::write(metadata_path(&target), serde_json::to_string_pretty(&metadata)?)?;
        Ok(target)
    }
}

impl SnapshotStore for SafetensorsStore {
    fn persist(&self, snapshot: &ModelSnapshot) -> Result<PathBuf> {
        let mut last = self.last_persisted.lock();
        if self.policy == PersistPolicy::Overwrite && snapshot.version() < *last {
            return Err(Error::Persistence(format!(
                "snapshot v{} is older than persisted v{}; not written",
                snapshot.version(),
                *last
            )));
        }
        let target = self.write(snapshot).map_err(|e| {
            Error::Persistence(format!(
                "failed to persist snapshot v{}: {}",
                snapshot.version(),
                e
            ))
        })?;
        *last = (*last).max(snapshot.version());
        if let Err(e) = self.prune() {
            warn!("Failed to prune old snapshots: {}", e);
        }
        Ok(target)
    }
}

/// `<file>.json` next to a parameter file
pub fn metadata_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}
