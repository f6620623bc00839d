//! Labeled datasets consumed by the evaluation harness.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::Tensor;
use tracing::debug;

use crate::classes::ClassSet;
use crate::error::{Error, Result};
use crate::inference::Preprocessor;

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// One preprocessed input with its true class index
#[derive(Debug, Clone)]
pub struct LabeledSample {
    /// `[1, 3, H, W]` or `[3, H, W]`
    pub input: Tensor,
    pub label: usize,
}

/// Finite, index-addressable sequence of labeled samples.
///
/// Iteration by index from 0 makes every pass restartable and ordered.
pub trait LabeledDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<LabeledSample>;
}

/// Dataset of already-preprocessed tensors
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<LabeledSample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<LabeledSample>) -> Self {
        Self { samples }
    }

    pub fn push(&mut self, input: Tensor, label: usize) {
        self.samples.push(LabeledSample { input, label });
    }
}

impl LabeledDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<LabeledSample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Dataset(format!("index {} out of range", index)))
    }
}

/// `root/<class_name>/<image>` layout, decoded lazily on access
pub struct ImageFolderDataset {
    root: PathBuf,
    entries: Vec<(PathBuf, usize)>,
    preprocessor: Arc<Preprocessor>,
}

impl ImageFolderDataset {
    /// Scan `root`. Files are ordered by path; a directory that names no
    /// known class is rejected.
    pub fn open(root: &Path, classes: &ClassSet, preprocessor: Arc<Preprocessor>) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::Dataset(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let mut entries = Vec::new();
        for dir in fs::read_dir(root)? {
            let dir = dir?.path();
            if !dir.is_dir() {
                continue;
            }
            let name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::Dataset(format!("unreadable directory {}", dir.display())))?;
            let label = classes.index_of(name).ok_or_else(|| {
                Error::Dataset(format!(
                    "directory '{}' does not match any class ({})",
                    name,
                    classes.names().join(", ")
                ))
            })?;

            for file in fs::read_dir(&dir)? {
                let file = file?.path();
                if file.is_file() && is_image(&file) {
                    entries.push((file, label));
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        debug!("Found {} images under {}", entries.len(), root.display());
        Ok(Self {
            root: root.to_path_buf(),
            entries,
            preprocessor,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LabeledDataset for ImageFolderDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> Result<LabeledSample> {
        let (path, label) = self
            .entries
            .get(index)
            .ok_or_else(|| Error::Dataset(format!("index {} out of range", index)))?;
        let input = self.preprocessor.load(path)?;
        Ok(LabeledSample {
            input,
            label: *label,
        })
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
