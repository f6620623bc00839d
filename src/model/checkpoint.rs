//! Safetensors parameter files: bootstrap loading, persistence, and fresh
//! initialisation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use super::network::{Classifier, NetworkConfig};
use super::snapshot::ModelSnapshot;
use crate::classes::ClassSet;
use crate::error::{Error, Result};

/// Version assigned to the snapshot loaded at startup
pub const INITIAL_VERSION: u64 = 1;

/// Read every tensor from a safetensors file
pub fn load_parameters(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    if !path.exists() {
        return Err(Error::ModelLoad(format!(
            "parameter file {} does not exist",
            path.display()
        )));
    }
    candle_core::safetensors::load(path, device)
        .map_err(|e| Error::ModelLoad(format!("{}: {}", path.display(), e)))
}

/// Load the initial snapshot the service starts serving.
///
/// Every failure is reported as `ModelLoad`; the caller must not start
/// serving without a snapshot.
pub fn load_snapshot(
    path: &Path,
    classes: Arc<ClassSet>,
    dropout: f32,
    device: &Device,
) -> Result<ModelSnapshot> {
    load_snapshot_at(path, INITIAL_VERSION, classes, dropout, device)
}

/// Like [`load_snapshot`], resuming at a version already persisted
pub fn load_snapshot_at(
    path: &Path,
    version: u64,
    classes: Arc<ClassSet>,
    dropout: f32,
    device: &Device,
) -> Result<ModelSnapshot> {
    info!("Loading model parameters from {}", path.display());
    let parameters = load_parameters(path, device)?;
    debug!("Loaded {} tensors", parameters.len());

    let snapshot = ModelSnapshot::new(version, parameters, classes, dropout, device)
        .map_err(|e| match e {
            Error::ModelLoad(msg) => Error::ModelLoad(msg),
            other => Error::ModelLoad(other.to_string()),
        })?;
    info!(
        "Model ready: {} classes, version {}",
        snapshot.classes().len(),
        snapshot.version()
    );
    Ok(snapshot)
}

/// Write parameters to `path`, replacing any existing file atomically
pub fn save_parameters(parameters: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    candle_core::safetensors::save(parameters, &tmp)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "model".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Freshly initialised parameters for a classifier of the given shape
pub fn initialize(config: &NetworkConfig, device: &Device) -> Result<HashMap<String, Tensor>> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    Classifier::new(config, vb)?;

    let vars = varmap
        .data()
        .lock()
        .map_err(|_| Error::internal("variable map lock poisoned"))?;
    vars.iter()
        .map(|(name, var)| -> Result<(String, Tensor)> {
            Ok((name.clone(), var.as_tensor().copy()?.detach()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let classes = Arc::new(ClassSet::default());
        let params = initialize(&NetworkConfig::for_classes(classes.len()), &Device::Cpu).unwrap();

        save_parameters(&params, &path).unwrap();
        assert!(!temp_path(&path).exists());

        let snapshot = load_snapshot(&path, classes, 0.2, &Device::Cpu).unwrap();
        assert_eq!(snapshot.version(), INITIAL_VERSION);
        assert_eq!(snapshot.parameters().len(), params.len());
    }

    #[test]
    fn test_missing_file_is_model_load_failure() {
        let dir = TempDir::new().unwrap();
        let result = load_snapshot(
            &dir.path().join("absent.safetensors"),
            Arc::new(ClassSet::default()),
            0.2,
            &Device::Cpu,
        );
        assert!(matches!(result, Err(Error::ModelLoad(_))));
    }

    #[test]
    fn test_class_count_mismatch_is_model_load_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let params = initialize(&NetworkConfig::for_classes(2), &Device::Cpu).unwrap();
        save_parameters(&params, &path).unwrap();

        let result = load_snapshot(&path, Arc::new(ClassSet::default()), 0.2, &Device::Cpu);
        assert!(matches!(result, Err(Error::ModelLoad(_))));
    }

    #[test]
    fn test_garbage_file_is_model_load_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        std::fs::write(&path, b"not a safetensors file").unwrap();
        let result = load_snapshot(&path, Arc::new(ClassSet::default()), 0.2, &Device::Cpu);
        assert!(matches!(result, Err(Error::ModelLoad(_))));
    }
}
