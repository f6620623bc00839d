//! Immutable, versioned parameter sets handed to readers.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use chrono::{DateTime, Utc};

use super::network::{Classifier, NetworkConfig};
use super::Mode;
use crate::classes::ClassSet;
use crate::error::{Error, Result};

/// A published model version.
///
/// Construction builds the inference network once from the parameters;
/// nothing reachable from a snapshot is ever written afterwards, so any
/// number of threads may run forward passes against the same `Arc<ModelSnapshot>`.
#[derive(Debug)]
pub struct ModelSnapshot {
    version: u64,
    created_at: DateTime<Utc>,
    parameters: HashMap<String, Tensor>,
    network: Classifier,
    classes: Arc<ClassSet>,
    device: Device,
}

impl ModelSnapshot {
    /// Build a snapshot from a full parameter set.
    ///
    /// Tensors are moved to `device` as `f32`. Fails if the parameters do not
    /// describe a classifier over exactly `classes`.
    pub fn new(
        version: u64,
        parameters: HashMap<String, Tensor>,
        classes: Arc<ClassSet>,
        dropout: f32,
        device: &Device,
    ) -> Result<Self> {
        let parameters = parameters
            .into_iter()
            .map(|(name, tensor)| -> Result<(String, Tensor)> {
                let tensor = tensor.to_dtype(DType::F32)?.to_device(device)?;
                Ok((name, tensor))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let config = NetworkConfig::infer(&parameters, dropout)?;
        if config.num_classes != classes.len() {
            return Err(Error::ModelLoad(format!(
                "model has {} outputs but {} classes are configured",
                config.num_classes,
                classes.len()
            )));
        }

        let vb = VarBuilder::from_tensors(parameters.clone(), DType::F32, device);
        let network = Classifier::new(&config, vb)
            .map_err(|e| Error::ModelLoad(format!("parameter set rejected: {}", e)))?;

        Ok(Self {
            version,
            created_at: Utc::now(),
            parameters,
            network,
            classes,
            device: device.clone(),
        })
    }

    /// Same parameters published under a new version number
    pub(crate) fn republish(&self, version: u64) -> Result<Self> {
        Self::new(
            version,
            self.parameters.clone(),
            Arc::clone(&self.classes),
            self.network.config().dropout,
            &self.device,
        )
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Snapshots are always inference-ready
    pub fn mode(&self) -> Mode {
        Mode::Inference
    }

    pub fn parameters(&self) -> &HashMap<String, Tensor> {
        &self.parameters
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    pub fn shared_classes(&self) -> Arc<ClassSet> {
        Arc::clone(&self.classes)
    }

    pub fn config(&self) -> &NetworkConfig {
        self.network.config()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Raw logits for a validated `[N, C, H, W]` batch
    pub(crate) fn logits(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.network.forward_t(xs, Mode::Inference)?)
    }
}
