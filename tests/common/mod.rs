//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use scanserve_core::{
    classes::ClassSet,
    inference::{PreprocessConfig, Preprocessor},
    model::{checkpoint, NetworkConfig},
    training::{FineTuneConfig, FineTunePipeline, OptimizerKind},
    ModelSnapshot, ModelStateManager,
};

pub const IMAGE_SIZE: usize = 16;

pub fn classes() -> Arc<ClassSet> {
    Arc::new(ClassSet::new(["A", "B", "C", "D"]).unwrap())
}

/// Freshly initialised snapshot at `version`, dropout disabled
pub fn snapshot(version: u64) -> ModelSnapshot {
    snapshot_with_dropout(version, 0.0)
}

pub fn snapshot_with_dropout(version: u64, dropout: f32) -> ModelSnapshot {
    let classes = classes();
    let network = NetworkConfig {
        dropout,
        ..NetworkConfig::for_classes(classes.len())
    };
    let params = checkpoint::initialize(&network, &Device::Cpu).unwrap();
    ModelSnapshot::new(version, params, classes, dropout, &Device::Cpu).unwrap()
}

pub fn manager() -> Arc<ModelStateManager> {
    Arc::new(ModelStateManager::new(snapshot(checkpoint::INITIAL_VERSION)))
}

pub fn preprocessor() -> Arc<Preprocessor> {
    let config = PreprocessConfig {
        image_size: IMAGE_SIZE,
        ..Default::default()
    };
    Arc::new(Preprocessor::new(config, Device::Cpu))
}

/// PNG-encoded image with a gradient so inputs are not constant
pub fn png_bytes(seed: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(24, 24, |x, y| {
        Rgb([
            (x as u8).wrapping_mul(9).wrapping_add(seed),
            (y as u8).wrapping_mul(7),
            ((x + y) as u8).wrapping_mul(5).wrapping_add(seed / 2),
        ])
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn input(seed: u8) -> Tensor {
    preprocessor().decode(&png_bytes(seed)).unwrap()
}

/// Settings under which one step is a plain gradient step on the exact
/// function used for inference
pub fn sgd_config() -> FineTuneConfig {
    FineTuneConfig {
        learning_rate: 1e-3,
        training_learning_rate: 1e-2,
        optimizer: OptimizerKind::Sgd,
        update_norm_statistics: false,
        ..Default::default()
    }
}

pub fn pipeline(manager: &Arc<ModelStateManager>, config: FineTuneConfig) -> FineTunePipeline {
    FineTunePipeline::new(Arc::clone(manager), preprocessor(), config)
}
