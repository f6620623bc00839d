//! Convolutional classifier with a squeeze-and-excitation block.
//!
//! Layout (parameter prefixes in brackets):
//! conv 3x3/2 [conv] -> batch norm [norm] -> relu -> squeeze-excite [se]
//! -> global average pool -> linear [hidden] -> relu -> dropout -> linear [head]

use std::collections::HashMap;

use candle_core::{Module, ModuleT, Result as CandleResult, Tensor};
use candle_nn::{
    batch_norm, conv2d, linear, linear_no_bias, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig,
    Dropout, Linear, VarBuilder,
};
use serde::{Deserialize, Serialize};

use super::Mode;
use crate::error::{Error, Result};

const KERNEL_SIZE: usize = 3;

/// Layer dimensions of the classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub in_channels: usize,
    pub conv_channels: usize,
    /// Bottleneck width of the squeeze-and-excitation block
    pub se_channels: usize,
    pub hidden_units: usize,
    pub num_classes: usize,
    pub dropout: f32,
}

impl NetworkConfig {
    /// Default layer sizes for a given number of output classes
    pub fn for_classes(num_classes: usize) -> Self {
        Self {
            in_channels: 3,
            conv_channels: 16,
            se_channels: 4,
            hidden_units: 32,
            num_classes,
            dropout: 0.2,
        }
    }

    /// Recover layer dimensions from a parameter set.
    ///
    /// Only the shapes needed to size each layer are read here; the remaining
    /// tensors are shape-checked when the network is built from them.
    pub fn infer(parameters: &HashMap<String, Tensor>, dropout: f32) -> Result<Self> {
        let dims = |name: &str| -> Result<Vec<usize>> {
            parameters
                .get(name)
                .map(|t| t.dims().to_vec())
                .ok_or_else(|| Error::ModelLoad(format!("missing parameter '{}'", name)))
        };

        let conv = dims("conv.weight")?;
        let (conv_channels, in_channels) = match conv.as_slice() {
            [out, inp, kh, kw] if *kh == KERNEL_SIZE && *kw == KERNEL_SIZE => (*out, *inp),
            other => {
                return Err(Error::ModelLoad(format!(
                    "conv.weight must be [C, C_in, {k}, {k}], got {:?}",
                    other,
                    k = KERNEL_SIZE
                )))
            }
        };
        let se_channels = match dims("se.fc1.weight")?.as_slice() {
            [squeezed, c] if *c == conv_channels => *squeezed,
            other => {
                return Err(Error::ModelLoad(format!(
                    "se.fc1.weight must be [S, {}], got {:?}",
                    conv_channels, other
                )))
            }
        };
        let hidden_units = match dims("hidden.weight")?.as_slice() {
            [h, c] if *c == conv_channels => *h,
            other => {
                return Err(Error::ModelLoad(format!(
                    "hidden.weight must be [H, {}], got {:?}",
                    conv_channels, other
                )))
            }
        };
        let num_classes = match dims("head.weight")?.as_slice() {
            [k, h] if *h == hidden_units => *k,
            other => {
                return Err(Error::ModelLoad(format!(
                    "head.weight must be [K, {}], got {:?}",
                    hidden_units, other
                )))
            }
        };

        Ok(Self {
            in_channels,
            conv_channels,
            se_channels,
            hidden_units,
            num_classes,
            dropout,
        })
    }
}

/// Channel attention: rescales each feature map by a learned gate.
#[derive(Debug, Clone)]
pub struct SqueezeExcite {
    fc1: Linear,
    fc2: Linear,
}

impl SqueezeExcite {
    pub fn new(channels: usize, squeezed: usize, vb: VarBuilder) -> CandleResult<Self> {
        Ok(Self {
            fc1: linear_no_bias(channels, squeezed, vb.pp("fc1"))?,
            fc2: linear_no_bias(squeezed, channels, vb.pp("fc2"))?,
        })
    }
}

impl Module for SqueezeExcite {
    fn forward(&self, xs: &Tensor) -> CandleResult<Tensor> {
        let (b, c, _, _) = xs.dims4()?;
        let gate = xs.mean((2, 3))?;
        let gate = self.fc1.forward(&gate)?.relu()?;
        let gate = sigmoid(&self.fc2.forward(&gate)?)?;
        xs.broadcast_mul(&gate.reshape((b, c, 1, 1))?)
    }
}

fn sigmoid(xs: &Tensor) -> CandleResult<Tensor> {
    xs.neg()?.exp()?.affine(1.0, 1.0)?.recip()
}

/// The scan classifier. Holds no mode of its own; callers pass one per call.
#[derive(Debug, Clone)]
pub struct Classifier {
    conv: Conv2d,
    norm: BatchNorm,
    se: SqueezeExcite,
    hidden: Linear,
    head: Linear,
    dropout: Dropout,
    config: NetworkConfig,
}

impl Classifier {
    pub fn new(config: &NetworkConfig, vb: VarBuilder) -> CandleResult<Self> {
        let conv_config = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(
                config.in_channels,
                config.conv_channels,
                KERNEL_SIZE,
                conv_config,
                vb.pp("conv"),
            )?,
            norm: batch_norm(config.conv_channels, BatchNormConfig::default(), vb.pp("norm"))?,
            se: SqueezeExcite::new(config.conv_channels, config.se_channels, vb.pp("se"))?,
            hidden: linear(config.conv_channels, config.hidden_units, vb.pp("hidden"))?,
            head: linear(config.hidden_units, config.num_classes, vb.pp("head"))?,
            dropout: Dropout::new(config.dropout),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Logits of shape `[N, num_classes]` for input `[N, C, H, W]`
    pub fn forward_t(&self, xs: &Tensor, mode: Mode) -> CandleResult<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = self.norm.forward_t(&xs, mode.uses_batch_statistics())?;
        let xs = self.se.forward(&xs.relu()?)?;
        let xs = xs.mean((2, 3))?;
        let xs = self.hidden.forward(&xs)?.relu()?;
        let xs = self.dropout.forward(&xs, mode.is_training())?;
        self.head.forward(&xs)
    }
}

/// Whether a parameter is a normalisation running statistic rather than a
/// trainable weight
pub fn is_running_statistic(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(config: &NetworkConfig) -> (VarMap, Classifier) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = Classifier::new(config, vb).unwrap();
        (varmap, net)
    }

    #[test]
    fn test_forward_shapes() {
        let config = NetworkConfig::for_classes(4);
        let (_, net) = build(&config);
        let xs = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &Device::Cpu).unwrap();
        let logits = net.forward_t(&xs, Mode::Inference).unwrap();
        assert_eq!(logits.dims(), &[2, 4]);
    }

    #[test]
    fn test_parameter_names_and_inference() {
        let config = NetworkConfig::for_classes(3);
        let (varmap, _) = build(&config);
        let params: HashMap<String, Tensor> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.as_tensor().clone()))
            .collect();

        for name in ["conv.weight", "conv.bias", "norm.running_mean", "norm.running_var"] {
            assert!(params.contains_key(name), "missing {}", name);
        }
        assert!(is_running_statistic("norm.running_var"));
        assert!(!is_running_statistic("norm.weight"));

        let inferred = NetworkConfig::infer(&params, config.dropout).unwrap();
        assert_eq!(inferred, config);
    }

    #[test]
    fn test_infer_rejects_missing_head() {
        let config = NetworkConfig::for_classes(3);
        let (varmap, _) = build(&config);
        let mut params: HashMap<String, Tensor> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.as_tensor().clone()))
            .collect();
        params.remove("head.weight");
        assert!(matches!(
            NetworkConfig::infer(&params, 0.0),
            Err(Error::ModelLoad(_))
        ));
    }

    #[test]
    fn test_inference_is_deterministic() {
        let config = NetworkConfig::for_classes(4);
        let (_, net) = build(&config);
        let xs = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let a: Vec<Vec<f32>> = net.forward_t(&xs, Mode::Inference).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = net.forward_t(&xs, Mode::Inference).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
    }
}
