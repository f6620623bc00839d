//! Image decoding and normalisation shared by prediction, fine-tuning and
//! evaluation.

use std::path::Path;

use candle_core::{Device, Tensor};
use image::{imageops::FilterType, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Image preprocessing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Target width and height in pixels
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    /// Mean values for normalization [R, G, B]
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    /// Std values for normalization [R, G, B]
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

/// Largest accepted `image_size`
pub const MAX_IMAGE_SIZE: usize = 4096;

fn default_image_size() -> usize {
    224
}

fn default_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}

fn default_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            image_size: default_image_size(),
            mean: default_mean(),
            std: default_std(),
        }
    }
}

/// Turns encoded images into `[1, 3, H, W]` float tensors
#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
    device: Device,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig, device: Device) -> Self {
        Self { config, device }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Decode image bytes (any format the `image` crate recognises)
    pub fn decode(&self, bytes: &[u8]) -> Result<Tensor> {
        if bytes.is_empty() {
            return Err(Error::InvalidImage("empty image payload".into()));
        }
        let img = image::load_from_memory(bytes)
            .map_err(|e| Error::InvalidImage(format!("failed to decode image: {}", e)))?;
        self.from_rgb(&img.to_rgb8())
    }

    /// Load and preprocess an image file
    pub fn load(&self, path: &Path) -> Result<Tensor> {
        debug!("Loading image from: {}", path.display());
        let img = image::open(path)
            .map_err(|e| Error::InvalidImage(format!("{}: {}", path.display(), e)))?;
        self.from_rgb(&img.to_rgb8())
    }

    /// Resize, scale to [0, 1], and normalise an RGB image
    pub fn from_rgb(&self, img: &RgbImage) -> Result<Tensor> {
        if img.width() == 0 || img.height() == 0 {
            return Err(Error::InvalidImage("image has no pixels".into()));
        }
        let size = u32::try_from(self.config.image_size)
            .map_err(|_| Error::Config(format!("image_size {} out of range", self.config.image_size)))?;
        let resized = image::imageops::resize(img, size, size, FilterType::Triangle);

        let (width, height) = resized.dimensions();
        let pixels: Vec<f32> = resized
            .into_raw()
            .into_iter()
            .map(|x| x as f32 / 255.0)
            .collect();

        let tensor = Tensor::from_vec(pixels, (height as usize, width as usize, 3), &self.device)?
            .permute((2, 0, 1))?;
        let mean = Tensor::from_slice(&self.config.mean, (3, 1, 1), &self.device)?;
        let std = Tensor::from_slice(&self.config.std, (3, 1, 1), &self.device)?;

        Ok(tensor
            .broadcast_sub(&mean)?
            .broadcast_div(&std)?
            .unsqueeze(0)?
            .contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn preprocessor(size: usize) -> Preprocessor {
        Preprocessor::new(
            PreprocessConfig {
                image_size: size,
                ..Default::default()
            },
            Device::Cpu,
        )
    }

    #[test]
    fn test_decode_shape() {
        let tensor = preprocessor(32).decode(&png_bytes(50, 20, [10, 20, 30])).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 32, 32]);
    }

    #[test]
    fn test_normalisation_values() {
        let tensor = preprocessor(4).decode(&png_bytes(4, 4, [255, 0, 255])).unwrap();
        let values: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        let red = (1.0 - 0.485) / 0.229;
        let green = (0.0 - 0.456) / 0.224;
        assert!((values[0] - red).abs() < 1e-4);
        assert!((values[16] - green).abs() < 1e-4);
    }

    #[test]
    fn test_rejects_garbage_and_empty() {
        let pre = preprocessor(8);
        assert!(matches!(pre.decode(b""), Err(Error::InvalidImage(_))));
        assert!(matches!(
            pre.decode(b"definitely not an image"),
            Err(Error::InvalidImage(_))
        ));
    }
}
