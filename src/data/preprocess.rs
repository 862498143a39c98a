//! Image-feature preprocessing for the image-conditioning branch

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use super::error::{DataError, Result};

pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Turns a raw image into the fixed-shape tensor the image encoder expects.
pub trait ImageProcessor: Send {
    fn preprocess(&self, image: &DynamicImage) -> Result<Tensor>;

    /// Shape of every tensor returned by `preprocess`
    fn output_shape(&self) -> Vec<usize>;
}

/// CLIP vision preprocessing: shortest-edge resize, centre crop, rescale, normalise.
/// Output is `[1, 3, size, size]` `f32`.
#[derive(Debug, Clone)]
pub struct ClipImageProcessor {
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    device: Device,
}

impl ClipImageProcessor {
    pub fn new(size: u32, device: Device) -> Self {
        Self {
            size,
            mean: CLIP_MEAN,
            std: CLIP_STD,
            device,
        }
    }
}

impl ImageProcessor for ClipImageProcessor {
    fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DataError::Preprocess("empty image".into()));
        }

        let size = self.size;
        let scale = size as f64 / width.min(height) as f64;
        let new_w = ((width as f64 * scale).round() as u32).max(size);
        let new_h = ((height as f64 * scale).round() as u32).max(size);
        let resized = image.resize_exact(new_w, new_h, FilterType::CatmullRom);
        let left = (new_w - size) / 2;
        let top = (new_h - size) / 2;
        let rgb = resized.crop_imm(left, top, size, size).to_rgb8();

        let side = size as usize;
        let plane = side * side;
        let mut data = vec![0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * side + x as usize;
            for c in 0..3 {
                data[c * plane + offset] = (pixel[c] as f32 / 255.0 - self.mean[c]) / self.std[c];
            }
        }

        Ok(Tensor::from_vec(data, (1, 3, side, side), &self.device)?)
    }

    fn output_shape(&self) -> Vec<usize> {
        let side = self.size as usize;
        vec![1, 3, side, side]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::test_support::solid;

    #[test]
    fn test_clip_shape_for_any_aspect() {
        let processor = ClipImageProcessor::new(32, Device::Cpu);
        for (w, h) in [(64, 64), (300, 50), (20, 90)] {
            let tensor = processor.preprocess(&solid(w, h, 128)).unwrap();
            assert_eq!(tensor.dims(), processor.output_shape().as_slice());
        }
    }

    #[test]
    fn test_clip_normalisation() {
        let processor = ClipImageProcessor::new(8, Device::Cpu);
        let tensor = processor.preprocess(&solid(16, 16, 255)).unwrap();
        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let expected_red = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        assert!((values[0] - expected_red).abs() < 1e-4);
        let expected_blue = (1.0 - CLIP_MEAN[2]) / CLIP_STD[2];
        assert!((values[values.len() - 1] - expected_blue).abs() < 1e-4);
    }
}
