//! Bucket geometry: resize/crop and size conditioning
//!
//! Resolves the target bucket for a sample, delegates the resize and crop to
//! the index, and derives the (original, target, crop) triple that SDXL uses
//! as micro-conditioning.

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use rand::{Rng, RngCore};

use super::error::{DataError, Result};
use super::index::{CropType, IndexAdapter};

/// Side below which `shrink_clamp` lifts the original size
pub const SHRINK_CLAMP_MIN: f64 = 1024.0;

/// How the target geometry of a sample is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    /// Target size comes from the index's bucket assignment
    Bucketed,
    /// Square crop at a fixed resolution. Not implemented.
    FixedResolution(u32),
}

/// Adjustments applied to the original size before it is used as conditioning.
/// They never change the actual crop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeCondPolicy {
    pub shrink_clamp: bool,
    pub merge_square: bool,
}

impl SizeCondPolicy {
    /// Clamp first, then merge into a square of equal area.
    pub fn apply(&self, origin: (f64, f64)) -> (f64, f64) {
        let mut origin = origin;
        if self.shrink_clamp {
            origin = (origin.0.max(SHRINK_CLAMP_MIN), origin.1.max(SHRINK_CLAMP_MIN));
        }
        if self.merge_square {
            let side = (origin.0 * origin.1).sqrt();
            origin = (side, side);
        }
        origin
    }
}

/// Output of the geometry stage, all sizes in (width, height) order
#[derive(Debug, Clone)]
pub struct ResolvedGeometry {
    pub image: DynamicImage,
    pub original_size: (u32, u32),
    pub target_size: (u32, u32),
    pub crop_offset: (u32, u32),
}

#[derive(Debug, Clone, Copy)]
pub struct GeometryResolver {
    mode: ResizeMode,
}

impl GeometryResolver {
    pub fn new(mode: ResizeMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ResizeMode {
        self.mode
    }

    pub fn resolve(
        &self,
        index: &dyn IndexAdapter,
        position: usize,
        raw: DynamicImage,
        rng: &mut dyn RngCore,
    ) -> Result<ResolvedGeometry> {
        let original_size = raw.dimensions();

        match self.mode {
            ResizeMode::Bucketed => {
                let target_size = index.get_target_size(position)?;
                let (image, crop_offset) = index.resize_and_crop(
                    &raw,
                    target_size,
                    FilterType::Lanczos3,
                    CropType::Random,
                    rng,
                )?;
                Ok(ResolvedGeometry {
                    image,
                    original_size,
                    target_size,
                    crop_offset,
                })
            }
            ResizeMode::FixedResolution(resolution) => Err(DataError::UnsupportedMode(format!(
                "fixed {}x{} resizing is not implemented, enable multireso bucketing",
                resolution, resolution
            ))),
        }
    }
}

/// Scale `image` so it covers `target` then crop a `target`-sized window.
///
/// Returns the crop and its (x, y) offset; the offset never exceeds
/// `resized - target` on either axis.
pub fn cover_resize_and_crop(
    image: &DynamicImage,
    target: (u32, u32),
    filter: FilterType,
    crop: CropType,
    rng: &mut dyn RngCore,
) -> Result<(DynamicImage, (u32, u32))> {
    let (width, height) = image.dimensions();
    let (target_w, target_h) = target;
    if width == 0 || height == 0 || target_w == 0 || target_h == 0 {
        return Err(DataError::Preprocess(format!(
            "cannot crop {}x{} image to {}x{}",
            width, height, target_w, target_h
        )));
    }

    let scale = (target_w as f64 / width as f64).max(target_h as f64 / height as f64);
    let new_w = ((width as f64 * scale).round() as u32).max(target_w);
    let new_h = ((height as f64 * scale).round() as u32).max(target_h);

    let resized = if (new_w, new_h) == (width, height) {
        image.clone()
    } else {
        image.resize_exact(new_w, new_h, filter)
    };

    let (max_x, max_y) = (new_w - target_w, new_h - target_h);
    let (x, y) = match crop {
        CropType::Random => (rng.gen_range(0..=max_x), rng.gen_range(0..=max_y)),
        CropType::Center => (max_x / 2, max_y / 2),
    };

    Ok((resized.crop_imm(x, y, target_w, target_h), (x, y)))
}

/// RGB image to a CHW `f32` tensor in `[-1, 1]`, optionally mirrored.
pub fn to_normalized_tensor(image: &DynamicImage, flip: bool, device: &Device) -> Result<Tensor> {
    let rgb = if flip { image.fliph().to_rgb8() } else { image.to_rgb8() };
    let (width, height) = rgb.dimensions();
    let (w, h) = (width as usize, height as usize);

    let mut data = vec![0f32; 3 * h * w];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = y as usize * w + x as usize;
        for c in 0..3 {
            data[c * h * w + offset] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }

    Ok(Tensor::from_vec(data, (3, h, w), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::test_support::solid;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_shrink_clamp() {
        let policy = SizeCondPolicy { shrink_clamp: true, merge_square: false };
        assert_eq!(policy.apply((512.0, 2000.0)), (1024.0, 2000.0));
        assert_eq!(policy.apply((1500.0, 1100.0)), (1500.0, 1100.0));
    }

    #[test]
    fn test_merge_square() {
        let policy = SizeCondPolicy { shrink_clamp: false, merge_square: true };
        assert_eq!(policy.apply((800.0, 200.0)), (400.0, 400.0));
    }

    #[test]
    fn test_clamp_then_merge() {
        let policy = SizeCondPolicy { shrink_clamp: true, merge_square: true };
        // (512, 4096) -> (1024, 4096) -> sqrt(1024 * 4096) = 2048
        assert_eq!(policy.apply((512.0, 4096.0)), (2048.0, 2048.0));
    }

    #[test]
    fn test_cover_crop_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let image = solid(300, 100, 10);
        for _ in 0..20 {
            let (crop, (x, y)) = cover_resize_and_crop(
                &image,
                (128, 128),
                FilterType::Triangle,
                CropType::Random,
                &mut rng,
            )
            .unwrap();
            assert_eq!(crop.dimensions(), (128, 128));
            // resized to 384x128
            assert!(x <= 384 - 128);
            assert_eq!(y, 0);
        }
    }

    #[test]
    fn test_center_crop_offset() {
        let mut rng = StdRng::seed_from_u64(0);
        let image = solid(100, 400, 10);
        let (crop, offset) = cover_resize_and_crop(
            &image,
            (64, 64),
            FilterType::Triangle,
            CropType::Center,
            &mut rng,
        )
        .unwrap();
        assert_eq!(crop.dimensions(), (64, 64));
        assert_eq!(offset, (0, (256 - 64) / 2));
    }

    #[test]
    fn test_normalized_tensor_range() {
        let device = Device::Cpu;
        let white = to_normalized_tensor(&solid(4, 2, 255), false, &device).unwrap();
        assert_eq!(white.dims(), &[3, 2, 4]);
        let values = white.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 1.0).abs() < 1e-6));

        let black = to_normalized_tensor(&solid(4, 2, 0), true, &device).unwrap();
        let values = black.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v + 1.0).abs() < 1e-6));
    }
}
