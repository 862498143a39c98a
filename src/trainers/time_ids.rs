use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};

use crate::data::TrainingExample;

/// SDXL added time-ids for one image:
/// original_height, original_width, crop_top, crop_left, target_height, target_width
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeIds {
    pub original_height: f32,
    pub original_width: f32,
    pub crop_top: f32,
    pub crop_left: f32,
    pub target_height: f32,
    pub target_width: f32,
}

impl TimeIds {
    /// Uncropped image rendered at its own size
    pub fn new(target_height: usize, target_width: usize) -> Self {
        Self {
            original_height: target_height as f32,
            original_width: target_width as f32,
            crop_top: 0.0,
            crop_left: 0.0,
            target_height: target_height as f32,
            target_width: target_width as f32,
        }
    }

    pub fn to_array(&self) -> [f32; 6] {
        [
            self.original_height,
            self.original_width,
            self.crop_top,
            self.crop_left,
            self.target_height,
            self.target_width,
        ]
    }

    pub fn to_tensor(&self, device: &Device, dtype: DType) -> Result<Tensor> {
        Tensor::from_vec(self.to_array().to_vec(), (6,), device)?
            .to_dtype(dtype)
            .context("Failed to convert time_ids dtype")
    }

    /// Crop offsets must be non-negative.
    ///
    /// The crop is taken from the resized image, not the original, so the
    /// crop window is not checked against the original size.
    pub fn validate(&self) -> Result<()> {
        if self.crop_top < 0.0 || self.crop_left < 0.0 {
            anyhow::bail!("Crop coordinates must be non-negative");
        }
        if self.target_height <= 0.0 || self.target_width <= 0.0 {
            anyhow::bail!(
                "Target size must be positive, got {}x{}",
                self.target_height,
                self.target_width
            );
        }
        Ok(())
    }

    /// `[B, 6]` tensor for a batch
    pub fn batch(ids: &[TimeIds], device: &Device, dtype: DType) -> Result<Tensor> {
        if ids.is_empty() {
            anyhow::bail!("Cannot generate batch time_ids from empty configs");
        }
        let mut values = Vec::with_capacity(ids.len() * 6);
        for id in ids {
            id.validate()?;
            values.extend_from_slice(&id.to_array());
        }
        Tensor::from_vec(values, (ids.len(), 6), device)?
            .to_dtype(dtype)
            .context("Failed to convert batch time_ids dtype")
    }
}

impl From<&TrainingExample> for TimeIds {
    fn from(example: &TrainingExample) -> Self {
        let [original_height, original_width, crop_top, crop_left, target_height, target_width] =
            example.time_ids();
        Self {
            original_height,
            original_width,
            crop_top,
            crop_left,
            target_height,
            target_width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_ids_generation() -> Result<()> {
        let time_ids = TimeIds::new(1024, 1024).to_tensor(&Device::Cpu, DType::F32)?;
        assert_eq!(time_ids.dims(), &[6]);
        assert_eq!(time_ids.to_vec1::<f32>()?, vec![1024.0, 1024.0, 0.0, 0.0, 1024.0, 1024.0]);
        Ok(())
    }

    #[test]
    fn test_batch() -> Result<()> {
        let ids = [TimeIds::new(1216, 832), TimeIds::new(1216, 832)];
        let tensor = TimeIds::batch(&ids, &Device::Cpu, DType::F32)?;
        assert_eq!(tensor.dims(), &[2, 6]);
        assert!(TimeIds::batch(&[], &Device::Cpu, DType::F32).is_err());
        Ok(())
    }

    #[test]
    fn test_validation() {
        let mut ids = TimeIds::new(512, 512);
        ids.crop_top = -1.0;
        assert!(ids.validate().is_err());
    }
}
