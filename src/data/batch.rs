//! Collation of training examples into batches

use candle_core::{Device, Tensor};

use super::dataset::{IpAdapterDataset, TrainingExample};
use super::error::{DataError, Result};

#[derive(Debug, Clone)]
pub struct TrainingBatch {
    pub prompts: Vec<String>,
    /// `[B, 3, H, W]`
    pub pixels: Tensor,
    /// `[B, 3, S, S]`
    pub clip_images: Tensor,
    /// `[B]` u8, 1 where the image embedding must be zeroed
    pub drop_image_embeds: Tensor,
    /// `[B]` u8, 1 where dropout blanked the prompt
    pub drop_captions: Tensor,
    /// `[B, 6]` SDXL time-ids
    pub time_ids: Tensor,
    pub is_latent: bool,
}

impl TrainingBatch {
    /// Stack examples that share one bucket.
    pub fn collate(examples: &[TrainingExample], device: &Device) -> Result<Self> {
        let first = examples
            .first()
            .ok_or_else(|| DataError::Config("cannot collate an empty batch".into()))?;

        if let Some(other) = examples.iter().find(|e| e.target_size != first.target_size) {
            return Err(DataError::Config(format!(
                "batch mixes buckets {:?} and {:?}",
                first.target_size, other.target_size
            )));
        }

        let pixels: Vec<&Tensor> = examples.iter().map(|e| &e.pixels).collect();
        let clip_images: Vec<&Tensor> = examples.iter().map(|e| &e.clip_image).collect();
        let drops: Vec<u8> = examples.iter().map(|e| e.drop_image_embed as u8).collect();
        let caption_drops: Vec<u8> = examples.iter().map(|e| e.drop_caption as u8).collect();
        let time_ids: Vec<f32> = examples.iter().flat_map(|e| e.time_ids()).collect();

        Ok(Self {
            prompts: examples.iter().map(|e| e.prompt.clone()).collect(),
            pixels: Tensor::stack(&pixels, 0)?.to_device(device)?,
            clip_images: Tensor::cat(&clip_images, 0)?.to_device(device)?,
            drop_image_embeds: Tensor::from_vec(drops, examples.len(), device)?,
            drop_captions: Tensor::from_vec(caption_drops, examples.len(), device)?,
            time_ids: Tensor::from_vec(time_ids, (examples.len(), 6), device)?,
            is_latent: examples.iter().any(|e| e.is_latent),
        })
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

/// Sequential batches over a dataset, one bucketed run at a time.
///
/// Assumes the index lays positions out in single-bucket runs of
/// `batch_size`, as bucketed indices do.
pub struct BatchIter<'a> {
    dataset: &'a mut IpAdapterDataset,
    batch_size: usize,
    position: usize,
    device: Device,
}

impl<'a> BatchIter<'a> {
    pub fn new(dataset: &'a mut IpAdapterDataset, batch_size: usize, device: Device) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            position: 0,
            device,
        }
    }
}

impl Iterator for BatchIter<'_> {
    type Item = Result<TrainingBatch>;

    /// Drops a trailing partial batch.
    fn next(&mut self) -> Option<Self::Item> {
        let end = self.position + self.batch_size;
        if end > self.dataset.len() {
            return None;
        }
        let examples: Result<Vec<TrainingExample>> =
            (self.position..end).map(|i| self.dataset.get_item(i)).collect();
        self.position = end;
        Some(examples.and_then(|examples| TrainingBatch::collate(&examples, &self.device)))
    }
}
