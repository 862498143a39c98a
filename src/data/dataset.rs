//! IP-Adapter training dataset
//!
//! Streams (image, caption, CLIP image) triples from an [`IndexAdapter`],
//! resizes them into their resolution bucket and attaches the SDXL size
//! conditioning. One call to [`IpAdapterDataset::get_item`] yields one
//! [`TrainingExample`].

use candle_core::{Device, Tensor};
use image::{DynamicImage, ImageBuffer, Rgb};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::caption::{CaptionPolicy, CaptionStats, TagCaptioner, PLACEHOLDER_CAPTION};
use super::config::DatasetConfig;
use super::dropout::{assemble_conditioning, DropoutRates, ImageConditioning};
use super::error::{DataError, Result};
use super::geometry::{to_normalized_tensor, GeometryResolver, ResizeMode, SizeCondPolicy};
use super::index::{attr_string, load_index, IndexAdapter, IndexOpener};
use super::preprocess::{ClipImageProcessor, ImageProcessor};
use super::tagger::DanbooruTagCaptioner;

pub const IMAGE_KEY: &str = "image";

/// Side of the white image substituted for unreadable images
pub const PLACEHOLDER_SIDE: u32 = 256;

/// Size conditioning of one sample, (width, height) / (x, y) order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeConditioning {
    pub original_size: (f64, f64),
    pub target_size: (u32, u32),
    pub crop_offset: (u32, u32),
}

/// One assembled training example. All size tuples are (height, width) and
/// the crop is (top, left), the order SDXL time-ids are built in.
#[derive(Debug, Clone)]
pub struct TrainingExample {
    pub prompt: String,
    /// `[3, H, W]` in `[-1, 1]`
    pub pixels: Tensor,
    /// `[1, 3, S, S]` image-encoder input
    pub clip_image: Tensor,
    pub drop_image_embed: bool,
    /// Prompt was blanked by dropout, not by the caption policy
    pub drop_caption: bool,
    /// Always false: latent caching is not wired in
    pub is_latent: bool,
    pub target_size: (u32, u32),
    pub original_size: (f64, f64),
    pub crop_coords_top_left: (u32, u32),
    pub style: u32,
}

impl TrainingExample {
    /// `[orig_h, orig_w, crop_top, crop_left, target_h, target_w]`
    pub fn time_ids(&self) -> [f32; 6] {
        [
            self.original_size.0 as f32,
            self.original_size.1 as f32,
            self.crop_coords_top_left.0 as f32,
            self.crop_coords_top_left.1 as f32,
            self.target_size.0 as f32,
            self.target_size.1 as f32,
        ]
    }

    /// Original size, target size and crop offset as three `[2]` tensors
    pub fn size_tensors(&self, device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
        let (orig_h, orig_w) = self.original_size;
        let original = Tensor::new(&[orig_h as f32, orig_w as f32], device)?;
        let target = Tensor::new(&[self.target_size.0, self.target_size.1], device)?;
        let (top, left) = self.crop_coords_top_left;
        let crop = Tensor::new(&[top, left], device)?;
        Ok((original, target, crop))
    }
}

pub struct IpAdapterDataset {
    config: DatasetConfig,
    index: Box<dyn IndexAdapter>,
    geometry: GeometryResolver,
    size_policy: SizeCondPolicy,
    captions: CaptionPolicy,
    captioner: Box<dyn TagCaptioner>,
    processor: Box<dyn ImageProcessor>,
    dropout: DropoutRates,
    stats: CaptionStats,
    rng: StdRng,
    device: Device,
}

impl IpAdapterDataset {
    pub fn new(
        config: DatasetConfig,
        index: Box<dyn IndexAdapter>,
        captioner: Box<dyn TagCaptioner>,
        processor: Box<dyn ImageProcessor>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;

        let mode = if config.multireso {
            ResizeMode::Bucketed
        } else {
            ResizeMode::FixedResolution(config.resolution)
        };
        let size_policy = SizeCondPolicy {
            shrink_clamp: config.random_shrink_size_cond,
            merge_square: config.merge_src_cond,
        };
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        if size_policy.merge_square {
            info!(
                "    dataset | Enable merging src condition: {}",
                "(oriW, oriH) --> ((WH)**0.5, (WH)**0.5)"
            );
        }
        if size_policy.shrink_clamp {
            info!(
                "    dataset | Enable shrinking src condition below {}",
                super::geometry::SHRINK_CLAMP_MIN
            );
        }
        info!(
            "    dataset | Enable image_meta_size condition {}",
            "(original_size, target_size, crop_coords)"
        );
        info!(
            "    dataset | Image_transforms: flip={}, normalize=[-1, 1], resize={:?}",
            config.random_flip, mode
        );

        Ok(Self {
            dropout: DropoutRates::from_config(&config)?,
            captions: CaptionPolicy::new(config.caption_key()),
            geometry: GeometryResolver::new(mode),
            size_policy,
            config,
            index,
            captioner,
            processor,
            stats: CaptionStats::new(),
            rng,
            device,
        })
    }

    /// Open the configured index and wire the default captioner and CLIP preprocessor.
    pub fn from_config(
        config: DatasetConfig,
        opener: &dyn IndexOpener,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let index = load_index(&config, opener)?;
        let processor = ClipImageProcessor::new(config.clip_image_size, device.clone());
        Self::new(
            config,
            index,
            Box::new(DanbooruTagCaptioner::default()),
            Box::new(processor),
            device,
        )
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn index(&self) -> &dyn IndexAdapter {
        self.index.as_ref()
    }

    /// Reorder the underlying index for a new epoch.
    pub fn shuffle(&mut self, seed: u64, fast: bool) {
        self.index.shuffle(seed, fast);
    }

    /// Restart the per-sample random stream.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn stats(&self) -> &CaptionStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut CaptionStats {
        &mut self.stats
    }

    /// Raw image, or a white placeholder when it cannot be read.
    pub fn get_raw_image(&self, index: usize, key: &str) -> DynamicImage {
        match self.index.get_image(index, key) {
            Ok(image) => image,
            Err(err) => {
                warn!("    dataset | get_raw_image | Error: {}", err);
                placeholder_image()
            }
        }
    }

    /// Bucketed pixels plus size conditioning in (width, height) order.
    pub fn get_image_with_hwxy(
        &mut self,
        index: usize,
        key: &str,
    ) -> Result<(Tensor, SizeConditioning)> {
        let raw = self.get_raw_image(index, key);
        let resolved = self.geometry.resolve(self.index.as_ref(), index, raw, &mut self.rng)?;

        let flip = self.config.random_flip && self.rng.gen_bool(0.5);
        let pixels = to_normalized_tensor(&resolved.image, flip, &self.device)?;

        let (w, h) = resolved.original_size;
        let conditioning = SizeConditioning {
            original_size: self.size_policy.apply((w as f64, h as f64)),
            target_size: resolved.target_size,
            crop_offset: resolved.crop_offset,
        };
        Ok((pixels, conditioning))
    }

    /// Caption chosen by the caption policy; updates the tag statistics.
    pub fn get_caption(&mut self, index: usize) -> Result<String> {
        self.captions.get_caption(
            self.index.as_ref(),
            index,
            self.captioner.as_ref(),
            &mut self.stats,
            &mut self.rng,
        )
    }

    /// Localized free text, with the placeholder standing in for an empty caption.
    pub fn get_text(&self, index: usize) -> Result<String> {
        let text = attr_string(self.index.as_ref(), index, self.captions.caption_key())?;
        if text.is_empty() {
            Ok(PLACEHOLDER_CAPTION.to_string())
        } else {
            Ok(text)
        }
    }

    /// Learned style slot; every sample uses style 0.
    pub fn get_style(&self, _index: usize) -> u32 {
        0
    }

    /// Caption, CLIP input and dropout flags for `index`.
    pub fn assemble_conditioning(&mut self, index: usize) -> Result<ImageConditioning> {
        let caption = self.get_caption(index)?;
        let condition_image = self.get_raw_image(index, IMAGE_KEY);
        assemble_conditioning(
            caption,
            &condition_image,
            self.processor.as_ref(),
            &self.dropout,
            &mut self.rng,
        )
    }

    pub fn get_item(&mut self, index: usize) -> Result<TrainingExample> {
        if index >= self.len() {
            return Err(DataError::OutOfRange { index, len: self.len() });
        }

        let (pixels, size) = self.get_image_with_hwxy(index, IMAGE_KEY)?;
        let conditioning = self.assemble_conditioning(index)?;

        Ok(TrainingExample {
            prompt: conditioning.prompt,
            pixels,
            clip_image: conditioning.clip_image,
            drop_image_embed: conditioning.drop_image_embed,
            drop_caption: conditioning.drop_caption,
            is_latent: false,
            target_size: swap(size.target_size),
            original_size: swap(size.original_size),
            crop_coords_top_left: swap(size.crop_offset),
            style: self.get_style(index),
        })
    }
}

fn swap<T>(pair: (T, T)) -> (T, T) {
    (pair.1, pair.0)
}

pub fn placeholder_image() -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
        PLACEHOLDER_SIDE,
        PLACEHOLDER_SIDE,
        Rgb([255, 255, 255]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_is_white() {
        let image = placeholder_image().to_rgb8();
        assert_eq!(image.dimensions(), (256, 256));
        assert!(image.pixels().all(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn test_time_ids_order() {
        let example = TrainingExample {
            prompt: String::new(),
            pixels: Tensor::zeros((3, 2, 2), candle_core::DType::F32, &Device::Cpu).unwrap(),
            clip_image: Tensor::zeros((1, 3, 2, 2), candle_core::DType::F32, &Device::Cpu).unwrap(),
            drop_image_embed: false,
            drop_caption: false,
            is_latent: false,
            target_size: (1216, 832),
            original_size: (2000.0, 1500.0),
            crop_coords_top_left: (10, 0),
            style: 0,
        };
        assert_eq!(example.time_ids(), [2000.0, 1500.0, 10.0, 0.0, 1216.0, 832.0]);

        let (original, target, crop) = example.size_tensors(&Device::Cpu).unwrap();
        assert_eq!(original.to_vec1::<f32>().unwrap(), vec![2000.0, 1500.0]);
        assert_eq!(target.to_vec1::<u32>().unwrap(), vec![1216, 832]);
        assert_eq!(crop.to_vec1::<u32>().unwrap(), vec![10, 0]);
    }
}
