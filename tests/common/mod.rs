#![allow(dead_code)]

use candle_core::Device;
use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Rgb};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use serde_json::{Map, Value};

use eridiffusion_ipa::data::geometry::cover_resize_and_crop;
use eridiffusion_ipa::data::{
    ClipImageProcessor, CropType, DanbooruTagCaptioner, DataError, DatasetConfig, IndexAdapter,
    IpAdapterDataset, Result,
};

pub struct FakeItem {
    pub image: DynamicImage,
    pub bucket: (u32, u32),
    pub attributes: Map<String, Value>,
}

/// In-memory index; `fail_images` makes every image read fail.
pub struct FakeIndex {
    pub items: Vec<FakeItem>,
    pub order: Vec<usize>,
    pub fail_images: bool,
}

impl FakeIndex {
    pub fn new(items: Vec<FakeItem>) -> Self {
        let order = (0..items.len()).collect();
        Self { items, order, fail_images: false }
    }

    fn item(&self, index: usize) -> Result<&FakeItem> {
        self.order
            .get(index)
            .map(|&i| &self.items[i])
            .ok_or(DataError::OutOfRange { index, len: self.order.len() })
    }
}

impl IndexAdapter for FakeIndex {
    fn len(&self) -> usize {
        self.order.len()
    }

    fn shuffle(&mut self, seed: u64, _fast: bool) {
        self.order.shuffle(&mut StdRng::seed_from_u64(seed));
    }

    fn get_image(&self, index: usize, key: &str) -> Result<DynamicImage> {
        if self.fail_images {
            return Err(DataError::image_fetch(index, key, "archive read failed"));
        }
        Ok(self.item(index)?.image.clone())
    }

    fn get_attribute(&self, index: usize, key: &str) -> Result<Value> {
        self.item(index)?
            .attributes
            .get(key)
            .cloned()
            .ok_or_else(|| DataError::attribute(index, key, "missing"))
    }

    fn get_target_size(&self, index: usize) -> Result<(u32, u32)> {
        Ok(self.item(index)?.bucket)
    }

    fn resize_and_crop(
        &self,
        image: &DynamicImage,
        target_size: (u32, u32),
        resample: FilterType,
        crop: CropType,
        rng: &mut dyn RngCore,
    ) -> Result<(DynamicImage, (u32, u32))> {
        cover_resize_and_crop(image, target_size, resample, crop, rng)
    }
}

pub fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
}

pub fn item(width: u32, height: u32, bucket: (u32, u32), attributes: Value) -> FakeItem {
    FakeItem {
        image: gradient(width, height),
        bucket,
        attributes: attributes.as_object().cloned().unwrap_or_default(),
    }
}

pub fn bucketed_config(seed: u64) -> DatasetConfig {
    let mut config = DatasetConfig::new(std::path::PathBuf::from("unused.json"));
    config.multireso = true;
    config.seed = Some(seed);
    config.clip_image_size = 16;
    config
}

pub fn dataset(config: DatasetConfig, index: FakeIndex) -> IpAdapterDataset {
    let processor = ClipImageProcessor::new(config.clip_image_size, Device::Cpu);
    IpAdapterDataset::new(
        config,
        Box::new(index),
        Box::new(DanbooruTagCaptioner::default()),
        Box::new(processor),
        Device::Cpu,
    )
    .unwrap()
}

/// Rng whose `gen::<f64>()` yields the scripted values in order
pub struct Draws(std::vec::IntoIter<f64>);

impl Draws {
    pub fn new(values: &[f64]) -> Self {
        Draws(values.to_vec().into_iter())
    }
}

impl RngCore for Draws {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        let value = self.0.next().expect("ran out of scripted draws");
        ((value * (1u64 << 53) as f64) as u64) << 11
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
