//! Classifier-free-guidance dropout for the image and text conditioning

use candle_core::Tensor;
use image::DynamicImage;
use rand::Rng;

use super::config::DatasetConfig;
use super::error::{DataError, Result};
use super::preprocess::ImageProcessor;

/// Threshold-partitioned drop rates. One uniform draw `r` selects at most one
/// outcome: `[0, i)` drops the image embedding, `[i, i+t)` blanks the caption,
/// `[i+t, i+t+ti)` does both.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropoutRates {
    pub image: f64,
    pub text: f64,
    pub both: f64,
}

impl Default for DropoutRates {
    fn default() -> Self {
        Self {
            image: 0.05,
            text: 0.05,
            both: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropDecision {
    pub drop_image: bool,
    pub drop_caption: bool,
}

impl DropoutRates {
    pub fn new(image: f64, text: f64, both: f64) -> Result<Self> {
        let rates = Self { image, text, both };
        for rate in [image, text, both] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(DataError::Config(format!("drop rate {} outside [0, 1]", rate)));
            }
        }
        if image + text + both > 1.0 + 1e-9 {
            return Err(DataError::Config(format!(
                "drop rates sum to {}, must be at most 1",
                image + text + both
            )));
        }
        Ok(rates)
    }

    pub fn from_config(config: &DatasetConfig) -> Result<Self> {
        Self::new(config.i_drop_rate, config.t_drop_rate, config.ti_drop_rate)
    }

    pub fn decide(&self, r: f64) -> DropDecision {
        if r < self.image {
            DropDecision { drop_image: true, drop_caption: false }
        } else if r < self.image + self.text {
            DropDecision { drop_image: false, drop_caption: true }
        } else if r < self.image + self.text + self.both {
            DropDecision { drop_image: true, drop_caption: true }
        } else {
            DropDecision::default()
        }
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> DropDecision {
        self.decide(rng.gen::<f64>())
    }
}

/// Image-conditioning input plus the caption after dropout.
///
/// `clip_image` is always the real preprocessed image; when `drop_image_embed`
/// is set the consumer zeroes the image embedding. `drop_caption` marks a
/// prompt blanked here, as opposed to one the caption policy left empty.
#[derive(Debug, Clone)]
pub struct ImageConditioning {
    pub clip_image: Tensor,
    pub drop_image_embed: bool,
    pub drop_caption: bool,
    pub prompt: String,
}

/// Preprocess `image` and apply one dropout draw to it and `caption`.
pub fn assemble_conditioning<R: Rng + ?Sized>(
    caption: String,
    image: &DynamicImage,
    processor: &dyn ImageProcessor,
    rates: &DropoutRates,
    rng: &mut R,
) -> Result<ImageConditioning> {
    let clip_image = processor.preprocess(image)?;
    let decision = rates.draw(rng);
    let prompt = if decision.drop_caption { String::new() } else { caption };

    Ok(ImageConditioning {
        clip_image,
        drop_image_embed: decision.drop_image,
        drop_caption: decision.drop_caption,
        prompt,
    })
}
