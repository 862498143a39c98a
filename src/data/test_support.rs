//! Shared fixtures for unit tests

use image::{DynamicImage, ImageBuffer, Rgb};

/// Rng whose `gen::<f64>()` yields the scripted values in order
pub struct Draws(std::vec::IntoIter<f64>);

impl Draws {
    pub fn new(values: &[f64]) -> Self {
        Draws(values.to_vec().into_iter())
    }
}

impl rand::RngCore for Draws {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        // f64 sampling keeps the top 53 bits: value = (bits >> 11) * 2^-53
        let value = self.0.next().expect("ran out of scripted draws");
        ((value * (1u64 << 53) as f64) as u64) << 11
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

pub fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb([value, value, value])))
}
