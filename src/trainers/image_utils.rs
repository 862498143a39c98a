//! Writing pixel tensors back to disk for dataset inspection

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use std::path::Path;

/// Save a `[3, H, W]` tensor in `[-1, 1]` as PNG or JPEG (by extension, PNG otherwise).
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = tensor.to_dtype(DType::U8)?;

    let (channel, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
    if channel != 3 {
        anyhow::bail!("Expected 3 channels (RGB), got {}", channel);
    }

    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let img = image::RgbImage::from_raw(width as u32, height as u32, data)
        .context("Failed to create image buffer")?;

    let path = path.as_ref();
    let format = match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => image::ImageFormat::Jpeg,
        _ => image::ImageFormat::Png,
    };
    img.save_with_format(path, format)
        .with_context(|| format!("Failed to save image to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_save_roundtrip_pixels() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("white.png");
        let tensor = Tensor::ones((3, 4, 6), DType::F32, &Device::Cpu)?;
        save_image(&tensor, &path)?;

        let img = image::open(&path)?.to_rgb8();
        assert_eq!(img.dimensions(), (6, 4));
        assert!(img.pixels().all(|p| p.0 == [255, 255, 255]));
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_channels() {
        let tensor = Tensor::zeros((1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(save_image(&tensor, "unused.png").is_err());
    }
}
