//! One ControlNet + IP-Adapter denoising step
//!
//! The networks themselves live elsewhere; this module only wires the noised
//! latents, the control branch residuals and the conditioning into the UNet
//! call and computes the loss.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use rand::Rng;

use super::ddpm_scheduler::DDPMScheduler;
use super::loss::diffusion_loss;

/// Text and micro-conditioning shared by the control branch and the UNet
pub struct UNetConditioning<'a> {
    /// `[B, 77, 2048]`
    pub encoder_hidden_states: &'a Tensor,
    /// `[B, 1280]` pooled text embeddings
    pub text_embeds: &'a Tensor,
    /// `[B, 6]`
    pub time_ids: &'a Tensor,
}

/// Residuals the control branch adds to the UNet's skip connections
pub struct ControlResiduals {
    pub down_block: Vec<Tensor>,
    pub mid_block: Tensor,
}

pub trait ControlNet {
    fn forward(
        &self,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        cond: &UNetConditioning<'_>,
        controlnet_cond: &Tensor,
    ) -> Result<ControlResiduals>;
}

pub trait ConditionedUNet {
    /// Noise prediction; `residuals` are added to the down and mid block outputs.
    fn forward(
        &self,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        cond: &UNetConditioning<'_>,
        residuals: Option<&ControlResiduals>,
    ) -> Result<Tensor>;
}

/// Batch inputs after VAE and text encoding
pub struct StepInputs<'a> {
    /// Scaled VAE latents `[B, 4, H/8, W/8]`
    pub latents: &'a Tensor,
    pub prompt_embeds: &'a Tensor,
    pub pooled_prompt_embeds: &'a Tensor,
    pub time_ids: &'a Tensor,
    /// Control image `[B, 3, H, W]`
    pub conditioning_pixels: &'a Tensor,
}

/// Zero the image embeddings of samples whose drop flag is set.
///
/// `embeds` is `[B, ...]`, `drop_flags` is `[B]` u8.
pub fn apply_image_drop(embeds: &Tensor, drop_flags: &Tensor) -> Result<Tensor> {
    let batch = embeds.dim(0)?;
    if drop_flags.dims() != [batch] {
        anyhow::bail!(
            "drop flags shape {:?} does not match batch size {}",
            drop_flags.dims(),
            batch
        );
    }
    let mut shape = vec![batch];
    shape.resize(embeds.rank(), 1);
    let keep = (1.0 - drop_flags.to_dtype(DType::F32)?)?
        .reshape(shape)?
        .to_dtype(embeds.dtype())?;
    Ok(embeds.broadcast_mul(&keep)?)
}

/// Noise the latents, run the control branch, inject its residuals into the
/// UNet and return the denoising loss.
pub fn controlnet_step<R: Rng + ?Sized>(
    controlnet: &dyn ControlNet,
    unet: &dyn ConditionedUNet,
    scheduler: &DDPMScheduler,
    inputs: &StepInputs<'_>,
    snr_gamma: Option<f32>,
    rng: &mut R,
) -> Result<Tensor> {
    let latents = inputs.latents;
    let device = latents.device();
    let batch_size = latents.dim(0)?;

    let noise = latents.randn_like(0.0, 1.0)?;
    let timesteps = scheduler.sample_timesteps(batch_size, rng, device)?;
    let noisy_latents = scheduler.add_noise(latents, &noise, &timesteps)?;

    let cond = UNetConditioning {
        encoder_hidden_states: inputs.prompt_embeds,
        text_embeds: inputs.pooled_prompt_embeds,
        time_ids: inputs.time_ids,
    };

    let residuals = controlnet
        .forward(&noisy_latents, &timesteps, &cond, inputs.conditioning_pixels)
        .context("ControlNet forward failed")?;
    let model_pred = unet
        .forward(&noisy_latents, &timesteps, &cond, Some(&residuals))
        .context("UNet forward failed")?;

    diffusion_loss(&model_pred, &noise, &timesteps, scheduler, snr_gamma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::Cell;

    struct ZeroControl;

    impl ControlNet for ZeroControl {
        fn forward(
            &self,
            noisy: &Tensor,
            _: &Tensor,
            _: &UNetConditioning<'_>,
            _: &Tensor,
        ) -> Result<ControlResiduals> {
            Ok(ControlResiduals {
                down_block: vec![noisy.zeros_like()?],
                mid_block: noisy.zeros_like()?,
            })
        }
    }

    /// Predicts zeros and records whether residuals arrived
    struct ZeroUNet {
        saw_residuals: Cell<bool>,
    }

    impl ConditionedUNet for ZeroUNet {
        fn forward(
            &self,
            noisy: &Tensor,
            _: &Tensor,
            _: &UNetConditioning<'_>,
            residuals: Option<&ControlResiduals>,
        ) -> Result<Tensor> {
            self.saw_residuals.set(residuals.map(|r| r.down_block.len() == 1).unwrap_or(false));
            Ok(noisy.zeros_like()?)
        }
    }

    #[test]
    fn test_step_injects_residuals() -> Result<()> {
        let device = Device::Cpu;
        let scheduler = DDPMScheduler::sdxl(&device)?;
        let latents = Tensor::zeros((2, 4, 8, 8), DType::F32, &device)?;
        let prompt = Tensor::zeros((2, 77, 16), DType::F32, &device)?;
        let pooled = Tensor::zeros((2, 16), DType::F32, &device)?;
        let time_ids = Tensor::zeros((2, 6), DType::F32, &device)?;
        let control = Tensor::zeros((2, 3, 64, 64), DType::F32, &device)?;
        let inputs = StepInputs {
            latents: &latents,
            prompt_embeds: &prompt,
            pooled_prompt_embeds: &pooled,
            time_ids: &time_ids,
            conditioning_pixels: &control,
        };

        let unet = ZeroUNet { saw_residuals: Cell::new(false) };
        let mut rng = StdRng::seed_from_u64(0);
        let loss = controlnet_step(&ZeroControl, &unet, &scheduler, &inputs, None, &mut rng)?;

        assert!(unet.saw_residuals.get());
        // predicting zero against unit gaussian noise
        let loss = loss.to_scalar::<f32>()?;
        assert!(loss > 0.5 && loss < 1.5);
        Ok(())
    }

    #[test]
    fn test_apply_image_drop() -> Result<()> {
        let device = Device::Cpu;
        let embeds = Tensor::ones((2, 3), DType::F32, &device)?;
        let flags = Tensor::new(&[1u8, 0], &device)?;
        let masked = apply_image_drop(&embeds, &flags)?.to_vec2::<f32>()?;
        assert_eq!(masked, vec![vec![0.0, 0.0, 0.0], vec![1.0, 1.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn test_scalar_embeds_are_an_error() -> Result<()> {
        let device = Device::Cpu;
        let scalar = Tensor::new(1f32, &device)?;
        let flags = Tensor::new(&[1u8], &device)?;
        assert!(apply_image_drop(&scalar, &flags).is_err());
        Ok(())
    }
}
