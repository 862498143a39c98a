//! Denoising loss with optional min-SNR weighting

use anyhow::Result;
use candle_core::{DType, Tensor};

use super::ddpm_scheduler::DDPMScheduler;

/// Min-SNR-gamma weights: min(snr, gamma) / snr
pub fn compute_snr_loss_weights(snr: &Tensor, gamma: f32) -> Result<Tensor> {
    let clipped_snr = snr.clamp(0f32, gamma)?;
    Ok((&clipped_snr / snr)?)
}

/// MSE between prediction and noise target.
///
/// Without `snr_gamma` this is the plain mean. With it, each sample's mean
/// error is scaled by its min-SNR weight before averaging over the batch.
pub fn diffusion_loss(
    model_pred: &Tensor,
    target: &Tensor,
    timesteps: &Tensor,
    scheduler: &DDPMScheduler,
    snr_gamma: Option<f32>,
) -> Result<Tensor> {
    let model_pred = model_pred.to_dtype(DType::F32)?;
    let target = target.to_dtype(DType::F32)?;

    match snr_gamma {
        None => Ok(candle_nn::loss::mse(&model_pred, &target)?),
        Some(gamma) => {
            let snr = scheduler.get_snr(timesteps)?.to_device(model_pred.device())?;
            let weights = compute_snr_loss_weights(&snr, gamma)?;
            let per_sample = (model_pred - target)?.sqr()?.flatten_from(1)?.mean(1)?;
            Ok((per_sample * weights)?.mean_all()?)
        }
    }
}
