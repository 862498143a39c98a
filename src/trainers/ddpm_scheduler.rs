//! DDPM noise scheduler for ControlNet / IP-Adapter training
//! Only the forward (noising) process is needed during training

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredCosCapV2,
}

impl BetaSchedule {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "linear" => Ok(Self::Linear),
            "scaled_linear" => Ok(Self::ScaledLinear),
            "squaredcos_cap_v2" => Ok(Self::SquaredCosCapV2),
            other => anyhow::bail!("Unknown beta schedule: {}", other),
        }
    }
}

pub struct DDPMScheduler {
    num_timesteps: usize,
    alphas_cumprod: Vec<f32>,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl DDPMScheduler {
    pub fn new(
        num_timesteps: usize,
        beta_start: f32,
        beta_end: f32,
        schedule: BetaSchedule,
        device: &Device,
    ) -> Result<Self> {
        if num_timesteps < 2 {
            anyhow::bail!("DDPM needs at least 2 timesteps, got {}", num_timesteps);
        }

        let betas = match schedule {
            BetaSchedule::Linear => Self::linear_betas(num_timesteps, beta_start, beta_end),
            BetaSchedule::ScaledLinear => {
                Self::scaled_linear_betas(num_timesteps, beta_start, beta_end)
            }
            BetaSchedule::SquaredCosCapV2 => Self::cosine_betas(num_timesteps),
        };

        let mut alphas_cumprod = Vec::with_capacity(num_timesteps);
        let mut running = 1.0f32;
        for beta in &betas {
            running *= 1.0 - beta;
            alphas_cumprod.push(running);
        }

        let sqrt_alphas: Vec<f32> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus: Vec<f32> = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();

        Ok(Self {
            num_timesteps,
            sqrt_alphas_cumprod: Tensor::from_vec(sqrt_alphas, num_timesteps, device)?,
            sqrt_one_minus_alphas_cumprod: Tensor::from_vec(sqrt_one_minus, num_timesteps, device)?,
            alphas_cumprod,
        })
    }

    /// SDXL training defaults: 1000 steps, scaled_linear 0.00085 -> 0.012
    pub fn sdxl(device: &Device) -> Result<Self> {
        Self::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear, device)
    }

    /// noisy = sqrt(a_t) * x0 + sqrt(1 - a_t) * noise
    pub fn add_noise(
        &self,
        original_samples: &Tensor,
        noise: &Tensor,
        timesteps: &Tensor,
    ) -> Result<Tensor> {
        let batch_size = timesteps.dim(0)?;
        let timesteps = timesteps.to_dtype(DType::I64)?;
        let dtype = original_samples.dtype();

        // [B] -> [B, 1, 1, 1] to broadcast over latents
        let broadcast = |t: &Tensor| -> Result<Tensor> {
            let mut shape = vec![batch_size];
            shape.resize(original_samples.rank(), 1);
            Ok(t.index_select(&timesteps, 0)?.reshape(shape)?.to_dtype(dtype)?)
        };
        let sqrt_alpha_prod = broadcast(&self.sqrt_alphas_cumprod)?;
        let sqrt_one_minus_alpha_prod = broadcast(&self.sqrt_one_minus_alphas_cumprod)?;

        let scaled_original = sqrt_alpha_prod.broadcast_mul(original_samples)?;
        let scaled_noise = sqrt_one_minus_alpha_prod.broadcast_mul(noise)?;
        Ok((scaled_original + scaled_noise)?)
    }

    /// SNR(t) = a_t / (1 - a_t), `[B]` f32
    pub fn get_snr(&self, timesteps: &Tensor) -> Result<Tensor> {
        let steps = timesteps.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        let snr: Vec<f32> = steps
            .iter()
            .map(|&t| {
                let idx = t.clamp(0, self.num_timesteps as i64 - 1) as usize;
                let alpha = self.alphas_cumprod[idx];
                alpha / (1.0 - alpha)
            })
            .collect();
        Ok(Tensor::from_vec(snr, steps.len(), timesteps.device())?)
    }

    /// Uniform timesteps in `[0, num_timesteps)`, I64
    pub fn sample_timesteps<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Tensor> {
        let timesteps: Vec<i64> = (0..batch_size)
            .map(|_| rng.gen_range(0..self.num_timesteps) as i64)
            .collect();
        Ok(Tensor::from_vec(timesteps, batch_size, device)?)
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn alphas_cumprod(&self) -> &[f32] {
        &self.alphas_cumprod
    }

    fn linear_betas(n: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
        (0..n)
            .map(|i| beta_start + (beta_end - beta_start) * i as f32 / (n as f32 - 1.0))
            .collect()
    }

    fn scaled_linear_betas(n: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
        let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
        (0..n)
            .map(|i| {
                let t = start + (end - start) * i as f32 / (n as f32 - 1.0);
                t * t
            })
            .collect()
    }

    fn cosine_betas(n: usize) -> Vec<f32> {
        let alpha_bar = |t: f32| ((t + 0.008) / 1.008 * std::f32::consts::PI / 2.0).cos().powi(2);
        (0..n)
            .map(|i| {
                let t1 = i as f32 / n as f32;
                let t2 = (i + 1) as f32 / n as f32;
                (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
            })
            .collect()
    }
}
