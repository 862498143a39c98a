pub mod ddpm_scheduler;
pub mod ema;
pub mod image_utils;
pub mod loss;
pub mod schedule;
pub mod step;
pub mod time_ids;

// Re-export key types
pub use ddpm_scheduler::{BetaSchedule, DDPMScheduler};
pub use ema::EmaTracker;
pub use loss::{compute_snr_loss_weights, diffusion_loss};
pub use schedule::{LRScheduler, WarmupScheduler};
pub use step::{
    apply_image_drop, controlnet_step, ConditionedUNet, ControlNet, ControlResiduals, StepInputs,
};
pub use time_ids::TimeIds;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::data::DatasetConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub job: String,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub train: TrainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_lr")]
    pub lr: f32,
    #[serde(default = "default_warmup")]
    pub lr_warmup_steps: usize,
    /// Enables min-SNR loss weighting
    pub snr_gamma: Option<f32>,
    /// Enables EMA of the trained weights
    pub ema_decay: Option<f64>,
    #[serde(default = "default_timesteps")]
    pub num_train_timesteps: usize,
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: String,
    #[serde(default = "default_shuffle_seed")]
    pub shuffle_seed: u64,
    #[serde(default = "default_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_accumulation")]
    pub gradient_accumulation: usize,
}

fn default_lr() -> f32 {
    1e-5
}

fn default_warmup() -> usize {
    500
}

fn default_timesteps() -> usize {
    1000
}

fn default_beta_schedule() -> String {
    "scaled_linear".to_string()
}

fn default_shuffle_seed() -> u64 {
    114514
}

fn default_epochs() -> usize {
    20
}

fn default_accumulation() -> usize {
    8
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            lr_warmup_steps: default_warmup(),
            snr_gamma: None,
            ema_decay: None,
            num_train_timesteps: default_timesteps(),
            beta_schedule: default_beta_schedule(),
            shuffle_seed: default_shuffle_seed(),
            max_epochs: default_epochs(),
            gradient_accumulation: default_accumulation(),
        }
    }
}

impl TrainConfig {
    pub fn lr_scheduler(&self) -> WarmupScheduler {
        WarmupScheduler::new(self.lr, self.lr_warmup_steps)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&config_str)
        .with_context(|| "Failed to parse YAML config")?;

    config
        .dataset
        .validate()
        .with_context(|| format!("Invalid dataset section in {}", path.display()))?;

    Ok(config)
}
