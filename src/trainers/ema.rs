//! Exponential moving average of trainable weights

use anyhow::{Context, Result};
use candle_core::{Tensor, Var};
use std::collections::HashMap;
use std::path::Path;

/// Shadow copy of the trained weights, updated as
/// `ema = decay * ema + (1 - decay) * param`.
pub struct EmaTracker {
    decay: f64,
    shadow: HashMap<String, Tensor>,
    num_updates: usize,
}

impl EmaTracker {
    pub fn new(decay: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&decay) {
            anyhow::bail!("EMA decay must lie in [0, 1), got {}", decay);
        }
        Ok(Self {
            decay,
            shadow: HashMap::new(),
            num_updates: 0,
        })
    }

    /// Fold the current parameters into the shadow copy. Unknown names are
    /// initialised from the parameter itself.
    pub fn step(&mut self, params: &HashMap<String, Var>) -> Result<()> {
        for (name, param) in params {
            let current = param.as_tensor().detach();
            let updated = match self.shadow.get(name) {
                Some(shadow) => ((shadow * self.decay)? + (current * (1.0 - self.decay))?)?,
                None => current,
            };
            self.shadow.insert(name.clone(), updated);
        }
        self.num_updates += 1;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.shadow.get(name)
    }

    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    /// Write the shadow weights as safetensors.
    pub fn save(&self, path: &Path) -> Result<()> {
        candle_core::safetensors::save(&self.shadow, path)
            .with_context(|| format!("Failed to save EMA weights to {}", path.display()))
    }
}
