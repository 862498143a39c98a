//! Learning-rate schedules

/// Learning rate for a given optimizer step
pub trait LRScheduler {
    fn get_lr(&self, step: usize) -> f32;
}

/// Linear warm-up without a decay phase: the rate is scaled by
/// `clamp((step + 1) / warmup_steps, min_scale, 1)`.
#[derive(Debug, Clone, Copy)]
pub struct WarmupScheduler {
    pub base_lr: f32,
    pub warmup_steps: usize,
    pub min_scale: f32,
}

impl WarmupScheduler {
    pub fn new(base_lr: f32, warmup_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            min_scale: 0.01,
        }
    }
}

impl Default for WarmupScheduler {
    fn default() -> Self {
        Self::new(1e-5, 500)
    }
}

impl LRScheduler for WarmupScheduler {
    fn get_lr(&self, step: usize) -> f32 {
        if self.warmup_steps == 0 || step >= self.warmup_steps {
            return self.base_lr;
        }
        let scale = ((step + 1) as f32 / self.warmup_steps as f32).clamp(self.min_scale, 1.0);
        self.base_lr * scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup() {
        let scheduler = WarmupScheduler::new(1.0, 500);
        assert_eq!(scheduler.get_lr(0), 0.01);
        assert_eq!(scheduler.get_lr(249), 0.5);
        assert_eq!(scheduler.get_lr(499), 1.0);
        assert_eq!(scheduler.get_lr(10_000), 1.0);
    }

    #[test]
    fn test_no_warmup() {
        let scheduler = WarmupScheduler::new(3e-4, 0);
        assert_eq!(scheduler.get_lr(0), 3e-4);
    }
}
