//! Learning rate schedule for point positions.

use crate::utils::config::TrainConfig;

/// Log-space interpolation from an initial to a final rate.
///
/// Position updates start coarse and anneal as the scene settles; feature,
/// opacity and scale channels keep a flat rate and do not go through this.
pub struct PositionLrSchedule {
    lr_init: f64,
    lr_final: f64,
    max_steps: u64,
}

impl PositionLrSchedule {
    pub fn new(config: &TrainConfig) -> Self {
        Self {
            lr_init: config.position_lr_init,
            lr_final: config.position_lr_final,
            max_steps: config.lr_max_steps.max(1),
        }
    }

    /// Learning rate at `step`, clamped to the final rate past `max_steps`.
    pub fn get_lr(&self, step: u64) -> f64 {
        if self.lr_init <= 0.0 {
            return 0.0;
        }
        let t = (step as f64 / self.max_steps as f64).min(1.0);
        (self.lr_init.ln() * (1.0 - t) + self.lr_final.ln() * t).exp()
    }
}
