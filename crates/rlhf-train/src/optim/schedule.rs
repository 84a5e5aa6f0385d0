//! Learning-rate multipliers for the supported scheduler types.

use rlhf_core::LrSchedulerType;

/// Multiplier applied to the base learning rate after `step` optimizer updates.
///
/// - `constant`: 1.0 throughout
/// - `constant_with_warmup`: linear ramp over `warmup_steps`, then 1.0
/// - `linear`: ramp, then linear decay to 0 at `total_steps`
/// - `cosine`: ramp, then half-cosine decay to 0 at `total_steps`
pub fn lr_multiplier(
    kind: LrSchedulerType,
    step: usize,
    warmup_steps: usize,
    total_steps: usize,
) -> f64 {
    if kind == LrSchedulerType::Constant {
        return 1.0;
    }
    if step < warmup_steps {
        return step as f64 / warmup_steps.max(1) as f64;
    }
    let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
    let progress = ((step - warmup_steps) as f64 / decay_steps as f64).min(1.0);
    match kind {
        LrSchedulerType::Linear => 1.0 - progress,
        LrSchedulerType::Cosine => 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
        LrSchedulerType::Constant | LrSchedulerType::ConstantWithWarmup => 1.0,
    }
}

/// Scheduler state owned by a training engine.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    pub kind: LrSchedulerType,
    pub base_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl LrSchedule {
    /// `warmup_steps = floor(total_steps * warmup_ratio)`.
    pub fn new(kind: LrSchedulerType, base_lr: f64, total_steps: usize, warmup_ratio: f64) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps: (total_steps as f64 * warmup_ratio).floor() as usize,
            total_steps,
        }
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        self.base_lr * lr_multiplier(self.kind, step, self.warmup_steps, self.total_steps)
    }
}
