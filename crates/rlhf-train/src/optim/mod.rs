//! Optimizers and learning-rate schedules.

pub mod adamw;
pub mod schedule;

pub use adamw::{global_grad_norm, uses_weight_decay, AdamW};
pub use schedule::{lr_multiplier, LrSchedule};
