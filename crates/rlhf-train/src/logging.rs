//! Structured logging for PPO training with tracing.
//!
//! JSON or pretty console output, per-step RL metrics as structured fields and
//! automatic warnings for the usual PPO failure signs (diverging losses, the
//! policy drifting far from the reference, empty generations).

use std::collections::BTreeMap;

use tracing::{debug, error, info, span, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,rlhf_train=info,rlhf_model=info,rlhf_core=info";

/// KL divergence above which the policy is considered to be running away.
pub const KL_WARN_THRESHOLD: f64 = 10.0;

/// Initialize structured logging.
///
/// Reads the filter from RUST_LOG, JSON-formatted output.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();

    info!("Structured logging initialized");
}

/// Initialize human-readable console logging.
pub fn init_console_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().pretty())
        .try_init();
}

/// Metrics of one RL step, already reduced across workers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RlStepMetrics {
    pub actor_loss: f64,
    pub reward_critic_loss: f64,
    pub reward: f64,
    pub reward_with_kl_penalty: f64,
    pub reward_advantage: f64,
    pub reward_return: f64,
    pub reward_value: f64,
    pub kl_divergence: f64,
    pub actor_lr: f64,
    pub reward_critic_lr: f64,
    pub mean_generated_length: f64,
    pub max_generated_length: f64,
}

impl RlStepMetrics {
    /// Metric names as written to the metrics log.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        [
            ("train/actor_loss", self.actor_loss),
            ("train/reward_critic_loss", self.reward_critic_loss),
            ("train/reward", self.reward),
            ("train/reward_with_kl_penalty", self.reward_with_kl_penalty),
            ("train/reward_advantage", self.reward_advantage),
            ("train/reward_return", self.reward_return),
            ("train/reward_value", self.reward_value),
            ("train/kl_divergence", self.kl_divergence),
            ("train/actor_lr", self.actor_lr),
            ("train/reward_critic_lr", self.reward_critic_lr),
            ("train/mean_generated_length", self.mean_generated_length),
            ("train/max_generated_length", self.max_generated_length),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Log an RL step with structured metrics.
///
/// Emits an error for non-finite losses and warnings for a large KL divergence
/// or generations with no response tokens.
pub fn log_rl_step(step: usize, metrics: &RlStepMetrics) {
    let span = span!(Level::INFO, "rl_step", step = step);
    let _enter = span.enter();

    if !metrics.actor_loss.is_finite() || !metrics.reward_critic_loss.is_finite() {
        error!(
            actor_loss = metrics.actor_loss,
            reward_critic_loss = metrics.reward_critic_loss,
            step = step,
            "Training diverged! NaN or infinite loss detected"
        );
        return;
    }

    info!(
        actor_loss = metrics.actor_loss,
        critic_loss = metrics.reward_critic_loss,
        reward = metrics.reward,
        reward_with_kl = metrics.reward_with_kl_penalty,
        kl = metrics.kl_divergence,
        actor_lr = metrics.actor_lr,
        critic_lr = metrics.reward_critic_lr,
        mean_len = metrics.mean_generated_length,
        "RL step completed"
    );

    if metrics.kl_divergence > KL_WARN_THRESHOLD {
        warn!(
            kl = metrics.kl_divergence,
            step = step,
            threshold = KL_WARN_THRESHOLD,
            "Policy is drifting far from the reference model. Consider a larger kl_coeff \
             or a smaller actor learning rate"
        );
    }

    if metrics.max_generated_length == 0.0 {
        warn!(step = step, "No worker generated any response tokens in this step");
    }

    debug!(
        step = step,
        advantage = metrics.reward_advantage,
        ret = metrics.reward_return,
        value = metrics.reward_value,
        max_len = metrics.max_generated_length,
        "RL step diagnostics"
    );
}

/// Log a PTX step.
pub fn log_ptx_step(step: usize, ptx_loss: f64) {
    if !ptx_loss.is_finite() {
        error!(ptx_loss = ptx_loss, step = step, "PTX loss is NaN or infinite");
        return;
    }
    info!(ptx_loss = ptx_loss, step = step, "PTX step completed");
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(step: usize, path: &str) {
    info!(
        step = step,
        path = path,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}

/// Log evaluation results.
pub fn log_evaluation(step: usize, samples: usize) {
    info!(
        step = step,
        samples = samples,
        event = "evaluation",
        "Evaluation completed"
    );
}
