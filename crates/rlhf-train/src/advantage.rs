//! KL-shaped rewards and generalized advantage estimation.

use candle_core::{DType, Result, Tensor};
use rlhf_model::last_valid_indices;

/// Per-token rewards: `-kl_coeff * (log_probs - ref_log_probs)`, with the
/// sequence reward added once at the last valid position of each row, then
/// clamped to `[-clip_range_score, clip_range_score]`.
///
/// reward: `[B]`; log_probs, ref_log_probs, sequence_mask: `[B, L]`.
pub fn add_kl_divergence_regularization(
    reward: &Tensor,
    log_probs: &Tensor,
    ref_log_probs: &Tensor,
    sequence_mask: &Tensor,
    kl_coeff: f64,
    clip_range_score: f64,
) -> Result<Tensor> {
    let end_index = last_valid_indices(sequence_mask)?.unsqueeze(1)?.contiguous()?;
    let kl = (log_probs - ref_log_probs)?;
    let rewards = (kl * -kl_coeff)?.contiguous()?;
    // scatter_add needs contiguous operands.
    let terminal = reward.to_dtype(rewards.dtype())?.unsqueeze(1)?.contiguous()?;
    let rewards = rewards.scatter_add(&end_index, &terminal, 1)?;
    rewards.clamp(-clip_range_score, clip_range_score)
}

/// GAE from position `start` on. Values and rewards are masked first.
///
/// ```text
/// delta_t = r_t + gamma * V_{t+1} - V_t          (V_L = 0)
/// A_t     = delta_t + gamma * lambda * A_{t+1}   (A_L = 0)
/// R_t     = A_t + V_t
/// ```
///
/// Returns `(advantages, returns)`, both `[B, L - start]` and detached.
pub fn get_advantages_and_returns(
    values: &Tensor,
    rewards: &Tensor,
    sequence_mask: &Tensor,
    start: usize,
    gamma: f64,
    lambda: f64,
) -> Result<(Tensor, Tensor)> {
    let (batch, length) = values.dims2()?;
    if start >= length {
        candle_core::bail!("advantage start {} is outside sequence length {}", start, length);
    }
    let mask = sequence_mask.to_dtype(DType::F32)?;
    let values = (values.to_dtype(DType::F32)? * &mask)?.to_vec2::<f32>()?;
    let rewards = (rewards.to_dtype(DType::F32)? * &mask)?.to_vec2::<f32>()?;

    let span = length - start;
    let mut advantages = vec![0.0f32; batch * span];
    let mut returns = vec![0.0f32; batch * span];
    for b in 0..batch {
        let mut last_gae = 0.0f64;
        for t in (start..length).rev() {
            let next_value = if t + 1 < length { values[b][t + 1] as f64 } else { 0.0 };
            let delta = rewards[b][t] as f64 + gamma * next_value - values[b][t] as f64;
            last_gae = delta + gamma * lambda * last_gae;
            advantages[b * span + (t - start)] = last_gae as f32;
            returns[b * span + (t - start)] = (last_gae + values[b][t] as f64) as f32;
        }
    }

    let device = sequence_mask.device();
    Ok((
        Tensor::from_vec(advantages, (batch, span), device)?,
        Tensor::from_vec(returns, (batch, span), device)?,
    ))
}
