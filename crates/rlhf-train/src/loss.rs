//! Clipped PPO objectives and masked reductions.

use candle_core::{DType, Result, Tensor, D};

/// `mean_b(sum_t(x * mask) / sum_t(mask))`, or the plain mean without a mask.
///
/// Rows with an empty mask are left out of the batch mean; a batch with no
/// masked-in token averages to 0.
pub fn masked_mean(x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    match mask {
        None => x.mean_all(),
        Some(mask) => {
            let mask = mask.to_dtype(x.dtype())?;
            let counts = mask.sum(D::Minus1)?;
            let valid_rows = counts.gt(0.0)?.to_dtype(x.dtype())?;
            let per_row = ((x * &mask)?.sum(D::Minus1)? / counts.maximum(1.0)?)?;
            let n_valid = valid_rows.sum_all()?.maximum(1.0)?;
            (per_row * valid_rows)?.sum_all()? / n_valid
        }
    }
}

/// Log-probability of each label under `logits`.
///
/// logits: `[B, T, V]`, labels: u32 `[B, T]` -> `[B, T]`.
pub fn gather_log_probabilities(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let index = labels.contiguous()?.unsqueeze(D::Minus1)?;
    log_probs.gather(&index, D::Minus1)?.squeeze(D::Minus1)
}

/// Log-probabilities of `input_ids[:, 1:]` under `logits[:, :-1]`.
pub fn next_token_log_probs(logits: &Tensor, input_ids: &Tensor) -> Result<Tensor> {
    let len = input_ids.dim(1)?;
    let logits = logits.narrow(1, 0, len - 1)?;
    let labels = input_ids.narrow(1, 1, len - 1)?;
    gather_log_probabilities(&logits, &labels)
}

/// Clipped surrogate policy loss:
/// `-masked_mean(min(r*A, clamp(r, 1-eps, 1+eps)*A))` with `r = exp(new - old)`.
pub fn actor_loss(
    log_probs: &Tensor,
    old_log_probs: &Tensor,
    advantages: &Tensor,
    mask: &Tensor,
    clip_range_ratio: f64,
) -> Result<Tensor> {
    let ratio = (log_probs - old_log_probs)?.exp()?;
    let surrogate1 = (&ratio * advantages)?;
    let clipped = ratio.clamp(1.0 - clip_range_ratio, 1.0 + clip_range_ratio)?;
    let surrogate2 = (clipped * advantages)?;
    let surrogate = surrogate1.minimum(&surrogate2)?;
    masked_mean(&surrogate, Some(mask))?.neg()
}

/// Clipped value loss:
/// `0.5 * masked_mean(max((v - R)^2, (clamp(v, old±eps) - R)^2))`.
pub fn critic_loss(
    values: &Tensor,
    old_values: &Tensor,
    returns: &Tensor,
    mask: &Tensor,
    clip_range_value: f64,
) -> Result<Tensor> {
    let lower = (old_values - clip_range_value)?;
    let upper = (old_values + clip_range_value)?;
    let values_clipped = values.maximum(&lower)?.minimum(&upper)?;
    let vf_loss1 = (values - returns)?.sqr()?;
    let vf_loss2 = (values_clipped - returns)?.sqr()?;
    let loss = masked_mean(&vf_loss1.maximum(&vf_loss2)?, Some(mask))?;
    loss * 0.5
}

/// Token-level cross entropy over `loss_mask[:, 1:]` positions, averaged over
/// every masked-in token of the batch.
pub fn language_modeling_loss(logits: &Tensor, input_ids: &Tensor, loss_mask: &Tensor) -> Result<Tensor> {
    let len = input_ids.dim(1)?;
    let nll = next_token_log_probs(logits, input_ids)?.neg()?;
    let mask = loss_mask.narrow(1, 1, len - 1)?.to_dtype(nll.dtype())?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    if count <= 0.0 {
        candle_core::bail!("language modeling batch has no target tokens");
    }
    (nll * mask)?.sum_all()? / count as f64
}
