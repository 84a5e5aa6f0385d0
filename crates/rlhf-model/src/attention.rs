//! Multi-head causal self-attention with RoPE and key padding.
//!
//! Sequences may be left-padded (prompts) or right-padded (responses), so
//! rotary positions come from the attention mask rather than the column index.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::layers::Linear;

/// Additive bias for masked-out keys.
const PAD_BIAS: f64 = -1e9;

/// Precompute RoPE cos/sin tables, each `[max_seq_len, head_dim / 2]`.
pub fn precompute_rope_freqs(
    head_dim: usize,
    max_seq_len: usize,
    theta: f32,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let half_dim = head_dim / 2;
    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| 1.0 / theta.powf(2.0 * i as f32 / head_dim as f32))
        .collect();
    let freqs = Tensor::from_vec(freqs, (1, half_dim), device)?;
    let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
    let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;
    let angles = positions.matmul(&freqs)?;
    Ok((angles.cos()?, angles.sin()?))
}

/// Position of each token counted over attended tokens only: the first real
/// token gets 0 regardless of left padding. Padding positions clamp to 0.
///
/// `attention_mask`: `[B, T]`, any dtype, nonzero = attend. Returns u32 `[B, T]`.
pub fn position_ids(attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask.to_dtype(DType::F32)?;
    let positions = (mask.cumsum(1)? - 1.0)?.clamp(0f32, f32::MAX)?;
    positions.to_dtype(DType::U32)
}

/// Gather rotary tables for arbitrary positions: returns `[B, T, half]` pair.
pub fn rope_for_positions(
    cos: &Tensor,
    sin: &Tensor,
    positions: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let (b, t) = positions.dims2()?;
    let flat = positions.flatten_all()?;
    let cos = cos.index_select(&flat, 0)?.reshape((b, t, ()))?;
    let sin = sin.index_select(&flat, 0)?.reshape((b, t, ()))?;
    Ok((cos, sin))
}

/// Combined causal + key-padding bias, `[B, 1, T, T]`.
pub fn attention_bias(attention_mask: &Tensor) -> Result<Tensor> {
    let (b, t) = attention_mask.dims2()?;
    let device = attention_mask.device();
    let causal = causal_mask(t, device)?;
    let keep = attention_mask.to_dtype(DType::F32)?;
    let pad = ((keep - 1.0)? * -PAD_BIAS)?.reshape((b, 1, 1, t))?;
    pad.broadcast_add(&causal.reshape((1, 1, t, t))?)
}

fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut mask_data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(mask_data, (seq_len, seq_len), device)
}

/// q, k: `[B, H, T, head_dim]`; cos, sin: `[B, T, half]`.
fn apply_rotary_emb(q: &Tensor, k: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<(Tensor, Tensor)> {
    let half = q.dim(D::Minus1)? / 2;
    let cos = cos.unsqueeze(1)?;
    let sin = sin.unsqueeze(1)?;
    let rotate = |x: &Tensor| -> Result<Tensor> {
        let x0 = x.narrow(D::Minus1, 0, half)?;
        let x1 = x.narrow(D::Minus1, half, half)?;
        let r0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
        let r1 = (x0.broadcast_mul(&sin)? + x1.broadcast_mul(&cos)?)?;
        Tensor::cat(&[&r0, &r1], D::Minus1)
    };
    Ok((rotate(q)?, rotate(k)?))
}

pub struct Attention {
    pub wq: Linear,
    pub wk: Linear,
    pub wv: Linear,
    pub wo: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl Attention {
    pub fn new(dim: usize, n_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / n_heads;
        Ok(Self {
            wq: Linear::new(dim, dim, false, vb.pp("wq"))?,
            wk: Linear::new(dim, dim, false, vb.pp("wk"))?,
            wv: Linear::new(dim, dim, false, vb.pp("wv"))?,
            wo: Linear::new(dim, dim, false, vb.pp("wo"))?,
            n_heads,
            head_dim,
        })
    }

    /// x: `[B, T, dim]`, cos/sin: `[B, T, half]`, bias: `[B, 1, T, T]`.
    pub fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let split = |y: Tensor| -> Result<Tensor> {
            y.reshape((b, t, self.n_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.wq.forward(x)?)?;
        let k = split(self.wk.forward(x)?)?;
        let v = split(self.wv.forward(x)?)?;
        let (q, k) = apply_rotary_emb(&q, &k, cos, sin)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? / scale)?;
        let scores = scores.broadcast_add(bias)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = weights.matmul(&v)?;
        let out = out.transpose(1, 2)?.contiguous()?.reshape((b, t, ()))?;
        self.wo.forward(&out)
    }
}
