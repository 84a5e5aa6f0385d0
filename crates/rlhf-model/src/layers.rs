//! Trainable building blocks: Linear, RMSNorm, SwiGLU feed-forward.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// Dense projection `x @ W^T (+ b)`, initialized N(0, 0.02).
pub struct Linear {
    weight: Tensor, // [out_features, in_features]
    bias: Option<Tensor>,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new(in_f: usize, out_f: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_f, in_f),
            "weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let bias = if bias {
            Some(vb.get_with_hints(out_f, "bias", candle_nn::Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            in_features: in_f,
            out_features: out_f,
        })
    }

    /// Wrap an existing weight (used for the tied LM head).
    pub fn from_weight(weight: Tensor) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        Ok(Self {
            weight,
            bias: None,
            in_features,
            out_features,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight.t()?;
        let y = match x.dims() {
            [b, m, k] => x.reshape((b * m, *k))?.matmul(&w)?.reshape((*b, *m, ()))?,
            _ => x.matmul(&w)?,
        };
        match &self.bias {
            Some(bias) => y.broadcast_add(bias),
            None => Ok(y),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

/// RMSNorm with a learned gain.
pub struct RmsNorm {
    weight: Tensor, // [dim]
    eps: f64,
    pub dim: usize,
}

impl RmsNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps, dim })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last_dim = x.dims().len() - 1;
        let variance = x.sqr()?.mean_keepdim(last_dim)?;
        let denominator = (variance + self.eps)?.sqrt()?;
        x.broadcast_div(&denominator)?.broadcast_mul(&self.weight)
    }
}

/// SwiGLU FFN: `w_down(silu(w_gate(x)) * w_up(x))`.
pub struct FeedForward {
    pub w_gate: Linear,
    pub w_up: Linear,
    pub w_down: Linear,
}

impl FeedForward {
    pub fn new(dim: usize, ffn_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_gate: Linear::new(dim, ffn_dim, false, vb.pp("w_gate"))?,
            w_up: Linear::new(dim, ffn_dim, false, vb.pp("w_up"))?,
            w_down: Linear::new(ffn_dim, dim, false, vb.pp("w_down"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.w_gate.forward(x)?)?;
        let up = self.w_up.forward(x)?;
        self.w_down.forward(&(gate * up)?)
    }
}
