//! Pre-norm transformer block.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::attention::Attention;
use crate::config::ModelConfig;
use crate::layers::{FeedForward, RmsNorm};

pub struct TransformerBlock {
    pub attn_norm: RmsNorm,
    pub attention: Attention,
    pub ffn_norm: RmsNorm,
    pub ffn: FeedForward,
    dropout: f32,
}

impl TransformerBlock {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn_norm: RmsNorm::new(config.dim, config.norm_eps, vb.pp("attn_norm"))?,
            attention: Attention::new(config.dim, config.n_heads, vb.pp("attention"))?,
            ffn_norm: RmsNorm::new(config.dim, config.norm_eps, vb.pp("ffn_norm"))?,
            ffn: FeedForward::new(config.dim, config.ffn_dim, vb.pp("ffn"))?,
            dropout: config.dropout,
        })
    }

    fn maybe_dropout(&self, x: Tensor, train: bool) -> Result<Tensor> {
        if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(&x, self.dropout)
        } else {
            Ok(x)
        }
    }

    pub fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        bias: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let h = self
            .attention
            .forward(&self.attn_norm.forward(x)?, cos, sin, bias)?;
        let x = (x + self.maybe_dropout(h, train)?)?;
        let h = self.ffn.forward(&self.ffn_norm.forward(&x)?)?;
        x + self.maybe_dropout(h, train)?
    }
}
