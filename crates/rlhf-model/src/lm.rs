//! Decoder backbone and the causal language model on top of it.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::attention::{attention_bias, position_ids, precompute_rope_freqs, rope_for_positions};
use crate::block::TransformerBlock;
use crate::config::ModelConfig;
use crate::layers::{Linear, RmsNorm};

/// Embedding, blocks and final norm. Shared by [`CausalLm`] and
/// [`crate::score::ScoreLm`] so that checkpoints move between the two.
pub struct Backbone {
    pub config: ModelConfig,
    pub tok_embed: candle_nn::Embedding,
    pub blocks: Vec<TransformerBlock>,
    pub final_norm: RmsNorm,
    freqs_cos: Tensor,
    freqs_sin: Tensor,
}

impl Backbone {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        // candle's default embedding init (stdev 1.0) blows up tied logits.
        let embed_weights = vb.pp("tok_embed").get_with_hints(
            (config.vocab_size, config.dim),
            "weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let tok_embed = candle_nn::Embedding::new(embed_weights, config.dim);
        let blocks = (0..config.n_layers)
            .map(|i| TransformerBlock::new(config, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = RmsNorm::new(config.dim, config.norm_eps, vb.pp("final_norm"))?;
        let (freqs_cos, freqs_sin) = precompute_rope_freqs(
            config.head_dim(),
            config.max_seq_len,
            config.rope_theta,
            vb.device(),
        )?;
        Ok(Self {
            config: config.clone(),
            tok_embed,
            blocks,
            final_norm,
            freqs_cos,
            freqs_sin,
        })
    }

    /// input_ids: u32 `[B, T]`, attention_mask: `[B, T]` -> hidden `[B, T, dim]`.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let (_, t) = input_ids.dims2()?;
        if t > self.config.max_seq_len {
            candle_core::bail!(
                "sequence length {} exceeds max_seq_len {}",
                t,
                self.config.max_seq_len
            );
        }
        let (cos, sin) =
            rope_for_positions(&self.freqs_cos, &self.freqs_sin, &position_ids(attention_mask)?)?;
        let bias = attention_bias(attention_mask)?;
        let mut x = self.tok_embed.forward(input_ids)?;
        for block in &self.blocks {
            x = block.forward(&x, &cos, &sin, &bias, train)?;
        }
        self.final_norm.forward(&x)
    }
}

/// Backbone plus vocabulary projection.
pub struct CausalLm {
    pub backbone: Backbone,
    lm_head: Linear,
}

impl CausalLm {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let backbone = Backbone::new(config, vb.clone())?;
        let lm_head = if config.weight_tied {
            Linear::from_weight(backbone.tok_embed.embeddings().clone())?
        } else {
            Linear::new(config.dim, config.vocab_size, false, vb.pp("lm_head"))?
        };
        Ok(Self { backbone, lm_head })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.backbone.config
    }

    /// Logits `[B, T, vocab]`.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.backbone.forward(input_ids, attention_mask, train)?;
        self.lm_head.forward(&hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_lm(tied: bool) -> Result<(CausalLm, VarMap)> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut cfg = ModelConfig::tiny(50);
        cfg.weight_tied = tied;
        Ok((CausalLm::new(&cfg, vb)?, varmap))
    }

    #[test]
    fn test_logits_shape() -> Result<()> {
        let (lm, _) = tiny_lm(false)?;
        let ids = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8]], &Device::Cpu)?;
        let mask = Tensor::ones((2, 4), DType::U8, &Device::Cpu)?;
        assert_eq!(lm.forward(&ids, &mask, false)?.dims(), &[2, 4, 50]);
        Ok(())
    }

    #[test]
    fn test_weight_tied_has_no_lm_head_var() -> Result<()> {
        let (_, varmap) = tiny_lm(true)?;
        let data = varmap.data().lock().unwrap();
        assert!(!data.contains_key("lm_head.weight"));
        assert!(data.contains_key("tok_embed.weight"));
        assert!(data.contains_key("blocks.1.ffn_norm.weight"));
        Ok(())
    }

    #[test]
    fn test_too_long_sequence_rejected() -> Result<()> {
        let (lm, _) = tiny_lm(false)?;
        let ids = Tensor::zeros((1, 65), DType::U32, &Device::Cpu)?;
        let mask = Tensor::ones((1, 65), DType::U8, &Device::Cpu)?;
        assert!(lm.forward(&ids, &mask, false).is_err());
        Ok(())
    }
}
