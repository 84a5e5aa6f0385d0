//! Backbone with a scalar head: used as reward model and as critic.

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::ModelConfig;
use crate::layers::Linear;
use crate::lm::Backbone;

/// Per-token and per-sequence scores.
#[derive(Debug, Clone)]
pub struct ScoreOutput {
    /// `[B, T]` raw per-token scores.
    pub scores: Tensor,
    /// `[B]` score at the last attended token of each row.
    pub end_scores: Tensor,
    /// `[B, T]` scores with padding positions zeroed.
    pub clipped_scores: Tensor,
}

pub struct ScoreLm {
    pub backbone: Backbone,
    score_head: Linear,
}

impl ScoreLm {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            backbone: Backbone::new(config, vb.clone())?,
            score_head: Linear::new(config.dim, 1, true, vb.pp("score_head"))?,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.backbone.config
    }

    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<ScoreOutput> {
        let hidden = self.backbone.forward(input_ids, attention_mask, train)?;
        let scores = self.score_head.forward(&hidden)?.squeeze(2)?;
        let end_index = last_valid_indices(attention_mask)?.unsqueeze(1)?;
        let end_scores = scores.gather(&end_index, 1)?.squeeze(1)?;
        let mask = attention_mask.to_dtype(scores.dtype())?;
        let clipped_scores = (&scores * mask)?;
        Ok(ScoreOutput {
            scores,
            end_scores,
            clipped_scores,
        })
    }
}

/// Index of the last nonzero mask entry per row, u32 `[B]`.
///
/// A row with no attended token is an error.
pub fn last_valid_indices(mask: &Tensor) -> Result<Tensor> {
    let rows = mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        match row.iter().rposition(|&m| m != 0.0) {
            Some(idx) => out.push(idx as u32),
            None => candle_core::bail!("row {} of the mask has no attended token", i),
        }
    }
    Tensor::new(out, mask.device())
}
