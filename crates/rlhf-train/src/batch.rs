//! Batches flowing through rollout and the RL step.

use candle_core::{Result, Tensor};

/// Left-padded prompts, as produced by the prompt collator.
#[derive(Debug, Clone)]
pub struct PromptBatch {
    /// u32 `[B, prompt_len]`
    pub input_ids: Tensor,
    /// u8 `[B, prompt_len]`
    pub attention_mask: Tensor,
}

impl PromptBatch {
    pub fn batch_size(&self) -> Result<usize> {
        self.input_ids.dim(0)
    }

    pub fn prompt_len(&self) -> Result<usize> {
        self.input_ids.dim(1)
    }

    /// Consecutive slices of at most `micro_batch_size` rows.
    pub fn micro_batches(&self, micro_batch_size: usize) -> Result<Vec<PromptBatch>> {
        let total = self.batch_size()?;
        let size = micro_batch_size.max(1);
        (0..total)
            .step_by(size)
            .map(|start| {
                let len = size.min(total - start);
                Ok(PromptBatch {
                    input_ids: self.input_ids.narrow(0, start, len)?,
                    attention_mask: self.attention_mask.narrow(0, start, len)?,
                })
            })
            .collect()
    }
}

/// Full prompt + response sequences produced by the actor.
#[derive(Debug, Clone)]
pub struct InferenceBatch {
    /// u32 `[B, L]`
    pub input_ids: Tensor,
    /// u8 `[B, L]`: zero on padding and unknown tokens
    pub attention_mask: Tensor,
}

impl InferenceBatch {
    /// Mask aligned with next-token targets, `attention_mask[:, 1:]`.
    pub fn sequence_mask(&self) -> Result<Tensor> {
        let len = self.attention_mask.dim(1)?;
        self.attention_mask.narrow(1, 1, len - 1)
    }
}

/// Rollout artifacts, fixed for every update iteration of one rollout.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    /// Index where the prompt ends: `prompt_len - 1` in target coordinates.
    pub prompt_idx: usize,
    /// f32 `[B, L-1]`
    pub log_probs: Tensor,
    /// f32 `[B, L-1]`
    pub ref_log_probs: Tensor,
    /// f32 `[B]`
    pub reward: Tensor,
    /// f32 `[B, L-1]`
    pub reward_values: Tensor,
}

/// Right-padded supervised sequences for the PTX objective.
#[derive(Debug, Clone)]
pub struct SupervisedBatch {
    /// u32 `[B, T]`
    pub input_ids: Tensor,
    /// u8 `[B, T]`
    pub attention_mask: Tensor,
    /// u8 `[B, T]`: one on response tokens
    pub loss_mask: Tensor,
}

impl SupervisedBatch {
    pub fn batch_size(&self) -> Result<usize> {
        self.input_ids.dim(0)
    }

    pub fn micro_batches(&self, micro_batch_size: usize) -> Result<Vec<SupervisedBatch>> {
        let total = self.batch_size()?;
        let size = micro_batch_size.max(1);
        (0..total)
            .step_by(size)
            .map(|start| {
                let len = size.min(total - start);
                Ok(SupervisedBatch {
                    input_ids: self.input_ids.narrow(0, start, len)?,
                    attention_mask: self.attention_mask.narrow(0, start, len)?,
                    loss_mask: self.loss_mask.narrow(0, start, len)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_micro_batches_cover_all_rows() -> Result<()> {
        let ids = Tensor::arange(0u32, 10, &Device::Cpu)?.reshape((5, 2))?;
        let batch = PromptBatch {
            attention_mask: Tensor::ones((5, 2), DType::U8, &Device::Cpu)?,
            input_ids: ids,
        };
        let micro = batch.micro_batches(2)?;
        assert_eq!(micro.len(), 3);
        assert_eq!(micro[2].batch_size()?, 1);
        assert_eq!(micro[2].input_ids.to_vec2::<u32>()?, vec![vec![8, 9]]);
        Ok(())
    }

    #[test]
    fn test_supervised_micro_batches_keep_masks_aligned() -> Result<()> {
        let ids = Tensor::arange(0u32, 12, &Device::Cpu)?.reshape((4, 3))?;
        let loss_mask = Tensor::new(&[[0u8, 1, 1], [0, 0, 1], [0, 1, 0], [1, 1, 1]], &Device::Cpu)?;
        let batch = SupervisedBatch {
            attention_mask: Tensor::ones((4, 3), DType::U8, &Device::Cpu)?,
            input_ids: ids,
            loss_mask,
        };
        let micro = batch.micro_batches(2)?;
        assert_eq!(micro.len(), 2);
        assert_eq!(micro[1].input_ids.to_vec2::<u32>()?[0], vec![6, 7, 8]);
        assert_eq!(micro[1].loss_mask.to_vec2::<u8>()?[0], vec![0, 1, 0]);
        Ok(())
    }

    #[test]
    fn test_sequence_mask_drops_first_column() -> Result<()> {
        let batch = InferenceBatch {
            input_ids: Tensor::zeros((1, 4), DType::U32, &Device::Cpu)?,
            attention_mask: Tensor::new(&[[0u8, 1, 1, 0]], &Device::Cpu)?,
        };
        assert_eq!(batch.sequence_mask()?.to_vec2::<u8>()?, vec![vec![1, 1, 0]]);
        Ok(())
    }
}
