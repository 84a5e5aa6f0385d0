//! Execution-engine configuration (DeepSpeed-style JSON).
//!
//! The raw file is shared by all four models; training and evaluation engines
//! each get a derived copy with batch sizing and precision filled in from
//! `train_cfgs`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::TrainCfgs;
use crate::error::{parse_error, IoResultExt, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroOptimization {
    #[serde(default)]
    pub stage: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggle {
    #[serde(default)]
    pub enabled: bool,
}

/// Numeric precision used for saved weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    F32,
    Bf16,
    F16,
}

impl Precision {
    pub fn dtype(self) -> candle_core::DType {
        match self {
            Precision::F32 => candle_core::DType::F32,
            Precision::Bf16 => candle_core::DType::BF16,
            Precision::F16 => candle_core::DType::F16,
        }
    }
}

/// Engine configuration consumed by the train/eval engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub train_batch_size: Option<usize>,
    #[serde(default = "one")]
    pub train_micro_batch_size_per_gpu: usize,
    #[serde(default = "one")]
    pub gradient_accumulation_steps: usize,
    /// Global gradient-norm clip; 0 disables clipping.
    #[serde(default)]
    pub gradient_clipping: f64,
    #[serde(default)]
    pub zero_optimization: ZeroOptimization,
    #[serde(default)]
    pub bf16: Toggle,
    #[serde(default)]
    pub fp16: Toggle,
}

fn one() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            train_batch_size: None,
            train_micro_batch_size_per_gpu: 1,
            gradient_accumulation_steps: 1,
            gradient_clipping: 1.0,
            zero_optimization: ZeroOptimization::default(),
            bf16: Toggle::default(),
            fp16: Toggle::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_path(path)?;
        serde_json::from_str(&text).map_err(|e| parse_error(e, path))
    }

    /// Training engine config: `train_batch_size = micro * world_size * accum`.
    pub fn prepare_train(&self, cfgs: &TrainCfgs, world_size: usize) -> Self {
        let mut out = self.clone();
        let micro = cfgs.per_device_train_batch_size;
        let accum = cfgs.gradient_accumulation_steps;
        out.train_batch_size = Some(micro * world_size * accum);
        out.train_micro_batch_size_per_gpu = micro;
        out.gradient_accumulation_steps = accum;
        out.bf16.enabled = cfgs.bf16;
        out.fp16.enabled = cfgs.fp16;
        out
    }

    /// Evaluation engine config. ZeRO stages 1 and 2 have no inference
    /// partitioning, so they fall back to stage 0.
    pub fn prepare_eval(&self, cfgs: &TrainCfgs) -> Self {
        let mut out = self.clone();
        if matches!(out.zero_optimization.stage, 1 | 2) {
            out.zero_optimization.stage = 0;
        }
        out.train_batch_size = None;
        out.train_micro_batch_size_per_gpu = 1;
        out.gradient_accumulation_steps = 1;
        out.bf16.enabled = cfgs.bf16;
        out.fp16.enabled = cfgs.fp16;
        out
    }

    /// The actor takes one RL step and one PTX step per micro-batch when PTX is
    /// enabled, so its accumulation window doubles.
    pub fn doubled_for_ptx(&self) -> Self {
        let mut out = self.clone();
        out.train_batch_size = out.train_batch_size.map(|b| b * 2);
        out.gradient_accumulation_steps *= 2;
        out
    }

    pub fn precision(&self) -> Precision {
        if self.bf16.enabled {
            Precision::Bf16
        } else if self.fp16.enabled {
            Precision::F16
        } else {
            Precision::F32
        }
    }
}

/// Total micro-steps for a run:
/// `n_prompt_batches * epochs * update_iters * prompt_bs / train_bs`.
pub fn total_training_steps(
    n_prompt_batches: usize,
    epochs: usize,
    update_iters: usize,
    prompt_batch_size: usize,
    train_batch_size: usize,
) -> usize {
    n_prompt_batches * epochs * update_iters * prompt_batch_size / train_batch_size.max(1)
}
