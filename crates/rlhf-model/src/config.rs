//! Architecture description stored as `config.json` next to the weights.

use std::path::Path;

use rlhf_core::error::{parse_error, IoResultExt, Result};
use serde::{Deserialize, Serialize};

fn default_rope_theta() -> f32 {
    10000.0
}

fn default_norm_eps() -> f64 {
    1e-6
}

/// Decoder-only transformer configuration plus the special token ids the
/// tokenizer should use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub ffn_dim: usize,
    pub max_seq_len: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    /// Dropout probability applied in train mode only.
    #[serde(default)]
    pub dropout: f32,
    /// Share the token embedding with the LM head.
    #[serde(default)]
    pub weight_tied: bool,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    #[serde(default)]
    pub unk_token_id: Option<u32>,
}

impl ModelConfig {
    /// Small CPU-sized model, used by tests and smoke runs.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            dim: 32,
            n_layers: 2,
            n_heads: 4,
            ffn_dim: 64,
            max_seq_len: 64,
            rope_theta: default_rope_theta(),
            norm_eps: default_norm_eps(),
            dropout: 0.0,
            weight_tied: false,
            bos_token_id: None,
            eos_token_id: None,
            pad_token_id: None,
            unk_token_id: None,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.dim == 0 || self.n_layers == 0 || self.n_heads == 0 {
            errors.push("dim, n_layers and n_heads must be greater than 0".to_string());
        } else {
            if !self.dim.is_multiple_of(self.n_heads) {
                errors.push(format!(
                    "dim ({}) must be divisible by n_heads ({})",
                    self.dim, self.n_heads
                ));
            }
            if !self.head_dim().is_multiple_of(2) {
                errors.push(format!("head_dim ({}) must be even for RoPE", self.head_dim()));
            }
        }
        if self.vocab_size == 0 {
            errors.push("vocab_size must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            errors.push(format!("dropout ({}) must be in [0, 1)", self.dropout));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_path(path)?;
        serde_json::from_str(&text).map_err(|e| parse_error(e, path))
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_path(path)
    }
}
