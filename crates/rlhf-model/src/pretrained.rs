//! Loading and saving model directories.
//!
//! A model directory holds:
//!   - `config.json`: [`ModelConfig`]
//!   - `tokenizer.json`: HuggingFace tokenizer
//!   - `model.safetensors` or `pytorch_model*.bin`: weights in safetensors format

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rlhf_core::error::{checkpoint_error, Result, RlhfError};

use crate::config::ModelConfig;
use crate::lm::CausalLm;
use crate::score::ScoreLm;
use crate::tokenizer::{PaddingSide, TextTokenizer};

/// Weight file names tried in order.
pub const WEIGHT_FILES: &[&str] = &["model.safetensors", "pytorch_model.bin"];

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub model_max_length: usize,
    pub padding_side: PaddingSide,
    pub device: Device,
}

/// A model, the variables backing it and its tokenizer.
pub struct Pretrained<M> {
    pub model: M,
    pub varmap: VarMap,
    pub config: ModelConfig,
    pub tokenizer: TextTokenizer,
}

/// What a weight load matched.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub loaded: usize,
    /// Model variables absent from the file; they keep their initialization.
    pub missing: Vec<String>,
    /// File tensors the model has no variable for.
    pub unexpected: Vec<String>,
}

pub fn load_pretrained(dir: &Path, opts: &LoadOptions) -> Result<Pretrained<CausalLm>> {
    load_with(dir, opts, CausalLm::new)
}

/// Load a backbone with a scalar head. The head may be absent from the
/// checkpoint (e.g. a critic initialized from a language model).
pub fn load_pretrained_score(dir: &Path, opts: &LoadOptions) -> Result<Pretrained<ScoreLm>> {
    load_with(dir, opts, ScoreLm::new)
}

fn load_with<M>(
    dir: &Path,
    opts: &LoadOptions,
    build: impl FnOnce(&ModelConfig, VarBuilder) -> candle_core::Result<M>,
) -> Result<Pretrained<M>> {
    let config = ModelConfig::from_json_file(&dir.join("config.json"))?;
    config.validate().map_err(RlhfError::Validation)?;
    if config.max_seq_len < opts.model_max_length {
        return Err(checkpoint_error(
            format!(
                "model supports {} positions but model_max_length is {}",
                config.max_seq_len, opts.model_max_length
            ),
            dir,
        ));
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &opts.device);
    let model = build(&config, vb)?;

    match weights_file(dir) {
        Some(path) => {
            let report = load_weights(&varmap, &path, &opts.device)?;
            tracing::info!(
                path = %path.display(),
                loaded = report.loaded,
                missing = report.missing.len(),
                unexpected = report.unexpected.len(),
                "loaded weights"
            );
            if !report.missing.is_empty() {
                tracing::warn!(missing = ?report.missing, "weights missing from checkpoint, keeping initialization");
            }
        }
        None => {
            tracing::warn!(dir = %dir.display(), "no weight file found, using random initialization");
        }
    }

    let tokenizer = TextTokenizer::from_file(
        &dir.join("tokenizer.json"),
        &config,
        opts.model_max_length,
        opts.padding_side,
    )?;
    Ok(Pretrained {
        model,
        varmap,
        config,
        tokenizer,
    })
}

pub fn weights_file(dir: &Path) -> Option<PathBuf> {
    WEIGHT_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// Copy tensors from a safetensors file into matching variables by name.
pub fn load_weights(varmap: &VarMap, path: &Path, device: &Device) -> Result<LoadReport> {
    let tensors = candle_core::safetensors::load(path, device)
        .map_err(|e| checkpoint_error(e, path))?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| checkpoint_error("variable map lock poisoned", path))?;

    let mut report = LoadReport::default();
    for (name, var) in data.iter() {
        match tensors.get(name) {
            Some(t) => {
                if t.dims() != var.dims() {
                    return Err(checkpoint_error(
                        format!(
                            "shape mismatch for '{}': checkpoint {:?}, model {:?}",
                            name,
                            t.dims(),
                            var.dims()
                        ),
                        path,
                    ));
                }
                var.set(&t.to_dtype(var.dtype())?)?;
                report.loaded += 1;
            }
            None => report.missing.push(name.clone()),
        }
    }
    report.unexpected = tensors
        .keys()
        .filter(|k| !data.contains_key(*k))
        .cloned()
        .collect();
    report.missing.sort();
    report.unexpected.sort();
    Ok(report)
}

/// Write every variable to `path` in safetensors format, cast to `dtype`.
pub fn save_weights(varmap: &VarMap, path: &Path, dtype: DType) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| checkpoint_error("variable map lock poisoned", path))?;
    let tensors = data
        .iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().to_dtype(dtype)?)))
        .collect::<Result<HashMap<String, Tensor>>>()?;
    candle_core::safetensors::save(&tensors, path).map_err(|e| checkpoint_error(e, path))
}

/// Write `config.json` and `tokenizer.json` into `dir`.
pub fn save_pretrained(dir: &Path, config: &ModelConfig, tokenizer: &TextTokenizer) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| checkpoint_error(e, dir))?;
    config.to_json_file(&dir.join("config.json"))?;
    tokenizer.save(dir)
}
