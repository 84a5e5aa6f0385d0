//! Actor checkpoints.
//!
//! Creates, in the output directory:
//!   - `config.json`: model architecture and special token ids
//!   - `tokenizer.json`: actor tokenizer
//!   - `pytorch_model.bin` or `pytorch_model_<step>.bin`: weights (safetensors
//!     format) cast to the engine's save precision

use std::path::{Path, PathBuf};

use rlhf_core::error::checkpoint_error;
use rlhf_core::Result;
use rlhf_model::pretrained::save_pretrained;
use rlhf_model::{ModelConfig, TextTokenizer};

use crate::distributed::Collective;
use crate::ensemble::TrainableModel;
use crate::logging::log_checkpoint_save;

/// `pytorch_model_<step>.bin` for periodic saves, `pytorch_model.bin` for the
/// final one.
pub fn weights_file_name(tag: Option<usize>) -> String {
    match tag {
        Some(step) => format!("pytorch_model_{step}.bin"),
        None => "pytorch_model.bin".to_string(),
    }
}

/// Save the actor. Every worker must call this; only the main worker writes.
/// Returns the weights path.
pub fn save_actor(
    actor: &dyn TrainableModel,
    config: &ModelConfig,
    tokenizer: &TextTokenizer,
    output_dir: &Path,
    tag: Option<usize>,
    collective: &dyn Collective,
) -> Result<PathBuf> {
    collective.barrier();
    let weights = output_dir.join(weights_file_name(tag));
    let outcome = if collective.is_main() {
        write_actor(actor, config, tokenizer, output_dir, &weights)
    } else {
        Ok(())
    };
    collective.barrier();
    outcome?;
    if collective.is_main() {
        log_checkpoint_save(tag.unwrap_or(0), &weights.display().to_string());
    }
    Ok(weights)
}

fn write_actor(
    actor: &dyn TrainableModel,
    config: &ModelConfig,
    tokenizer: &TextTokenizer,
    output_dir: &Path,
    weights: &Path,
) -> Result<()> {
    std::fs::create_dir_all(output_dir).map_err(|e| checkpoint_error(e, output_dir))?;
    actor.save_16bit(weights)?;
    save_pretrained(output_dir, config, tokenizer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_file_names() {
        assert_eq!(weights_file_name(Some(200)), "pytorch_model_200.bin");
        assert_eq!(weights_file_name(None), "pytorch_model.bin");
    }
}
