//! Self-contained smoke-run workspace: tiny random models, a word-level
//! tokenizer, JSONL prompt data and a matching config tree.
//!
//! ```text
//! <out>/models/{actor,reward}/   config.json, tokenizer.json, model.safetensors
//! <out>/data/prompts/            train.jsonl, eval.jsonl
//! <out>/data/sft/                train.jsonl
//! <out>/configs/                 train/ppo.yaml, deepspeed/ds_z0_config.json, model_info.yaml
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use rlhf_core::error::IoResultExt;
use rlhf_core::{EvalStrategy, LogType, PpoConfig, Result};
use rlhf_model::pretrained::{save_pretrained, save_weights};
use rlhf_model::{CausalLm, ModelConfig, ScoreLm, TextTokenizer};
use serde::Serialize;
use tracing::info;

const DEFAULT_PPO_YAML: &str = include_str!("../../../configs/train/ppo.yaml");

pub const WORDS: &[&str] = &[
    "hi", "there", "how", "are", "you", "fine", "thanks", "what", "is", "the", "weather", "like", "today", "sunny",
    "rainy", "good", "bad", "tell", "me", "a", "story", "once", "upon", "time", "cat", "dog", "ran", "away", "home",
    "please", "help", "sure", "yes", "no",
];

const PROMPTS: &[&str] = &[
    "hi there",
    "how are you",
    "what is the weather like today",
    "tell me a story",
    "is the cat home",
    "please help me",
    "what is a dog",
    "how is the weather",
];

const SFT: &[(&str, &str)] = &[
    ("hi there", "hi how are you"),
    ("how are you", "fine thanks"),
    ("tell me a story", "once upon a time a cat ran away"),
    ("is it sunny", "yes it is sunny today"),
];

/// Knobs of the generated workspace.
#[derive(Debug, Clone)]
pub struct TinyOptions {
    pub model_max_length: usize,
    /// Prompts in the training split; the eval split holds half as many.
    pub num_prompts: usize,
    pub with_eval: bool,
    pub with_ptx: bool,
}

impl Default for TinyOptions {
    fn default() -> Self {
        Self {
            model_max_length: 16,
            num_prompts: 8,
            with_eval: true,
            with_ptx: true,
        }
    }
}

fn write_jsonl<T: Serialize>(path: &Path, records: impl IntoIterator<Item = T>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_path(parent)?;
    }
    let mut file = std::fs::File::create(path).with_path(path)?;
    for record in records {
        writeln!(file, "{}", serde_json::to_string(&record)?).with_path(path)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct PromptRecord<'a> {
    prompt: &'a str,
}

#[derive(Serialize)]
struct SftRecord<'a> {
    prompt: &'a str,
    response: &'a str,
}

fn tiny_model_config(tokenizer: &TextTokenizer) -> ModelConfig {
    let special = tokenizer.special();
    let mut config = ModelConfig::tiny(tokenizer.vocab_size());
    config.bos_token_id = special.bos;
    config.eos_token_id = special.eos;
    config.pad_token_id = special.pad;
    config.unk_token_id = special.unk;
    config
}

fn write_actor(dir: &Path, config: &ModelConfig, tokenizer: &TextTokenizer) -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    CausalLm::new(config, vb)?;
    save_pretrained(dir, config, tokenizer)?;
    save_weights(&varmap, &dir.join("model.safetensors"), DType::F32)
}

fn write_reward(dir: &Path, config: &ModelConfig, tokenizer: &TextTokenizer) -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    ScoreLm::new(config, vb)?;
    save_pretrained(dir, config, tokenizer)?;
    save_weights(&varmap, &dir.join("model.safetensors"), DType::F32)
}

/// PPO config wired to the tiny workspace under `root`.
pub fn tiny_ppo_config(root: &Path, opts: &TinyOptions) -> Result<PpoConfig> {
    let mut cfgs = PpoConfig::from_value(serde_yaml::from_str(DEFAULT_PPO_YAML)?)?;
    let path = |p: &str| root.join(p).display().to_string();

    let t = &mut cfgs.train_cfgs;
    t.per_device_prompt_batch_size = 4;
    t.per_device_train_batch_size = 2;
    t.per_device_eval_batch_size = 4;
    t.gradient_accumulation_steps = 1;
    t.actor_gradient_checkpointing = false;
    t.critic_gradient_checkpointing = false;
    t.actor_lr = 1.0e-4;
    t.critic_lr = 1.0e-4;
    t.bf16 = false;
    t.eval_strategy = EvalStrategy::Epoch;

    let d = &mut cfgs.data_cfgs;
    d.train_datasets = path("data/prompts");
    d.train_template = Some("Plain".to_string());
    d.train_split = Some("train".to_string());
    if opts.with_eval {
        d.eval_datasets = Some(path("data/prompts"));
        d.eval_template = Some("Plain".to_string());
        d.eval_split = Some("eval".to_string());
    }
    if opts.with_ptx {
        d.ptx_datasets = Some(path("data/sft"));
        d.ptx_template = Some("Plain".to_string());
        d.ptx_split = Some("train".to_string());
    }

    let l = &mut cfgs.logger_cfgs;
    l.log_type = LogType::Jsonl;
    l.log_project = "tiny".to_string();
    l.output_dir = root.join("outputs/ppo");

    let m = &mut cfgs.model_cfgs;
    m.actor_model_name_or_path = "tiny-actor".to_string();
    m.reward_model_name_or_path = "tiny-reward".to_string();
    m.reward_critic_model_name_or_path = "tiny-reward".to_string();
    m.model_max_length = opts.model_max_length;

    cfgs.check()?;
    Ok(cfgs)
}

/// Write the workspace into `root` and return its config root.
pub fn init_tiny(root: &Path, opts: &TinyOptions) -> Result<PathBuf> {
    let tokenizer = TextTokenizer::word_level(WORDS, opts.model_max_length)?;
    let model_config = tiny_model_config(&tokenizer);
    write_actor(&root.join("models/actor"), &model_config, &tokenizer)?;
    write_reward(&root.join("models/reward"), &model_config, &tokenizer)?;

    let prompts = PROMPTS.iter().cycle();
    write_jsonl(
        &root.join("data/prompts/train.jsonl"),
        prompts.clone().take(opts.num_prompts).map(|&prompt| PromptRecord { prompt }),
    )?;
    write_jsonl(
        &root.join("data/prompts/eval.jsonl"),
        prompts.take((opts.num_prompts / 2).max(1)).map(|&prompt| PromptRecord { prompt }),
    )?;
    write_jsonl(
        &root.join("data/sft/train.jsonl"),
        SFT.iter().map(|&(prompt, response)| SftRecord { prompt, response }),
    )?;

    let config_root = root.join("configs");
    let train_dir = config_root.join("train");
    let ds_dir = config_root.join("deepspeed");
    std::fs::create_dir_all(&train_dir).with_path(&train_dir)?;
    std::fs::create_dir_all(&ds_dir).with_path(&ds_dir)?;

    let cfgs = tiny_ppo_config(root, opts)?;
    let ppo_path = train_dir.join("ppo.yaml");
    std::fs::write(&ppo_path, serde_yaml::to_string(&cfgs.to_value()?)?).with_path(&ppo_path)?;

    let engine = serde_json::json!({
        "train_batch_size": null,
        "train_micro_batch_size_per_gpu": 2,
        "gradient_accumulation_steps": 1,
        "gradient_clipping": 1.0,
        "zero_optimization": { "stage": 0 },
        "bf16": { "enabled": false },
        "fp16": { "enabled": false }
    });
    let engine_path = ds_dir.join(&cfgs.train_cfgs.ds_cfgs);
    std::fs::write(&engine_path, serde_json::to_string_pretty(&engine)?).with_path(&engine_path)?;

    let registry = serde_json::json!({
        "tiny-actor": { "model_name_or_path": root.join("models/actor").display().to_string(), "template": "Plain" },
        "tiny-reward": { "model_name_or_path": root.join("models/reward").display().to_string(), "template": "Plain" },
    });
    let registry_path = config_root.join("model_info.yaml");
    std::fs::write(&registry_path, serde_yaml::to_string(&registry)?).with_path(&registry_path)?;

    info!(root = %root.display(), vocab_size = tokenizer.vocab_size(), "tiny workspace written");
    Ok(config_root)
}
