//! Typed PPO configuration.
//!
//! Every recognized option is a field. Required keys carry no serde default, so a
//! missing key fails deserialization instead of silently reading as empty, and
//! unknown keys are rejected so a mistyped override never goes unnoticed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine_config::EngineConfig;
use crate::error::{config_error, parse_error, IoResultExt, Result, RlhfError};

/// When periodic evaluation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStrategy {
    /// Every `eval_interval` global steps.
    Steps,
    /// Once at the end of every epoch.
    Epoch,
}

/// Learning-rate schedule shape (warmup is linear for all of them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    Linear,
    Cosine,
    Constant,
    ConstantWithWarmup,
}

/// Metric sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    /// Append metrics to `metrics.jsonl` in the run directory.
    Jsonl,
    /// Only emit tracing events.
    Console,
}

fn default_adam_epsilon() -> f64 {
    1e-8
}

/// `train_cfgs` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainCfgs {
    /// Engine JSON file name under `configs/deepspeed/`.
    pub ds_cfgs: String,
    pub epochs: usize,
    pub seed: u64,
    pub per_device_prompt_batch_size: usize,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub actor_gradient_checkpointing: bool,
    pub critic_gradient_checkpointing: bool,
    pub actor_lr: f64,
    pub actor_lr_scheduler_type: LrSchedulerType,
    pub actor_lr_warmup_ratio: f64,
    pub actor_weight_decay: f64,
    pub critic_lr: f64,
    pub critic_lr_scheduler_type: LrSchedulerType,
    pub critic_lr_warmup_ratio: f64,
    pub critic_weight_decay: f64,
    pub adam_betas: (f64, f64),
    #[serde(default = "default_adam_epsilon")]
    pub adam_epsilon: f64,
    pub bf16: bool,
    pub fp16: bool,
    pub eval_strategy: EvalStrategy,
    pub eval_interval: usize,
    pub kl_coeff: f64,
    pub clip_range_ratio: f64,
    pub clip_range_score: f64,
    pub clip_range_value: f64,
    pub ptx_coeff: f64,
    pub gamma: f64,
    pub gae_lambda: f64,
    pub update_iters: usize,
}

/// One dataset source as seen by the loaders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSource {
    pub path: String,
    pub template: Option<String>,
    pub size: Option<usize>,
    pub split: Option<String>,
    pub subset: Option<String>,
    pub data_files: Option<String>,
}

/// `data_cfgs` section. Evaluation and PTX sources are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataCfgs {
    pub train_datasets: String,
    #[serde(default)]
    pub train_template: Option<String>,
    #[serde(default)]
    pub train_size: Option<usize>,
    #[serde(default)]
    pub train_split: Option<String>,
    #[serde(default)]
    pub train_subset: Option<String>,
    #[serde(default)]
    pub train_data_files: Option<String>,

    #[serde(default)]
    pub eval_datasets: Option<String>,
    #[serde(default)]
    pub eval_template: Option<String>,
    #[serde(default)]
    pub eval_size: Option<usize>,
    #[serde(default)]
    pub eval_split: Option<String>,
    #[serde(default)]
    pub eval_subset: Option<String>,
    #[serde(default)]
    pub eval_data_files: Option<String>,

    #[serde(default)]
    pub ptx_datasets: Option<String>,
    #[serde(default)]
    pub ptx_template: Option<String>,
    #[serde(default)]
    pub ptx_size: Option<usize>,
    #[serde(default)]
    pub ptx_split: Option<String>,
    #[serde(default)]
    pub ptx_subset: Option<String>,
    #[serde(default)]
    pub ptx_data_files: Option<String>,
}

impl DataCfgs {
    pub fn train(&self) -> DatasetSource {
        DatasetSource {
            path: self.train_datasets.clone(),
            template: self.train_template.clone(),
            size: self.train_size,
            split: self.train_split.clone(),
            subset: self.train_subset.clone(),
            data_files: self.train_data_files.clone(),
        }
    }

    pub fn eval(&self) -> Option<DatasetSource> {
        let path = self.eval_datasets.clone().filter(|p| !p.is_empty())?;
        Some(DatasetSource {
            path,
            template: self.eval_template.clone(),
            size: self.eval_size,
            split: self.eval_split.clone(),
            subset: self.eval_subset.clone(),
            data_files: self.eval_data_files.clone(),
        })
    }

    pub fn ptx(&self) -> Option<DatasetSource> {
        let path = self.ptx_datasets.clone().filter(|p| !p.is_empty())?;
        Some(DatasetSource {
            path,
            template: self.ptx_template.clone(),
            size: self.ptx_size,
            split: self.ptx_split.clone(),
            subset: self.ptx_subset.clone(),
            data_files: self.ptx_data_files.clone(),
        })
    }
}

/// `logger_cfgs` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerCfgs {
    pub log_type: LogType,
    pub log_project: String,
    pub log_run_name: String,
    pub output_dir: PathBuf,
    pub save_interval: usize,
}

/// `model_cfgs` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelCfgs {
    pub actor_model_name_or_path: String,
    pub reward_model_name_or_path: String,
    pub reward_critic_model_name_or_path: String,
    pub model_max_length: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f64,
}

/// Full PPO configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PpoConfig {
    pub train_cfgs: TrainCfgs,
    pub data_cfgs: DataCfgs,
    pub logger_cfgs: LoggerCfgs,
    pub model_cfgs: ModelCfgs,
}

impl PpoConfig {
    /// Deserialize from an already-merged YAML tree.
    pub fn from_value(value: serde_yaml::Value) -> Result<Self> {
        serde_yaml::from_value(value).map_err(|e| config_error(e.to_string()))
    }

    /// Load and deserialize a YAML file without overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let value = load_yaml(path)?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Result<serde_yaml::Value> {
        Ok(serde_yaml::to_value(self)?)
    }

    pub fn use_ptx(&self) -> bool {
        self.data_cfgs.ptx().is_some()
    }

    /// Check cross-field constraints. All problems are reported together.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let t = &self.train_cfgs;
        let m = &self.model_cfgs;

        if t.per_device_train_batch_size == 0 {
            errors.push("per_device_train_batch_size must be greater than 0".to_string());
        } else if !t
            .per_device_prompt_batch_size
            .is_multiple_of(t.per_device_train_batch_size)
        {
            errors.push(format!(
                "The number of prompt-only samples must be divisible by the micro batch size \
                 (per_device_prompt_batch_size={}, per_device_train_batch_size={})",
                t.per_device_prompt_batch_size, t.per_device_train_batch_size
            ));
        }
        if t.per_device_prompt_batch_size == 0 {
            errors.push("per_device_prompt_batch_size must be greater than 0".to_string());
        }
        if t.per_device_eval_batch_size == 0 {
            errors.push("per_device_eval_batch_size must be greater than 0".to_string());
        }
        if t.gradient_accumulation_steps == 0 {
            errors.push("gradient_accumulation_steps must be greater than 0".to_string());
        }
        if t.update_iters == 0 {
            errors.push("update_iters must be greater than 0".to_string());
        }
        if t.eval_strategy == EvalStrategy::Steps && t.eval_interval == 0 {
            errors.push("eval_interval must be greater than 0 when eval_strategy is steps".to_string());
        }
        if self.logger_cfgs.save_interval == 0 {
            errors.push("save_interval must be greater than 0".to_string());
        }
        for (name, value) in [("gamma", t.gamma), ("gae_lambda", t.gae_lambda)] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{} ({}) must be in [0, 1]", name, value));
            }
        }
        for (name, value) in [
            ("clip_range_ratio", t.clip_range_ratio),
            ("clip_range_score", t.clip_range_score),
            ("clip_range_value", t.clip_range_value),
        ] {
            if value <= 0.0 {
                errors.push(format!("{} ({}) must be positive", name, value));
            }
        }
        for (name, value) in [
            ("actor_lr_warmup_ratio", t.actor_lr_warmup_ratio),
            ("critic_lr_warmup_ratio", t.critic_lr_warmup_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{} ({}) must be in [0, 1]", name, value));
            }
        }
        if t.actor_lr < 0.0 || t.critic_lr < 0.0 {
            errors.push("learning rates must be non-negative".to_string());
        }
        let (b1, b2) = t.adam_betas;
        if !(0.0..1.0).contains(&b1) || !(0.0..1.0).contains(&b2) {
            errors.push(format!("adam_betas ({}, {}) must be in [0, 1)", b1, b2));
        }
        if t.bf16 && t.fp16 {
            errors.push("bf16 and fp16 cannot both be enabled".to_string());
        }
        if m.model_max_length < 2 {
            errors.push("model_max_length must be at least 2".to_string());
        }
        if m.temperature <= 0.0 {
            errors.push(format!("temperature ({}) must be positive", m.temperature));
        }
        if !(m.top_p > 0.0 && m.top_p <= 1.0) {
            errors.push(format!("top_p ({}) must be in (0, 1]", m.top_p));
        }
        if m.repetition_penalty <= 0.0 {
            errors.push(format!(
                "repetition_penalty ({}) must be positive",
                m.repetition_penalty
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// `validate()` mapped into the workspace error type.
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(RlhfError::Validation)
    }
}

/// Read a YAML file into an untyped tree.
pub fn load_yaml(path: &Path) -> Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path).with_path(path)?;
    serde_yaml::from_str(&text).map_err(|e| parse_error(e, path))
}

/// Read `configs/<mode>/<task>.yaml` and the engine JSON it names.
///
/// The YAML is returned untyped so command-line overrides can be merged before
/// deserialization.
pub fn read_cfgs(config_root: &Path, mode: &str, task: &str) -> Result<(serde_yaml::Value, EngineConfig)> {
    let yaml_path = config_root.join(mode).join(format!("{task}.yaml"));
    let cfgs = load_yaml(&yaml_path)?;

    let ds_name = cfgs
        .get("train_cfgs")
        .and_then(|t| t.get("ds_cfgs"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| parse_error("missing train_cfgs.ds_cfgs", &yaml_path))?;
    let ds_path = config_root.join("deepspeed").join(ds_name);
    let engine = EngineConfig::from_file(&ds_path)?;

    Ok((cfgs, engine))
}
