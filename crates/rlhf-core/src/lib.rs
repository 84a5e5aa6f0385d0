//! # rlhf-core
//!
//! Shared plumbing for the PPO RLHF trainer:
//!
//! - [`config`]: strongly-typed YAML configuration with validation
//! - [`engine_config`]: engine JSON and its train/eval derivations
//! - [`overrides`]: `--section:key value` command-line merging
//! - [`registry`]: explicit model alias registry
//! - [`error`]: the workspace error type

pub mod config;
pub mod engine_config;
pub mod error;
pub mod overrides;
pub mod registry;

pub use config::{
    read_cfgs, DataCfgs, DatasetSource, EvalStrategy, LogType, LoggerCfgs, LrSchedulerType,
    ModelCfgs, PpoConfig, TrainCfgs,
};
pub use engine_config::{total_training_steps, EngineConfig, Precision};
pub use error::{Result, RlhfError};
pub use overrides::{apply_overrides, parse_args, Override};
pub use registry::{ModelInfo, ModelRegistry};
