//! # RLHF Training Library
//!
//! PPO fine-tuning of a causal language model against a frozen reward model.
//!
//! ## Architecture Overview
//!
//! - **Models**: actor and reward critic are trained through [`engine::TrainEngine`];
//!   the reference policy and reward model run through [`engine::EvalEngine`]
//! - **Rollout**: sampled responses are scored once and cached per micro-batch
//! - **Updates**: KL-shaped rewards, GAE advantages, clipped surrogate losses
//!   and an optional pretraining (PTX) objective
//! - **Data parallelism**: workers as threads meeting at [`distributed::Collective`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use candle_core::Device;
//! use rlhf_core::{read_cfgs, ModelRegistry, PpoConfig};
//! use rlhf_train::distributed::SingleProcess;
//! use rlhf_train::trainer::CandlePpoTrainer;
//!
//! # fn main() -> anyhow::Result<()> {
//! let root = Path::new("configs");
//! let (value, engine) = read_cfgs(root, "train", "ppo")?;
//! let cfgs = PpoConfig::from_value(value)?;
//! let registry = ModelRegistry::from_file(&root.join("model_info.yaml"))?;
//! let mut trainer =
//!     CandlePpoTrainer::from_config(cfgs, &engine, &registry, Arc::new(SingleProcess), &Device::Cpu)?;
//! trainer.train()?;
//! trainer.save(None)?;
//! # Ok(())
//! # }
//! ```

pub mod advantage;
pub mod batch;
pub mod checkpoint;
pub mod data;
pub mod distributed;
pub mod engine;
pub mod ensemble;
pub mod logger;
pub mod logging;
pub mod loss;
pub mod optim;
pub mod rollout;
pub mod tiny;
pub mod trainer;

pub use batch::{InferenceBatch, PromptBatch, SupervisedBatch, TrainingBatch};
pub use distributed::{Collective, ReduceOp, SingleProcess, ThreadGroup};
pub use ensemble::{LanguageModel, ModelEnsemble, ScoreModel, TrainableModel};
pub use trainer::{CandlePpoTrainer, PpoTrainer, TrainerParts};
