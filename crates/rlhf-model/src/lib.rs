//! # rlhf-model
//!
//! Models used by the PPO trainer, built on candle:
//!
//! - [`lm::CausalLm`]: decoder-only language model (actor and reference)
//! - [`score::ScoreLm`]: same backbone with a scalar head (reward and critic)
//! - [`tokenizer::TextTokenizer`]: padding-aware tokenizer wrapper
//! - [`generate`]: temperature / top-p / repetition-penalty sampling
//! - [`pretrained`]: model directory load and save

pub mod attention;
pub mod block;
pub mod config;
pub mod generate;
pub mod layers;
pub mod lm;
pub mod pretrained;
pub mod score;
pub mod tokenizer;

pub use config::ModelConfig;
pub use generate::{generate, GenerationConfig, LocalStop, StopSync};
pub use lm::CausalLm;
pub use pretrained::{load_pretrained, load_pretrained_score, LoadOptions, Pretrained};
pub use score::{last_valid_indices, ScoreLm, ScoreOutput};
pub use tokenizer::{batch_retokenize, PaddingSide, TextTokenizer};
