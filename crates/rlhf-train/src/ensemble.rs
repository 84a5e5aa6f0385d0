//! Role-tagged models of a PPO run and the capabilities each role needs.
//!
//! The actor and the reward critic are trained; the reference policy and the
//! reward model only run forward. Rollout and the RL step are written against
//! these traits so they work the same over candle engines and test stubs.

use std::path::Path;

use candle_core::Tensor;
use rand::rngs::StdRng;
use rlhf_core::Result;
use rlhf_model::{GenerationConfig, ScoreOutput, StopSync};

/// A causal language model that can be run forward and sampled from.
pub trait LanguageModel {
    /// Logits `[B, T, vocab]`. Whether they carry gradients depends on the
    /// implementation.
    fn logits(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    /// Full sequences `[B, L]` (prompt followed by the sampled response).
    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        cfg: &GenerationConfig,
        rng: &mut StdRng,
        sync: &dyn StopSync,
    ) -> Result<Tensor> {
        let sequences = rlhf_model::generate(
            |ids, mask| {
                self.logits(ids, mask)
                    .map_err(|e| candle_core::Error::Msg(e.to_string()))
            },
            input_ids,
            attention_mask,
            cfg,
            rng,
            sync,
        )?;
        Ok(sequences)
    }
}

/// A model with a scalar head: per-token scores plus the score at each row's
/// last valid token.
pub trait ScoreModel {
    fn score(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<ScoreOutput>;
}

/// Optimizer-owning side of a trained model.
pub trait TrainableModel {
    /// Accumulate gradients of `loss`.
    fn backward(&mut self, loss: &Tensor) -> Result<()>;

    /// Apply an optimizer update once the accumulation window is full;
    /// a no-op on the other micro-steps.
    fn step(&mut self) -> Result<()>;

    /// Train mode enables dropout.
    fn set_train(&mut self, train: bool);

    fn is_training(&self) -> bool;

    fn gradient_checkpointing_enable(&mut self);

    fn gradient_checkpointing_disable(&mut self);

    fn is_gradient_checkpointing(&self) -> bool;

    /// Learning rate the next update will use.
    fn lr(&self) -> f64;

    /// Write all weights, cast to the engine's save precision, to `path`.
    fn save_16bit(&self, path: &Path) -> Result<()>;
}

/// The four models of a PPO run.
pub struct ModelEnsemble<A, R, W, C> {
    /// Policy being optimized.
    pub actor: A,
    /// Frozen copy of the initial policy.
    pub reference: R,
    /// Frozen reward model.
    pub reward: W,
    /// Value function, initialized from a score model.
    pub critic: C,
}

impl<A, R, W, C> ModelEnsemble<A, R, W, C>
where
    A: TrainableModel,
    C: TrainableModel,
{
    /// Switch both trained models between train and eval mode.
    pub fn set_train(&mut self, train: bool) {
        self.actor.set_train(train);
        self.critic.set_train(train);
    }
}
