//! Experience collection: generate, score and cache log-probabilities.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rlhf_core::Result;
use rlhf_model::{batch_retokenize, GenerationConfig, TextTokenizer};
use tracing::debug;

use crate::batch::{InferenceBatch, PromptBatch, TrainingBatch};
use crate::distributed::{Collective, SyncedStop};
use crate::ensemble::{LanguageModel, ModelEnsemble, ScoreModel, TrainableModel};
use crate::loss::next_token_log_probs;

/// Everything a rollout needs besides the models.
pub struct RolloutContext<'a> {
    /// Rows per generated micro-batch (`per_device_train_batch_size`).
    pub micro_batch_size: usize,
    pub generation: &'a GenerationConfig,
    pub actor_tokenizer: &'a TextTokenizer,
    /// Set only when the reward model uses a different vocabulary.
    pub reward_tokenizer: Option<&'a TextTokenizer>,
    /// Re-enable actor gradient checkpointing after the micro-batch is scored.
    pub actor_gradient_checkpointing: bool,
    pub collective: &'a dyn Collective,
}

/// `(ids != pad) && (ids != unk)` as a u8 mask.
pub fn sequence_attention_mask(input_ids: &Tensor, pad_token_id: u32, unk_token_id: Option<u32>) -> Result<Tensor> {
    let mut mask = input_ids.ne(pad_token_id)?;
    if let Some(unk) = unk_token_id {
        mask = (mask * input_ids.ne(unk)?)?;
    }
    Ok(mask.to_dtype(DType::U8)?)
}

/// Run one prompt batch through the four models, one micro-batch at a time.
///
/// Returns parallel lists of inference and training batches. Trained models
/// are in eval mode while a micro-batch is processed and back in train mode
/// afterwards; every returned tensor is detached.
pub fn rollout<A, R, W, C>(
    models: &mut ModelEnsemble<A, R, W, C>,
    prompt: &PromptBatch,
    ctx: &RolloutContext<'_>,
    rng: &mut StdRng,
) -> Result<(Vec<InferenceBatch>, Vec<TrainingBatch>)>
where
    A: LanguageModel + TrainableModel,
    R: LanguageModel,
    W: ScoreModel,
    C: ScoreModel + TrainableModel,
{
    let micro_batches = prompt.micro_batches(ctx.micro_batch_size)?;
    let mut inference_batches = Vec::with_capacity(micro_batches.len());
    let mut training_batches = Vec::with_capacity(micro_batches.len());

    for micro in &micro_batches {
        models.set_train(false);
        let result = rollout_micro_batch(models, micro, ctx, rng);
        models.set_train(true);
        let (inference, training) = result?;
        inference_batches.push(inference);
        training_batches.push(training);
    }
    Ok((inference_batches, training_batches))
}

fn rollout_micro_batch<A, R, W, C>(
    models: &mut ModelEnsemble<A, R, W, C>,
    prompt: &PromptBatch,
    ctx: &RolloutContext<'_>,
    rng: &mut StdRng,
) -> Result<(InferenceBatch, TrainingBatch)>
where
    A: LanguageModel + TrainableModel,
    R: LanguageModel,
    W: ScoreModel,
    C: ScoreModel + TrainableModel,
{
    // Off for generation and scoring alike.
    if ctx.actor_gradient_checkpointing {
        models.actor.gradient_checkpointing_disable();
    }
    let result = generate_and_score(models, prompt, ctx, rng);
    if ctx.actor_gradient_checkpointing {
        models.actor.gradient_checkpointing_enable();
    }
    result
}

fn generate_and_score<A, R, W, C>(
    models: &ModelEnsemble<A, R, W, C>,
    prompt: &PromptBatch,
    ctx: &RolloutContext<'_>,
    rng: &mut StdRng,
) -> Result<(InferenceBatch, TrainingBatch)>
where
    A: LanguageModel,
    R: LanguageModel,
    W: ScoreModel,
    C: ScoreModel,
{
    let input_ids = models
        .actor
        .generate(
            &prompt.input_ids,
            &prompt.attention_mask,
            ctx.generation,
            rng,
            &SyncedStop(ctx.collective),
        )?
        .detach();
    let attention_mask = sequence_attention_mask(
        &input_ids,
        ctx.generation.pad_token_id,
        ctx.actor_tokenizer.special().unk,
    )?;
    let inference = InferenceBatch {
        input_ids,
        attention_mask,
    };
    let training = score_sequences(models, &inference, prompt.prompt_len()?, ctx)?;
    Ok((inference, training))
}

fn score_sequences<A, R, W, C>(
    models: &ModelEnsemble<A, R, W, C>,
    batch: &InferenceBatch,
    prompt_len: usize,
    ctx: &RolloutContext<'_>,
) -> Result<TrainingBatch>
where
    A: LanguageModel,
    R: LanguageModel,
    W: ScoreModel,
    C: ScoreModel,
{
    let ids = &batch.input_ids;
    let mask = &batch.attention_mask;
    let (_, len) = ids.dims2()?;

    let reward = match ctx.reward_tokenizer {
        Some(reward_tokenizer) => {
            let (reward_ids, reward_mask) =
                batch_retokenize(ids, ctx.actor_tokenizer, reward_tokenizer, ids.device())?;
            models.reward.score(&reward_ids, &reward_mask)?
        }
        None => models.reward.score(ids, mask)?,
    }
    .end_scores
    .flatten_all()?
    .to_dtype(DType::F32)?
    .detach();

    let reward_values = models
        .critic
        .score(ids, mask)?
        .clipped_scores
        .narrow(1, 0, len - 1)?
        .to_dtype(DType::F32)?
        .detach();

    let logits = models.actor.logits(ids, mask)?;
    let log_probs = next_token_log_probs(&logits, ids)?.detach();
    let ref_logits = models.reference.logits(ids, mask)?;
    let ref_log_probs = next_token_log_probs(&ref_logits, ids)?.detach();

    debug!(
        rows = ids.dim(0)?,
        sequence_length = len,
        prompt_length = prompt_len,
        "rollout micro-batch scored"
    );

    Ok(TrainingBatch {
        prompt_idx: prompt_len - 1,
        log_probs,
        ref_log_probs,
        reward,
        reward_values,
    })
}
