//! PPO trainer: orchestrates rollout, RL and PTX updates, evaluation and
//! checkpointing across data-parallel workers.
//!
//! Loop structure per prompt batch:
//!
//! ```text
//! rollout -> update_iters x { per micro-batch: rl_step [+ ptx_step] }
//!         -> periodic save / eval -> next prompt batch
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rlhf_core::error::config_error;
use rlhf_core::{total_training_steps, EngineConfig, EvalStrategy, ModelCfgs, ModelRegistry, PpoConfig, TrainCfgs};
use rlhf_model::{
    load_pretrained, load_pretrained_score, CausalLm, GenerationConfig, LoadOptions, ModelConfig, PaddingSide,
    Pretrained, ScoreLm, TextTokenizer,
};
use tracing::{info, warn};

use crate::advantage::{add_kl_divergence_regularization, get_advantages_and_returns};
use crate::batch::{InferenceBatch, PromptBatch, SupervisedBatch, TrainingBatch};
use crate::checkpoint::save_actor;
use crate::data::{DataLoader, Dataset, DistributedSampler, PromptOnlyDataset, SupervisedDataset, Template};
use crate::distributed::{Collective, ReduceOp, SyncedStop};
use crate::engine::{EngineSettings, EvalEngine, TrainEngine};
use crate::ensemble::{LanguageModel, ModelEnsemble, ScoreModel, TrainableModel};
use crate::logger::Logger;
use crate::logging::{log_evaluation, log_ptx_step, log_rl_step, RlStepMetrics};
use crate::loss::{actor_loss, critic_loss, language_modeling_loss, masked_mean, next_token_log_probs};
use crate::rollout::{rollout, RolloutContext};

/// Rows shown by the evaluation table.
pub const EVAL_TABLE_ROWS: usize = 5;

/// Sampling settings used for rollouts and evaluation.
pub fn generation_config(cfgs: &ModelCfgs, tokenizer: &TextTokenizer) -> GenerationConfig {
    GenerationConfig {
        max_length: cfgs.model_max_length,
        temperature: cfgs.temperature,
        top_p: cfgs.top_p,
        repetition_penalty: cfgs.repetition_penalty,
        do_sample: true,
        eos_token_id: tokenizer.special().eos,
        pad_token_id: tokenizer.pad_token_id(),
    }
}

/// Decoded generation with the decoded prompt removed from its front.
pub fn strip_prompt(generated: &str, prompt: &str) -> String {
    let response = match generated.strip_prefix(prompt) {
        Some(rest) => rest.to_string(),
        None => generated.chars().skip(prompt.chars().count()).collect(),
    };
    response.trim_start().to_string()
}

fn scalar(t: &Tensor) -> candle_core::Result<f64> {
    t.to_dtype(DType::F64)?.to_scalar::<f64>()
}

/// Everything a trainer is assembled from.
pub struct TrainerParts<A, R, W, C> {
    pub cfgs: PpoConfig,
    pub models: ModelEnsemble<A, R, W, C>,
    /// Written next to saved actor weights.
    pub actor_config: ModelConfig,
    pub actor_tokenizer: TextTokenizer,
    /// Only when it differs from the actor's.
    pub reward_tokenizer: Option<TextTokenizer>,
    pub prompt_loader: DataLoader<PromptOnlyDataset>,
    pub eval_loader: Option<DataLoader<PromptOnlyDataset>>,
    pub ptx_loader: Option<DataLoader<SupervisedDataset>>,
    pub collective: Arc<dyn Collective>,
    pub device: Device,
}

pub struct PpoTrainer<A, R, W, C> {
    cfgs: PpoConfig,
    models: ModelEnsemble<A, R, W, C>,
    actor_config: ModelConfig,
    actor_tokenizer: TextTokenizer,
    reward_tokenizer: Option<TextTokenizer>,
    generation_config: GenerationConfig,
    prompt_loader: Arc<DataLoader<PromptOnlyDataset>>,
    eval_loader: Option<Arc<DataLoader<PromptOnlyDataset>>>,
    ptx_loader: Option<Arc<DataLoader<SupervisedDataset>>>,
    collective: Arc<dyn Collective>,
    device: Device,
    logger: Logger,
    rng: StdRng,
    global_step: usize,
    total_training_steps: usize,
}

impl<A, R, W, C> PpoTrainer<A, R, W, C>
where
    A: LanguageModel + TrainableModel,
    R: LanguageModel,
    W: ScoreModel,
    C: ScoreModel + TrainableModel,
{
    pub fn new(parts: TrainerParts<A, R, W, C>) -> Result<Self> {
        let TrainerParts {
            cfgs,
            models,
            actor_config,
            actor_tokenizer,
            reward_tokenizer,
            prompt_loader,
            eval_loader,
            ptx_loader,
            collective,
            device,
        } = parts;
        let t = &cfgs.train_cfgs;
        let total = total_training_steps(
            prompt_loader.len(),
            t.epochs,
            t.update_iters,
            t.per_device_prompt_batch_size,
            t.per_device_train_batch_size,
        );
        let logger = Logger::new(
            &cfgs.logger_cfgs,
            &cfgs.data_cfgs.train_datasets,
            &cfgs,
            collective.is_main(),
        )
        .context("Failed to initialize the logger")?;
        let rng = StdRng::seed_from_u64(t.seed.wrapping_add(collective.rank() as u64));
        let generation_config = generation_config(&cfgs.model_cfgs, &actor_tokenizer);

        Ok(Self {
            models,
            actor_config,
            actor_tokenizer,
            reward_tokenizer,
            generation_config,
            prompt_loader: Arc::new(prompt_loader),
            eval_loader: eval_loader.map(Arc::new),
            ptx_loader: ptx_loader.map(Arc::new),
            collective,
            device,
            logger,
            rng,
            global_step: 0,
            total_training_steps: total,
            cfgs,
        })
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn total_training_steps(&self) -> usize {
        self.total_training_steps
    }

    pub fn models(&self) -> &ModelEnsemble<A, R, W, C> {
        &self.models
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn config(&self) -> &PpoConfig {
        &self.cfgs
    }

    pub fn use_ptx(&self) -> bool {
        self.ptx_loader.is_some()
    }

    /// Generate and score one prompt batch.
    pub fn rollout(&mut self, prompt: &PromptBatch) -> Result<(Vec<InferenceBatch>, Vec<TrainingBatch>)> {
        let ctx = RolloutContext {
            micro_batch_size: self.cfgs.train_cfgs.per_device_train_batch_size,
            generation: &self.generation_config,
            actor_tokenizer: &self.actor_tokenizer,
            reward_tokenizer: self.reward_tokenizer.as_ref(),
            actor_gradient_checkpointing: self.cfgs.train_cfgs.actor_gradient_checkpointing,
            collective: self.collective.as_ref(),
        };
        Ok(rollout(&mut self.models, prompt, &ctx, &mut self.rng)?)
    }

    fn mean_across_workers(&self, value: f64) -> Result<f64> {
        Ok(self.collective.all_reduce_scalar(value, ReduceOp::Mean)?)
    }

    /// One actor and one critic update on a cached rollout micro-batch.
    ///
    /// Shaped rewards, advantages and returns are recomputed from the cached
    /// batch every call.
    pub fn rl_step(&mut self, inference: &InferenceBatch, training: &TrainingBatch) -> Result<RlStepMetrics> {
        let t = &self.cfgs.train_cfgs;
        let input_ids = &inference.input_ids;
        let attention_mask = &inference.attention_mask;
        let sequence_mask = inference.sequence_mask()?;
        let start = training.prompt_idx;
        let length = sequence_mask.dim(1)?;
        let span = length.saturating_sub(start);

        let old_log_probs = &training.log_probs;
        let ref_log_probs = &training.ref_log_probs;
        let old_values = &training.reward_values;
        let old_rewards = add_kl_divergence_regularization(
            &training.reward,
            old_log_probs,
            ref_log_probs,
            &sequence_mask,
            t.kl_coeff,
            t.clip_range_score,
        )?;
        let (advantages, returns) =
            get_advantages_and_returns(old_values, &old_rewards, &sequence_mask, start, t.gamma, t.gae_lambda)?;
        let response_mask = sequence_mask.narrow(1, start, span)?;

        let logits = self.models.actor.logits(input_ids, attention_mask)?;
        let log_probs = next_token_log_probs(&logits, input_ids)?;
        let actor_loss = actor_loss(
            &log_probs.narrow(1, start, span)?,
            &old_log_probs.narrow(1, start, span)?,
            &advantages,
            &response_mask,
            t.clip_range_ratio,
        )?;
        self.models.actor.backward(&actor_loss)?;
        self.models.actor.step()?;

        let values = self
            .models
            .critic
            .score(input_ids, attention_mask)?
            .clipped_scores
            .narrow(1, 0, length)?
            .narrow(1, start, span)?;
        let reward_critic_loss = critic_loss(
            &values,
            &old_values.narrow(1, start, span)?,
            &returns,
            &response_mask,
            t.clip_range_value,
        )?;
        self.models.critic.backward(&reward_critic_loss)?;
        self.models.critic.step()?;

        let mask_f = sequence_mask.to_dtype(DType::F32)?;
        let kl_divergence = ((old_log_probs - ref_log_probs)? * &mask_f)?
            .narrow(1, start, span)?
            .sum(D::Minus1)?
            .mean_all()?;
        let reward_with_kl_penalty = (&old_rewards * &mask_f)?
            .narrow(1, start, span)?
            .sum(D::Minus1)?
            .mean_all()?;
        let generated_lengths = response_mask.to_dtype(DType::F32)?.sum(D::Minus1)?;

        let metrics = RlStepMetrics {
            actor_loss: self.mean_across_workers(scalar(&actor_loss)?)?,
            reward_critic_loss: self.mean_across_workers(scalar(&reward_critic_loss)?)?,
            reward: self.mean_across_workers(scalar(&training.reward.mean_all()?)?)?,
            reward_with_kl_penalty: self.mean_across_workers(scalar(&reward_with_kl_penalty)?)?,
            reward_advantage: self.mean_across_workers(scalar(&masked_mean(&advantages, Some(&response_mask))?)?)?,
            reward_return: self.mean_across_workers(scalar(&masked_mean(&returns, Some(&response_mask))?)?)?,
            reward_value: self.mean_across_workers(scalar(&masked_mean(&values.detach(), Some(&response_mask))?)?)?,
            kl_divergence: self.mean_across_workers(scalar(&kl_divergence)?)?,
            actor_lr: self.models.actor.lr(),
            reward_critic_lr: self.models.critic.lr(),
            mean_generated_length: self.mean_across_workers(scalar(&generated_lengths.mean_all()?)?)?,
            max_generated_length: self
                .collective
                .all_reduce_scalar(scalar(&generated_lengths.max(0)?)?, ReduceOp::Max)?,
        };
        self.collective.barrier();
        Ok(metrics)
    }

    /// One pretraining-mix update of the actor. Backpropagates the loss scaled
    /// by `ptx_coeff` and returns the unscaled loss averaged across workers.
    pub fn ptx_step(&mut self, batch: &SupervisedBatch) -> Result<f64> {
        let logits = self.models.actor.logits(&batch.input_ids, &batch.attention_mask)?;
        let lm_loss = language_modeling_loss(&logits, &batch.input_ids, &batch.loss_mask)?;
        self.models.actor.backward(&(&lm_loss * self.cfgs.train_cfgs.ptx_coeff)?)?;
        self.models.actor.step()?;
        self.mean_across_workers(scalar(&lm_loss)?)
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.collective.is_main() {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(self.total_training_steps as u64);
        if let Ok(style) = ProgressStyle::default_bar().template("{msg} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len}") {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb
    }

    fn ptx_batches(&self, epoch: u64, n_prompt_batches: usize) -> Result<Vec<Option<SupervisedBatch>>> {
        let Some(loader) = &self.ptx_loader else {
            return Ok(vec![None; n_prompt_batches]);
        };
        let replicas = n_prompt_batches.div_ceil(loader.len().max(1));
        let mut batches = Vec::new();
        for _ in 0..replicas {
            for batch in loader.iter(epoch) {
                if batches.len() == n_prompt_batches {
                    return Ok(batches);
                }
                batches.push(Some(batch?));
            }
        }
        Ok(batches)
    }

    /// Run every epoch of PPO training.
    pub fn train(&mut self) -> Result<()> {
        self.logger.print("***** Running training *****");
        let progress = self.progress_bar();

        if self.eval_loader.is_some() {
            self.logger.print("\n***** Evaluating at the beginning *****");
            self.eval()?;
        }

        let t: TrainCfgs = self.cfgs.train_cfgs.clone();
        let save_interval = self.cfgs.logger_cfgs.save_interval;
        let prompt_loader = Arc::clone(&self.prompt_loader);
        let n_prompt_batches = prompt_loader.len();

        for epoch in 0..t.epochs {
            let ptx_batches = self.ptx_batches(epoch as u64, n_prompt_batches)?;
            for (prompt, ptx) in prompt_loader.iter(epoch as u64).zip(ptx_batches) {
                let prompt = prompt?;
                let (inference_batches, training_batches) = self.rollout(&prompt)?;
                let mut ptx_micro_batches: Vec<Option<SupervisedBatch>> = match ptx {
                    Some(batch) => batch
                        .micro_batches(t.per_device_train_batch_size)?
                        .into_iter()
                        .map(Some)
                        .collect(),
                    None => Vec::new(),
                };
                ptx_micro_batches.resize(inference_batches.len(), None);

                for _ in 0..t.update_iters {
                    for ((inference, training), ptx_batch) in
                        inference_batches.iter().zip(&training_batches).zip(&ptx_micro_batches)
                    {
                        let metrics = self.rl_step(inference, training)?;
                        log_rl_step(self.global_step, &metrics);
                        self.logger.log(&metrics.to_map(), self.global_step)?;

                        if let Some(ptx_batch) = ptx_batch {
                            let ptx_loss = self.ptx_step(ptx_batch)?;
                            log_ptx_step(self.global_step, ptx_loss);
                            let ptx_metrics = BTreeMap::from([("train/ptx_loss".to_string(), ptx_loss)]);
                            self.logger.log(&ptx_metrics, self.global_step)?;
                        }

                        self.global_step += 1;
                        progress.set_message(format!(
                            "Training {}/{} epoch (reward {:.4})",
                            epoch + 1,
                            t.epochs,
                            metrics.reward
                        ));
                        progress.inc(1);

                        if self.global_step % save_interval == 0 {
                            self.logger
                                .print(&format!("Saving checkpoint at step {} ...", self.global_step));
                            self.save(Some(self.global_step))?;
                            self.logger.print("Checkpoint saved.");
                        }

                        if self.eval_loader.is_some()
                            && t.eval_strategy == EvalStrategy::Steps
                            && self.global_step % t.eval_interval == 0
                        {
                            self.logger
                                .print(&format!("\n***** Evaluating at step {} *****", self.global_step));
                            self.eval()?;
                        }
                    }
                }
            }

            if self.eval_loader.is_some() && t.eval_strategy == EvalStrategy::Epoch {
                self.logger
                    .print(&format!("\n***** Evaluating at epoch {}/{} *****", epoch + 1, t.epochs));
                self.eval()?;
            }
        }
        progress.finish();
        Ok(())
    }

    /// Sample responses for the evaluation prompts and show a few of them.
    pub fn eval(&mut self) -> Result<()> {
        let Some(loader) = self.eval_loader.clone() else {
            return Ok(());
        };
        self.models.set_train(false);

        let mut rows = Vec::new();
        for batch in loader.iter(0) {
            let batch = batch?;
            let sync = SyncedStop(self.collective.as_ref());
            let sequences = self.models.actor.generate(
                &batch.input_ids,
                &batch.attention_mask,
                &self.generation_config,
                &mut self.rng,
                &sync,
            )?;
            self.collective.barrier();

            let prompts = self
                .actor_tokenizer
                .decode_batch(&batch.input_ids.to_vec2::<u32>()?, true)?;
            let generated = self
                .actor_tokenizer
                .decode_batch(&sequences.to_vec2::<u32>()?, true)?;
            for (prompt, text) in prompts.into_iter().zip(generated) {
                let response = strip_prompt(&text, &prompt);
                rows.push(vec![prompt, response]);
            }
        }

        self.logger
            .print_table("Evaluating...", &["Prompt", "Generated"], &rows, EVAL_TABLE_ROWS);
        self.collective.barrier();
        self.models.set_train(true);
        if self.collective.is_main() {
            log_evaluation(self.global_step, rows.len());
        }
        Ok(())
    }

    /// Save the actor under `logger_cfgs.output_dir`: tagged with the step for
    /// periodic saves, untagged for the final model.
    pub fn save(&self, tag: Option<usize>) -> Result<PathBuf> {
        let path = save_actor(
            &self.models.actor,
            &self.actor_config,
            &self.actor_tokenizer,
            &self.cfgs.logger_cfgs.output_dir,
            tag,
            self.collective.as_ref(),
        )
        .context("Failed to save the actor checkpoint")?;
        Ok(path)
    }
}

/// Trainer over the candle engines.
pub type CandlePpoTrainer =
    PpoTrainer<TrainEngine<CausalLm>, EvalEngine<CausalLm>, EvalEngine<ScoreLm>, TrainEngine<ScoreLm>>;

struct LoadedModels {
    actor: Pretrained<CausalLm>,
    reference: Pretrained<CausalLm>,
    reward: Pretrained<ScoreLm>,
    critic: Pretrained<ScoreLm>,
}

fn init_models(cfgs: &PpoConfig, registry: &ModelRegistry, device: &Device) -> Result<LoadedModels> {
    let m = &cfgs.model_cfgs;
    let options = |padding_side| LoadOptions {
        model_max_length: m.model_max_length,
        padding_side,
        device: device.clone(),
    };
    let actor_path = registry.resolve_existing(&m.actor_model_name_or_path)?;
    let reward_path = registry.resolve_existing(&m.reward_model_name_or_path)?;
    let critic_path = registry.resolve_existing(&m.reward_critic_model_name_or_path)?;

    let actor = load_pretrained(&actor_path, &options(PaddingSide::Left))
        .with_context(|| format!("Failed to load actor from {}", actor_path.display()))?;
    let reference = load_pretrained(&actor_path, &options(PaddingSide::Left))
        .with_context(|| format!("Failed to load reference model from {}", actor_path.display()))?;
    let reward = load_pretrained_score(&reward_path, &options(PaddingSide::Right))
        .with_context(|| format!("Failed to load reward model from {}", reward_path.display()))?;
    let critic = load_pretrained_score(&critic_path, &options(PaddingSide::Left))
        .with_context(|| format!("Failed to load reward critic from {}", critic_path.display()))?;

    if !critic.tokenizer.is_same_as(&actor.tokenizer) {
        return Err(config_error(format!(
            "Reward critic tokenizer must be the same as actor tokenizer. \
             Expected vocab_size={}, but got vocab_size={}. \
             Please consider passing `--model_cfgs:reward_critic_model_name_or_path` from the command line.",
            actor.tokenizer.vocab_size(),
            critic.tokenizer.vocab_size()
        ))
        .into());
    }
    Ok(LoadedModels {
        actor,
        reference,
        reward,
        critic,
    })
}

struct Loaders {
    prompt: DataLoader<PromptOnlyDataset>,
    eval: Option<DataLoader<PromptOnlyDataset>>,
    ptx: Option<DataLoader<SupervisedDataset>>,
}

fn init_datasets(
    cfgs: &PpoConfig,
    registry: &ModelRegistry,
    tokenizer: &TextTokenizer,
    collective: &dyn Collective,
    device: &Device,
) -> Result<Loaders> {
    let t = &cfgs.train_cfgs;
    let (rank, world_size) = (collective.rank(), collective.world_size());
    let model_template = registry.template_for(&cfgs.model_cfgs.actor_model_name_or_path);

    let train = cfgs.data_cfgs.train();
    let template = Template::resolve(train.template.as_deref(), model_template)?;
    let prompts = PromptOnlyDataset::new(&train, template, tokenizer)
        .with_context(|| format!("Failed to load training prompts from {}", train.path))?;
    let sampler = DistributedSampler::new(prompts.len(), rank, world_size, true, t.seed);
    let prompt = DataLoader::new(prompts, t.per_device_prompt_batch_size, sampler, device);

    let eval = match cfgs.data_cfgs.eval() {
        Some(source) => {
            let template = Template::resolve(source.template.as_deref(), model_template)?;
            let prompts = PromptOnlyDataset::new(&source, template, tokenizer)
                .with_context(|| format!("Failed to load evaluation prompts from {}", source.path))?;
            let sampler = DistributedSampler::new(prompts.len(), rank, world_size, false, t.seed);
            Some(DataLoader::new(prompts, t.per_device_eval_batch_size, sampler, device))
        }
        None => None,
    };

    let ptx = match cfgs.data_cfgs.ptx() {
        Some(source) => {
            let template = Template::resolve(source.template.as_deref(), model_template)?;
            let supervised = SupervisedDataset::new(&source, template, tokenizer)
                .with_context(|| format!("Failed to load PTX data from {}", source.path))?;
            if supervised.is_empty() {
                warn!(dataset = %source.path, "PTX dataset is empty, training without PTX");
                None
            } else {
                let sampler = DistributedSampler::new(supervised.len(), rank, world_size, true, t.seed);
                Some(DataLoader::new(supervised, t.per_device_prompt_batch_size, sampler, device))
            }
        }
        None => None,
    };

    Ok(Loaders { prompt, eval, ptx })
}

fn actor_settings(t: &TrainCfgs, total_training_steps: usize) -> EngineSettings {
    EngineSettings {
        lr: t.actor_lr,
        lr_scheduler_type: t.actor_lr_scheduler_type,
        lr_warmup_ratio: t.actor_lr_warmup_ratio,
        weight_decay: t.actor_weight_decay,
        adam_betas: t.adam_betas,
        adam_epsilon: t.adam_epsilon,
        total_training_steps,
    }
}

fn critic_settings(t: &TrainCfgs, total_training_steps: usize) -> EngineSettings {
    EngineSettings {
        lr: t.critic_lr,
        lr_scheduler_type: t.critic_lr_scheduler_type,
        lr_warmup_ratio: t.critic_lr_warmup_ratio,
        weight_decay: t.critic_weight_decay,
        ..actor_settings(t, total_training_steps)
    }
}

impl CandlePpoTrainer {
    /// Load models and datasets, and build the engines, with a barrier after
    /// every phase.
    pub fn from_config(
        cfgs: PpoConfig,
        engine: &EngineConfig,
        registry: &ModelRegistry,
        collective: Arc<dyn Collective>,
        device: &Device,
    ) -> Result<Self> {
        cfgs.check()?;
        collective.barrier();

        let loaded = init_models(&cfgs, registry, device)?;
        let reward_tokenizer =
            (!loaded.reward.tokenizer.is_same_as(&loaded.actor.tokenizer)).then(|| loaded.reward.tokenizer.clone());
        info!(
            retokenize_for_reward = reward_tokenizer.is_some(),
            vocab_size = loaded.actor.tokenizer.vocab_size(),
            "models loaded"
        );
        collective.barrier();

        let loaders = init_datasets(&cfgs, registry, &loaded.actor.tokenizer, collective.as_ref(), device)?;
        info!(
            prompt_batches = loaders.prompt.len(),
            eval = loaders.eval.is_some(),
            ptx = loaders.ptx.is_some(),
            "datasets ready"
        );
        collective.barrier();

        let t = &cfgs.train_cfgs;
        let world_size = collective.world_size();
        let total = total_training_steps(
            loaders.prompt.len(),
            t.epochs,
            t.update_iters,
            t.per_device_prompt_batch_size,
            t.per_device_train_batch_size,
        );
        let train_engine = engine.prepare_train(t, world_size);
        let eval_engine = engine.prepare_eval(t);
        let (actor_engine, actor_total) = if loaders.ptx.is_some() {
            (train_engine.doubled_for_ptx(), total * 2)
        } else {
            (train_engine.clone(), total)
        };

        let LoadedModels {
            actor,
            reference,
            reward,
            critic,
        } = loaded;
        let mut actor_model = TrainEngine::new(
            actor.model,
            actor.varmap,
            &actor_engine,
            &actor_settings(t, actor_total),
            Arc::clone(&collective),
        )?;
        if t.actor_gradient_checkpointing {
            actor_model.gradient_checkpointing_enable();
        }
        let mut critic_model = TrainEngine::new(
            critic.model,
            critic.varmap,
            &train_engine,
            &critic_settings(t, total),
            Arc::clone(&collective),
        )?;
        if t.critic_gradient_checkpointing {
            critic_model.gradient_checkpointing_enable();
        }
        let reference_model = EvalEngine::new(reference.model, &reference.varmap, &eval_engine, collective.as_ref())?;
        let reward_model = EvalEngine::new(reward.model, &reward.varmap, &eval_engine, collective.as_ref())?;
        info!(total_training_steps = total, world_size, "engines ready");
        collective.barrier();

        PpoTrainer::new(TrainerParts {
            models: ModelEnsemble {
                actor: actor_model,
                reference: reference_model,
                reward: reward_model,
                critic: critic_model,
            },
            actor_config: actor.config,
            actor_tokenizer: actor.tokenizer,
            reward_tokenizer,
            prompt_loader: loaders.prompt,
            eval_loader: loaders.eval,
            ptx_loader: loaders.ptx,
            collective,
            device: device.clone(),
            cfgs,
        })
    }
}
