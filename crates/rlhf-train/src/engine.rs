//! Training and inference engines wrapping the candle models.
//!
//! A [`TrainEngine`] owns a model, its variables and an AdamW optimizer.
//! `backward` accumulates scaled gradients; `step` closes the accumulation
//! window: gradients are averaged across workers, clipped by global norm,
//! applied, and the learning rate moves to the next scheduled value.

use std::path::Path;
use std::sync::Arc;

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use rlhf_core::{EngineConfig, LrSchedulerType, Precision, Result, RlhfError};
use rlhf_model::pretrained::save_weights;
use rlhf_model::{CausalLm, ScoreLm, ScoreOutput};
use tracing::debug;

use crate::distributed::{Collective, ReduceOp};
use crate::ensemble::{LanguageModel, ScoreModel, TrainableModel};
use crate::optim::{global_grad_norm, AdamW, LrSchedule};

/// Optimizer and schedule settings for one trained model.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub lr: f64,
    pub lr_scheduler_type: LrSchedulerType,
    pub lr_warmup_ratio: f64,
    pub weight_decay: f64,
    pub adam_betas: (f64, f64),
    pub adam_epsilon: f64,
    /// Micro-steps (backward calls) over the whole run.
    pub total_training_steps: usize,
}

/// Variables sorted by name, so every worker sees the same order.
fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| RlhfError::Candle("variable map lock poisoned".to_string()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Make every worker start from rank 0's weights. Heads that were missing from
/// the checkpoint are randomly initialized independently on each worker.
fn broadcast_vars(vars: &[(String, Var)], collective: &dyn Collective) -> Result<()> {
    if collective.world_size() <= 1 {
        return Ok(());
    }
    for (_, var) in vars {
        let synced = collective.broadcast(var.as_tensor())?;
        // Rank 0 is the source and gets its own storage back.
        if !collective.is_main() {
            var.set(&synced)?;
        }
    }
    Ok(())
}

pub struct TrainEngine<M> {
    model: M,
    varmap: VarMap,
    optimizer: AdamW,
    schedule: LrSchedule,
    grads: Vec<Option<Tensor>>,
    pending_micro_steps: usize,
    accumulation: usize,
    gradient_clipping: f64,
    precision: Precision,
    training: bool,
    gradient_checkpointing: bool,
    collective: Arc<dyn Collective>,
}

impl<M> TrainEngine<M> {
    pub fn new(
        model: M,
        varmap: VarMap,
        engine: &EngineConfig,
        settings: &EngineSettings,
        collective: Arc<dyn Collective>,
    ) -> Result<Self> {
        let vars = named_vars(&varmap)?;
        broadcast_vars(&vars, collective.as_ref())?;

        let accumulation = engine.gradient_accumulation_steps.max(1);
        let update_steps = settings.total_training_steps / accumulation;
        let schedule = LrSchedule::new(
            settings.lr_scheduler_type,
            settings.lr,
            update_steps,
            settings.lr_warmup_ratio,
        );
        let n_params = vars.len();
        let optimizer = AdamW::new(
            vars,
            schedule.lr_at(0),
            settings.adam_betas,
            settings.adam_epsilon,
            settings.weight_decay,
        )?;
        debug!(
            params = n_params,
            accumulation,
            update_steps,
            warmup_steps = schedule.warmup_steps,
            "train engine ready"
        );

        Ok(Self {
            model,
            varmap,
            optimizer,
            schedule,
            grads: vec![None; n_params],
            pending_micro_steps: 0,
            accumulation,
            gradient_clipping: engine.gradient_clipping,
            precision: engine.precision(),
            training: true,
            gradient_checkpointing: false,
            collective,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Optimizer updates applied so far.
    pub fn update_steps(&self) -> usize {
        self.optimizer.steps_taken()
    }

    pub fn accumulation_steps(&self) -> usize {
        self.accumulation
    }

    fn reduce_grads(&mut self) -> Result<()> {
        if self.collective.world_size() <= 1 {
            return Ok(());
        }
        // Every worker must contribute a tensor for every parameter, even one
        // that received no gradient locally.
        for (slot, param) in self.grads.iter_mut().zip(self.optimizer.params()) {
            let local = match slot.take() {
                Some(g) => g,
                None => Tensor::zeros_like(param.var.as_tensor())?,
            };
            *slot = Some(self.collective.all_reduce(&local, ReduceOp::Mean)?);
        }
        Ok(())
    }

    fn clip_grads(&mut self) -> Result<f64> {
        let norm = global_grad_norm(&self.grads)?;
        if self.gradient_clipping > 0.0 && norm > self.gradient_clipping {
            let scale = self.gradient_clipping / (norm + 1e-6);
            for g in self.grads.iter_mut().flatten() {
                *g = (&*g * scale)?;
            }
        }
        Ok(norm)
    }
}

impl<M> TrainableModel for TrainEngine<M> {
    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        let store = loss.backward()?;
        let scale = self.accumulation as f64;
        for (slot, param) in self.grads.iter_mut().zip(self.optimizer.params()) {
            let Some(g) = store.get(param.var.as_tensor()) else {
                continue;
            };
            let g = (g / scale)?;
            *slot = Some(match slot.take() {
                Some(acc) => (acc + g)?,
                None => g,
            });
        }
        self.pending_micro_steps += 1;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        if self.pending_micro_steps < self.accumulation {
            return Ok(());
        }
        self.reduce_grads()?;
        let grad_norm = self.clip_grads()?;
        self.optimizer.step(&self.grads)?;
        let update_step = self.optimizer.steps_taken();
        self.optimizer.set_lr(self.schedule.lr_at(update_step));
        debug!(update_step, grad_norm, lr = self.optimizer.lr, "optimizer step");

        self.grads.iter_mut().for_each(|g| *g = None);
        self.pending_micro_steps = 0;
        Ok(())
    }

    fn set_train(&mut self, train: bool) {
        self.training = train;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    // Activations are always kept; the flag is tracked so callers can toggle it
    // around generation exactly as with engines that recompute them.
    fn gradient_checkpointing_enable(&mut self) {
        self.gradient_checkpointing = true;
    }

    fn gradient_checkpointing_disable(&mut self) {
        self.gradient_checkpointing = false;
    }

    fn is_gradient_checkpointing(&self) -> bool {
        self.gradient_checkpointing
    }

    fn lr(&self) -> f64 {
        self.optimizer.lr
    }

    fn save_16bit(&self, path: &Path) -> Result<()> {
        save_weights(&self.varmap, path, self.precision.dtype())
    }
}

impl LanguageModel for TrainEngine<CausalLm> {
    fn logits(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        Ok(self.model.forward(input_ids, attention_mask, self.training)?)
    }
}

impl ScoreModel for TrainEngine<ScoreLm> {
    fn score(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<ScoreOutput> {
        Ok(self.model.forward(input_ids, attention_mask, self.training)?)
    }
}

/// Forward-only engine for the frozen models. Outputs are detached.
pub struct EvalEngine<M> {
    model: M,
    precision: Precision,
}

impl<M> EvalEngine<M> {
    pub fn new(model: M, varmap: &VarMap, engine: &EngineConfig, collective: &dyn Collective) -> Result<Self> {
        broadcast_vars(&named_vars(varmap)?, collective)?;
        Ok(Self {
            model,
            precision: engine.precision(),
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }
}

impl LanguageModel for EvalEngine<CausalLm> {
    fn logits(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        Ok(self.model.forward(input_ids, attention_mask, false)?.detach())
    }
}

impl ScoreModel for EvalEngine<ScoreLm> {
    fn score(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<ScoreOutput> {
        let out = self.model.forward(input_ids, attention_mask, false)?;
        Ok(ScoreOutput {
            scores: out.scores.detach(),
            end_scores: out.end_scores.detach(),
            clipped_scores: out.clipped_scores.detach(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{SingleProcess, ThreadGroup};
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;
    use rlhf_model::ModelConfig;

    fn settings(total: usize) -> EngineSettings {
        EngineSettings {
            lr: 1e-2,
            lr_scheduler_type: LrSchedulerType::Constant,
            lr_warmup_ratio: 0.0,
            weight_decay: 0.0,
            adam_betas: (0.9, 0.95),
            adam_epsilon: 1e-8,
            total_training_steps: total,
        }
    }

    fn engine_config(accum: usize) -> EngineConfig {
        EngineConfig {
            gradient_accumulation_steps: accum,
            ..EngineConfig::default()
        }
    }

    fn tiny_lm() -> candle_core::Result<(CausalLm, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let lm = CausalLm::new(&ModelConfig::tiny(12), vb)?;
        Ok((lm, varmap))
    }

    fn snapshot(engine: &TrainEngine<CausalLm>) -> candle_core::Result<Vec<f32>> {
        let data = engine.varmap().data().lock().unwrap();
        data["final_norm.weight"].as_tensor().to_vec1::<f32>()
    }

    fn lm_loss(engine: &TrainEngine<CausalLm>) -> candle_core::Result<Tensor> {
        let ids = Tensor::new(&[[2u32, 5, 6, 7]], &Device::Cpu)?;
        let mask = Tensor::ones((1, 4), DType::U8, &Device::Cpu)?;
        let logits = engine.logits(&ids, &mask).map_err(candle_core::Error::wrap)?;
        logits.sqr()?.mean_all()
    }

    #[test]
    fn test_step_waits_for_accumulation_window() -> candle_core::Result<()> {
        let (lm, varmap) = tiny_lm()?;
        let mut engine = TrainEngine::new(lm, varmap, &engine_config(2), &settings(4), Arc::new(SingleProcess))
            .map_err(candle_core::Error::wrap)?;
        let before = snapshot(&engine)?;

        let loss = lm_loss(&engine)?;
        engine.backward(&loss).map_err(candle_core::Error::wrap)?;
        engine.step().map_err(candle_core::Error::wrap)?;
        assert_eq!(engine.update_steps(), 0);
        assert_eq!(snapshot(&engine)?, before);

        let loss = lm_loss(&engine)?;
        engine.backward(&loss).map_err(candle_core::Error::wrap)?;
        engine.step().map_err(candle_core::Error::wrap)?;
        assert_eq!(engine.update_steps(), 1);
        assert_ne!(snapshot(&engine)?, before);
        Ok(())
    }

    #[test]
    fn test_mode_and_checkpointing_flags() -> candle_core::Result<()> {
        let (lm, varmap) = tiny_lm()?;
        let mut engine = TrainEngine::new(lm, varmap, &engine_config(1), &settings(1), Arc::new(SingleProcess))
            .map_err(candle_core::Error::wrap)?;
        assert!(engine.is_training());
        engine.set_train(false);
        assert!(!engine.is_training());
        engine.gradient_checkpointing_enable();
        assert!(engine.is_gradient_checkpointing());
        engine.gradient_checkpointing_disable();
        assert!(!engine.is_gradient_checkpointing());
        assert!((engine.lr() - 1e-2).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_save_16bit_casts_to_precision() -> candle_core::Result<()> {
        let dir = tempfile::tempdir()?;
        let (lm, varmap) = tiny_lm()?;
        let mut cfg = engine_config(1);
        cfg.bf16.enabled = true;
        let engine = TrainEngine::new(lm, varmap, &cfg, &settings(1), Arc::new(SingleProcess))
            .map_err(candle_core::Error::wrap)?;
        let path = dir.path().join("pytorch_model.bin");
        engine.save_16bit(&path).map_err(candle_core::Error::wrap)?;
        let tensors = candle_core::safetensors::load(&path, &Device::Cpu)?;
        assert!(tensors.values().all(|t| t.dtype() == DType::BF16));
        Ok(())
    }

    #[test]
    fn test_eval_engine_outputs_are_detached() -> candle_core::Result<()> {
        let (lm, varmap) = tiny_lm()?;
        let engine = EvalEngine::new(lm, &varmap, &EngineConfig::default(), &SingleProcess)
            .map_err(candle_core::Error::wrap)?;
        let ids = Tensor::new(&[[2u32, 5, 6]], &Device::Cpu)?;
        let mask = Tensor::ones((1, 3), DType::U8, &Device::Cpu)?;
        let logits = engine.logits(&ids, &mask).map_err(candle_core::Error::wrap)?;
        let grads = logits.sum_all()?.backward()?;
        let var = &varmap.all_vars()[0];
        assert!(grads.get(var.as_tensor()).is_none());
        Ok(())
    }

    #[test]
    fn test_broadcast_vars_copies_rank_zero_weights() {
        let group = ThreadGroup::new(2);
        let weights: Vec<Vec<f32>> = std::thread::scope(|scope| {
            let workers: Vec<_> = group
                .handles()
                .into_iter()
                .map(|handle| {
                    scope.spawn(move || -> Result<Vec<f32>> {
                        let value = handle.rank() as f32 + 1.0;
                        let var = Var::new(&[value, value * 2.0], &Device::Cpu)?;
                        broadcast_vars(&[("w".to_string(), var.clone())], &handle)?;
                        Ok(var.as_tensor().to_vec1::<f32>()?)
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap().unwrap()).collect()
        });
        assert_eq!(weights, vec![vec![1.0, 2.0], vec![1.0, 2.0]]);
    }
}
