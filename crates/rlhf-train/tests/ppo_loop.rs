//! Integration tests for the PPO loop: scheduling, mode switching and
//! checkpointing over stub models, plus end-to-end runs on tiny candle models.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rlhf_core::{read_cfgs, ModelRegistry, PpoConfig, Result};
use rlhf_model::{load_pretrained, LoadOptions, ModelConfig, PaddingSide, ScoreOutput, StopSync, TextTokenizer};
use rlhf_train::batch::{InferenceBatch, PromptBatch, SupervisedBatch, TrainingBatch};
use rlhf_train::data::{DataLoader, DistributedSampler, PromptOnlyDataset, SupervisedDataset, SupervisedSample};
use rlhf_train::loss::language_modeling_loss;
use rlhf_train::tiny::{init_tiny, tiny_ppo_config, TinyOptions, WORDS};
use rlhf_train::trainer::CandlePpoTrainer;
use rlhf_train::{
    Collective, LanguageModel, ModelEnsemble, PpoTrainer, ScoreModel, SingleProcess, ThreadGroup, TrainableModel,
    TrainerParts,
};

const FAVORED: u32 = 5;

/// Language model whose logits strongly prefer one token.
struct StubLm {
    vocab_size: usize,
    training: bool,
    gradient_checkpointing: bool,
    backward_calls: usize,
    step_calls: usize,
    /// (training, gradient checkpointing) observed at each generate call.
    generate_states: RefCell<Vec<(bool, bool)>>,
    /// Gradient checkpointing observed at each forward pass.
    forward_checkpointing: RefCell<Vec<bool>>,
    forward_calls: Cell<usize>,
}

impl StubLm {
    fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            training: true,
            gradient_checkpointing: true,
            backward_calls: 0,
            step_calls: 0,
            generate_states: RefCell::new(Vec::new()),
            forward_checkpointing: RefCell::new(Vec::new()),
            forward_calls: Cell::new(0),
        }
    }
}

impl LanguageModel for StubLm {
    fn logits(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
        self.forward_calls.set(self.forward_calls.get() + 1);
        self.forward_checkpointing.borrow_mut().push(self.gradient_checkpointing);
        let (b, t) = input_ids.dims2()?;
        let mut row = vec![0f32; self.vocab_size];
        row[FAVORED as usize] = 20.0;
        Ok(Tensor::from_vec(row.repeat(b * t), (b, t, self.vocab_size), input_ids.device())?)
    }

    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        cfg: &rlhf_model::GenerationConfig,
        rng: &mut StdRng,
        sync: &dyn StopSync,
    ) -> Result<Tensor> {
        self.generate_states
            .borrow_mut()
            .push((self.training, self.gradient_checkpointing));
        let sequences = rlhf_model::generate(
            |ids, mask| self.logits(ids, mask).map_err(candle_core::Error::wrap),
            input_ids,
            attention_mask,
            cfg,
            rng,
            sync,
        )?;
        Ok(sequences)
    }
}

impl TrainableModel for StubLm {
    fn backward(&mut self, _loss: &Tensor) -> Result<()> {
        self.backward_calls += 1;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.step_calls += 1;
        Ok(())
    }

    fn set_train(&mut self, train: bool) {
        self.training = train;
    }

    fn is_training(&self) -> bool {
        self.training
    }

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
        1.0e-5
    }

    fn save_16bit(&self, path: &Path) -> Result<()> {
        std::fs::write(path, b"stub")?;
        Ok(())
    }
}

/// Score model giving every token the same score.
struct StubScore {
    score: f32,
    training: bool,
    backward_calls: usize,
    /// Rows of every batch scored, padding included.
    seen_ids: RefCell<Vec<Vec<u32>>>,
}

impl StubScore {
    fn new(score: f32) -> Self {
        Self {
            score,
            training: true,
            backward_calls: 0,
            seen_ids: RefCell::new(Vec::new()),
        }
    }
}

impl ScoreModel for StubScore {
    fn score(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<ScoreOutput> {
        self.seen_ids.borrow_mut().extend(input_ids.to_vec2::<u32>()?);
        let (b, t) = input_ids.dims2()?;
        let scores = Tensor::full(self.score, (b, t), input_ids.device())?;
        let clipped_scores = (&scores * attention_mask.to_dtype(DType::F32)?)?;
        Ok(ScoreOutput {
            end_scores: Tensor::full(self.score, b, input_ids.device())?,
            scores,
            clipped_scores,
        })
    }
}

impl TrainableModel for StubScore {
    fn backward(&mut self, _loss: &Tensor) -> Result<()> {
        self.backward_calls += 1;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_train(&mut self, train: bool) {
        self.training = train;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn gradient_checkpointing_enable(&mut self) {}

    fn gradient_checkpointing_disable(&mut self) {}

    fn is_gradient_checkpointing(&self) -> bool {
        false
    }

    fn lr(&self) -> f64 {
        5.0e-6
    }

    fn save_16bit(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

type StubTrainer = PpoTrainer<StubLm, StubLm, StubScore, StubScore>;

fn tokenizer() -> TextTokenizer {
    TextTokenizer::word_level(WORDS, 16)
        .unwrap()
        .with_padding_side(PaddingSide::Left)
}

fn prompts(n: usize) -> Vec<Vec<u32>> {
    (0..n).map(|i| (4..4 + 2 + (i as u32 % 3)).collect()).collect()
}

fn stub_config(root: &Path, epochs: usize, update_iters: usize) -> PpoConfig {
    let opts = TinyOptions {
        with_eval: false,
        with_ptx: false,
        ..Default::default()
    };
    let mut cfgs = tiny_ppo_config(root, &opts).unwrap();
    cfgs.train_cfgs.epochs = epochs;
    cfgs.train_cfgs.update_iters = update_iters;
    cfgs.train_cfgs.per_device_prompt_batch_size = 4;
    cfgs.train_cfgs.per_device_train_batch_size = 2;
    cfgs.train_cfgs.actor_gradient_checkpointing = true;
    cfgs.logger_cfgs.save_interval = 5;
    cfgs
}

fn stub_trainer(cfgs: PpoConfig, ptx: Option<Vec<SupervisedSample>>, with_eval: bool) -> StubTrainer {
    build_stub_trainer(cfgs, ptx, with_eval, None)
}

fn build_stub_trainer(
    cfgs: PpoConfig,
    ptx: Option<Vec<SupervisedSample>>,
    with_eval: bool,
    reward_tokenizer: Option<TextTokenizer>,
) -> StubTrainer {
    let tok = tokenizer();
    let vocab = tok.vocab_size();
    let device = Device::Cpu;
    let bs = cfgs.train_cfgs.per_device_prompt_batch_size;
    let prompt_loader = DataLoader::new(
        PromptOnlyDataset::from_token_ids(prompts(8), 0),
        bs,
        DistributedSampler::new(8, 0, 1, true, 7),
        &device,
    );
    let eval_loader = with_eval.then(|| {
        DataLoader::new(
            PromptOnlyDataset::from_token_ids(prompts(3), 0),
            cfgs.train_cfgs.per_device_eval_batch_size,
            DistributedSampler::new(3, 0, 1, false, 7),
            &device,
        )
    });
    let ptx_loader = ptx.map(|samples| {
        let n = samples.len();
        DataLoader::new(
            SupervisedDataset::from_samples(samples, 0),
            bs,
            DistributedSampler::new(n, 0, 1, true, 7),
            &device,
        )
    });
    let mut config = ModelConfig::tiny(vocab);
    config.pad_token_id = Some(0);
    config.eos_token_id = Some(3);

    PpoTrainer::new(TrainerParts {
        cfgs,
        models: ModelEnsemble {
            actor: StubLm::new(vocab),
            reference: StubLm::new(vocab),
            reward: StubScore::new(1.0),
            critic: StubScore::new(0.5),
        },
        actor_config: config,
        actor_tokenizer: tok,
        reward_tokenizer,
        prompt_loader,
        eval_loader,
        ptx_loader,
        collective: Arc::new(SingleProcess),
        device,
    })
    .unwrap()
}

fn metrics_lines(trainer: &StubTrainer) -> Vec<serde_json::Value> {
    let text = std::fs::read_to_string(trainer.logger().run_dir().join("metrics.jsonl")).unwrap();
    text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
}

#[test]
fn test_rollout_produces_aligned_micro_batches() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = stub_trainer(stub_config(dir.path(), 1, 1), None, false);

    let ids = Tensor::new(&[[0u32, 4, 5], [4, 5, 6], [0, 0, 7]], &Device::Cpu).unwrap();
    let mask = ids.ne(0u32).unwrap().to_dtype(DType::U8).unwrap();
    let prompt = PromptBatch {
        input_ids: ids,
        attention_mask: mask,
    };
    let (inference, training) = trainer.rollout(&prompt).unwrap();

    assert_eq!(inference.len(), 2);
    assert_eq!(training.len(), 2);
    for (inf, tr) in inference.iter().zip(&training) {
        let (b, l) = inf.input_ids.dims2().unwrap();
        assert_eq!(tr.prompt_idx, 2);
        assert!(l > 3);
        assert_eq!(tr.log_probs.dims(), &[b, l - 1]);
        assert_eq!(tr.ref_log_probs.dims(), &[b, l - 1]);
        assert_eq!(tr.reward_values.dims(), &[b, l - 1]);
        assert_eq!(tr.reward.dims(), &[b]);
        assert_eq!(tr.reward.to_vec1::<f32>().unwrap(), vec![1.0; b]);
    }
    assert_eq!(inference[1].input_ids.dim(0).unwrap(), 1);

    let actor = &trainer.models().actor;
    assert_eq!(*actor.generate_states.borrow(), vec![(false, false); 2]);
    // Generation steps and the log-prob scoring pass all ran without checkpointing.
    assert!(actor.forward_calls.get() > 2);
    assert!(actor.forward_checkpointing.borrow().iter().all(|&on| !on));
    assert!(actor.training);
    assert!(actor.gradient_checkpointing);
    assert!(trainer.models().critic.training);
}

#[test]
fn test_rollout_retokenizes_for_a_different_reward_vocabulary() {
    let dir = tempfile::tempdir().unwrap();
    let reversed: Vec<&str> = WORDS.iter().rev().copied().collect();
    let reward_tokenizer = TextTokenizer::word_level(&reversed, 16).unwrap();
    assert!(!reward_tokenizer.is_same_as(&tokenizer()));
    let mut trainer = build_stub_trainer(stub_config(dir.path(), 1, 1), None, false, Some(reward_tokenizer));

    let ids = Tensor::new(&[[0u32, 4, 5], [4, 5, 6]], &Device::Cpu).unwrap();
    let mask = ids.ne(0u32).unwrap().to_dtype(DType::U8).unwrap();
    let prompt = PromptBatch {
        input_ids: ids,
        attention_mask: mask,
    };
    let (inference, training) = trainer.rollout(&prompt).unwrap();
    assert_eq!(training[0].reward.to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);

    let actor_rows = inference[0].input_ids.to_vec2::<u32>().unwrap();
    assert!(actor_rows.iter().all(|row| row.contains(&FAVORED)));

    // Actor id k maps to 41 - k in the reversed vocabulary; specials keep 0..4.
    let reward_rows = trainer.models().reward.seen_ids.borrow().clone();
    assert_eq!(reward_rows.len(), 2);
    for row in &reward_rows {
        let valid: Vec<u32> = row.iter().copied().filter(|&id| id != 0).collect();
        assert_eq!(valid.last(), Some(&3));
        assert!(valid.contains(&(41 - FAVORED)));
        assert!(!valid.contains(&FAVORED));
    }
    // The critic shares the actor's vocabulary and sees its ids unchanged.
    assert_eq!(*trainer.models().critic.seen_ids.borrow(), actor_rows);
}

fn scored_batch(
    input_ids: Tensor,
    attention_mask: Tensor,
    prompt_idx: usize,
    log_probs: Tensor,
) -> (InferenceBatch, TrainingBatch) {
    let (b, l) = input_ids.dims2().unwrap();
    let zeros = Tensor::zeros((b, l - 1), DType::F32, &Device::Cpu).unwrap();
    let training = TrainingBatch {
        prompt_idx,
        log_probs,
        ref_log_probs: zeros.clone(),
        reward: Tensor::zeros(b, DType::F32, &Device::Cpu).unwrap(),
        reward_values: zeros,
    };
    (
        InferenceBatch {
            input_ids,
            attention_mask,
        },
        training,
    )
}

#[test]
fn test_kl_penalty_metrics_ignore_prompt_positions() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfgs = stub_config(dir.path(), 1, 1);
    cfgs.train_cfgs.kl_coeff = 1.0;
    let mut trainer = stub_trainer(cfgs, None, false);

    let ids = Tensor::new(&[[4u32, 5, 6, 7]], &Device::Cpu).unwrap();
    let mask = Tensor::ones((1, 4), DType::U8, &Device::Cpu).unwrap();
    // The actor only diverges from the reference on the prompt's target.
    let log_probs = Tensor::new(&[[-1.0f32, 0.0, 0.0]], &Device::Cpu).unwrap();
    let (inference, training) = scored_batch(ids, mask, 1, log_probs);

    let metrics = trainer.rl_step(&inference, &training).unwrap();
    assert_eq!(metrics.kl_divergence, 0.0);
    assert_eq!(metrics.reward_with_kl_penalty, 0.0);
}

#[test]
fn test_rl_step_stays_finite_when_a_row_has_no_response_token() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = stub_trainer(stub_config(dir.path(), 1, 1), None, false);

    // Row 0 sampled EOS right after the prompt, so nothing past it is valid.
    let ids = Tensor::new(&[[4u32, 5, 0, 0], [4, 5, 6, 7]], &Device::Cpu).unwrap();
    let mask = Tensor::new(&[[1u8, 1, 0, 0], [1, 1, 1, 1]], &Device::Cpu).unwrap();
    let log_probs = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
    let (inference, training) = scored_batch(ids, mask, 1, log_probs);

    let metrics = trainer.rl_step(&inference, &training).unwrap();
    assert!(metrics.actor_loss.is_finite());
    assert!(metrics.reward_critic_loss.is_finite());
    assert!(metrics.reward_advantage.is_finite());
    assert!(metrics.reward_value.is_finite());
    assert_eq!(trainer.models().actor.backward_calls, 1);
    assert_eq!(trainer.models().critic.backward_calls, 1);
}

#[test]
fn test_ptx_step_reports_the_unscaled_language_modeling_loss() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfgs = stub_config(dir.path(), 1, 1);
    cfgs.train_cfgs.ptx_coeff = 16.0;
    let mut trainer = stub_trainer(cfgs, None, false);

    let input_ids = Tensor::new(&[[4u32, 5, 6, 7, 3]], &Device::Cpu).unwrap();
    let batch = SupervisedBatch {
        attention_mask: Tensor::ones((1, 5), DType::U8, &Device::Cpu).unwrap(),
        loss_mask: Tensor::new(&[[0u8, 0, 1, 1, 1]], &Device::Cpu).unwrap(),
        input_ids,
    };
    let logits = trainer
        .models()
        .actor
        .logits(&batch.input_ids, &batch.attention_mask)
        .unwrap();
    let expected = language_modeling_loss(&logits, &batch.input_ids, &batch.loss_mask)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap() as f64;
    assert!(expected > 1.0);

    let reported = trainer.ptx_step(&batch).unwrap();
    assert!((reported - expected).abs() < 1e-4);
    assert_eq!(trainer.models().actor.backward_calls, 1);
}

#[test]
fn test_train_step_count_checkpoints_and_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let cfgs = stub_config(dir.path(), 2, 2);
    let output_dir = cfgs.logger_cfgs.output_dir.clone();
    let mut trainer = stub_trainer(cfgs, None, false);
    assert_eq!(trainer.total_training_steps(), 16);

    trainer.train().unwrap();

    assert_eq!(trainer.global_step(), 16);
    let models = trainer.models();
    assert_eq!(models.actor.backward_calls, 16);
    assert_eq!(models.actor.step_calls, 16);
    assert_eq!(models.critic.backward_calls, 16);
    // 2 prompt batches x 2 micro-batches x 2 epochs
    assert_eq!(models.actor.generate_states.borrow().len(), 8);
    assert_eq!(models.reference.backward_calls, 0);

    for step in [5, 10, 15] {
        assert!(output_dir.join(format!("pytorch_model_{step}.bin")).exists());
    }
    assert!(!output_dir.join("pytorch_model_16.bin").exists());
    assert!(output_dir.join("config.json").exists());

    let lines = metrics_lines(&trainer);
    assert_eq!(lines.len(), 16);
    assert_eq!(lines[0]["step"], 0);
    assert_eq!(lines[15]["step"], 15);
    assert_eq!(lines[3]["train/reward"], 1.0);
    assert!(lines[3]["train/max_generated_length"].as_f64().unwrap() >= 1.0);
    assert_eq!(lines[3]["train/actor_lr"], 1.0e-5);
}

#[test]
fn test_ptx_doubles_actor_updates() {
    let dir = tempfile::tempdir().unwrap();
    let samples: Vec<SupervisedSample> = (0..4)
        .map(|_| SupervisedSample {
            input_ids: vec![4, 5, 6, 7, 3],
            loss_mask: vec![0, 0, 1, 1, 1],
        })
        .collect();
    let mut trainer = stub_trainer(stub_config(dir.path(), 1, 1), Some(samples), false);
    assert!(trainer.use_ptx());

    trainer.train().unwrap();

    assert_eq!(trainer.global_step(), 4);
    assert_eq!(trainer.models().actor.backward_calls, 8);
    assert_eq!(trainer.models().critic.backward_calls, 4);
    let lines = metrics_lines(&trainer);
    assert_eq!(lines.len(), 8);
    assert!(lines.iter().any(|l| l.get("train/ptx_loss").is_some()));
}

#[test]
fn test_eval_restores_train_mode() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = stub_trainer(stub_config(dir.path(), 1, 1), None, true);

    trainer.eval().unwrap();

    let actor = &trainer.models().actor;
    assert_eq!(actor.generate_states.borrow().len(), 1);
    assert!(!actor.generate_states.borrow()[0].0);
    assert!(actor.training);
    assert!(trainer.models().critic.training);
}

fn tiny_workspace(root: &Path) -> (PpoConfig, rlhf_core::EngineConfig, ModelRegistry) {
    let config_root = init_tiny(root, &TinyOptions::default()).unwrap();
    let (value, engine) = read_cfgs(&config_root, "train", "ppo").unwrap();
    let cfgs = PpoConfig::from_value(value).unwrap();
    let registry = ModelRegistry::from_file(&config_root.join("model_info.yaml")).unwrap();
    (cfgs, engine, registry)
}

#[test]
fn test_tiny_end_to_end_run_saves_loadable_actor() {
    let dir = tempfile::tempdir().unwrap();
    let (cfgs, engine, registry) = tiny_workspace(dir.path());
    let output_dir = cfgs.logger_cfgs.output_dir.clone();

    let mut trainer =
        CandlePpoTrainer::from_config(cfgs, &engine, &registry, Arc::new(SingleProcess), &Device::Cpu).unwrap();
    assert!(trainer.use_ptx());
    trainer.train().unwrap();
    // 8 prompts / 4 per batch, 2 micro-batches each
    assert_eq!(trainer.global_step(), 4);
    // RL and PTX gradients share one doubled accumulation window.
    assert_eq!(trainer.models().actor.accumulation_steps(), 2);
    assert_eq!(trainer.models().actor.update_steps(), 4);
    assert_eq!(trainer.models().critic.update_steps(), 4);

    let weights = trainer.save(None).unwrap();
    assert_eq!(weights, output_dir.join("pytorch_model.bin"));

    let reloaded = load_pretrained(
        &output_dir,
        &LoadOptions {
            model_max_length: 16,
            padding_side: PaddingSide::Left,
            device: Device::Cpu,
        },
    )
    .unwrap();
    assert_eq!(reloaded.config.vocab_size, WORDS.len() + 4);
}

#[test]
fn test_two_workers_stay_in_sync() {
    let dir = tempfile::tempdir().unwrap();
    let (cfgs, engine, registry) = tiny_workspace(dir.path());
    let group = ThreadGroup::new(2);

    // Detached workers report through a channel, so a failing rank fails the
    // test instead of leaving its peer blocked at a barrier.
    let (tx, rx) = crossbeam_channel::unbounded();
    for handle in group.handles() {
        let (cfgs, engine, registry, tx) = (cfgs.clone(), engine.clone(), registry.clone(), tx.clone());
        std::thread::spawn(move || {
            let rank = handle.rank();
            let run = || -> anyhow::Result<Vec<f32>> {
                let collective: Arc<dyn Collective> = Arc::new(handle);
                let mut trainer = CandlePpoTrainer::from_config(cfgs, &engine, &registry, collective, &Device::Cpu)?;
                trainer.train()?;
                let data = trainer.models().actor.varmap().data().lock().unwrap();
                let mut names: Vec<&String> = data.keys().collect();
                names.sort();
                let mut flat = Vec::new();
                for name in names {
                    flat.extend(data[name].as_tensor().flatten_all()?.to_vec1::<f32>()?);
                }
                Ok(flat)
            };
            let _ = tx.send((rank, run()));
        });
    }
    drop(tx);

    let mut weights = vec![Vec::new(); 2];
    for _ in 0..2 {
        let (rank, result) = rx
            .recv_timeout(Duration::from_secs(300))
            .expect("a worker did not finish");
        weights[rank] = result.unwrap_or_else(|e| panic!("worker {rank} failed: {e}"));
    }

    assert!(!weights[0].is_empty());
    assert_eq!(weights[0], weights[1]);
}
