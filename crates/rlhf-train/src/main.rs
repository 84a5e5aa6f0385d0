//! CLI entry point for rlhf-train.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use rlhf_core::{apply_overrides, parse_args, read_cfgs, EngineConfig, ModelRegistry, PpoConfig};
use rlhf_train::distributed::{Collective, SingleProcess, ThreadGroup};
use rlhf_train::logging::{init_console_logging, init_logging};
use rlhf_train::tiny::{init_tiny, TinyOptions};
use rlhf_train::trainer::CandlePpoTrainer;

fn resolve_device(device: &str) -> Result<Device> {
    match device {
        "cpu" => Ok(Device::Cpu),
        #[cfg(feature = "cuda")]
        "cuda" => Device::new_cuda(0).context("Failed to initialize CUDA device 0"),
        #[cfg(feature = "cuda")]
        s if s.starts_with("cuda:") => {
            let id: usize = s
                .trim_start_matches("cuda:")
                .parse()
                .with_context(|| format!("Invalid CUDA device id in '{s}'"))?;
            Device::new_cuda(id).with_context(|| format!("Failed to initialize CUDA device {id}"))
        }
        other => bail!("Unknown device: {other}. Use 'cpu', 'cuda', or 'cuda:N'."),
    }
}

#[derive(Parser)]
#[command(name = "rlhf-train", about = "PPO fine-tuning of a language model against a reward model")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run PPO training
    Train {
        /// Directory holding <mode>/<task>.yaml, deepspeed/ and model_info.yaml
        #[arg(long, default_value = "configs")]
        config_root: PathBuf,

        #[arg(long, default_value = "train")]
        mode: String,

        #[arg(long, default_value = "ppo")]
        task: String,

        /// Data-parallel workers, run as threads of this process
        #[arg(long, default_value = "1")]
        world_size: usize,

        #[arg(long, default_value = "cpu")]
        device: String,

        /// JSON log lines instead of pretty console output
        #[arg(long)]
        json_logs: bool,

        /// `--section:key value` config overrides, after `--`
        #[arg(last = true)]
        overrides: Vec<String>,
    },

    /// Write a tiny self-contained workspace (models, data, configs) for smoke runs
    InitTiny {
        #[arg(long)]
        output_dir: PathBuf,

        #[arg(long, default_value = "16")]
        model_max_length: usize,

        #[arg(long, default_value = "8")]
        num_prompts: usize,
    },
}

struct RunConfig {
    cfgs: PpoConfig,
    engine: EngineConfig,
    registry: ModelRegistry,
}

fn load_run_config(config_root: &Path, mode: &str, task: &str, overrides: &[String]) -> Result<RunConfig> {
    let (mut value, _) = read_cfgs(config_root, mode, task)
        .with_context(|| format!("Failed to read {mode}/{task} configs from {}", config_root.display()))?;
    let overrides = parse_args(overrides)?;
    apply_overrides(&mut value, &overrides)?;
    let cfgs = PpoConfig::from_value(value)?;
    cfgs.check()?;

    // ds_cfgs may itself have been overridden.
    let engine_path = config_root.join("deepspeed").join(&cfgs.train_cfgs.ds_cfgs);
    let engine = EngineConfig::from_file(&engine_path)?;
    let registry = ModelRegistry::from_file(&config_root.join("model_info.yaml"))?;
    Ok(RunConfig {
        cfgs,
        engine,
        registry,
    })
}

fn run_worker(collective: Arc<dyn Collective>, run: &RunConfig, device: &Device) -> Result<()> {
    let mut trainer =
        CandlePpoTrainer::from_config(run.cfgs.clone(), &run.engine, &run.registry, collective, device)?;
    trainer.train()?;
    trainer.logger().print("Saving model to output directory ...");
    trainer.save(None)?;
    trainer.logger().print("Model saved!");
    Ok(())
}

fn train(run: &RunConfig, world_size: usize, device: &Device) -> Result<()> {
    if world_size <= 1 {
        return run_worker(Arc::new(SingleProcess), run, device);
    }

    let group = ThreadGroup::new(world_size);
    std::thread::scope(|scope| {
        let workers: Vec<_> = group
            .handles()
            .into_iter()
            .map(|handle| {
                scope.spawn(move || {
                    let rank = handle.rank();
                    let collective: Arc<dyn Collective> = Arc::new(handle);
                    let result = run_worker(collective, run, device);
                    if let Err(e) = &result {
                        // Peers would wait at the next barrier forever.
                        tracing::error!(rank, error = %format!("{e:#}"), "worker failed, aborting");
                        std::process::exit(1);
                    }
                    result
                })
            })
            .collect();
        for worker in workers {
            worker.join().map_err(|_| anyhow!("worker thread panicked"))??;
        }
        Ok(())
    })
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Train {
            config_root,
            mode,
            task,
            world_size,
            device,
            json_logs,
            overrides,
        } => {
            if json_logs {
                init_logging();
            } else {
                init_console_logging();
            }
            let device = resolve_device(&device)?;
            let run = load_run_config(&config_root, &mode, &task, &overrides)?;
            tracing::info!(
                config_root = %config_root.display(),
                world_size,
                device = ?device,
                use_ptx = run.cfgs.use_ptx(),
                "starting PPO training"
            );
            train(&run, world_size, &device)
        }
        Commands::InitTiny {
            output_dir,
            model_max_length,
            num_prompts,
        } => {
            init_console_logging();
            let opts = TinyOptions {
                model_max_length,
                num_prompts,
                ..Default::default()
            };
            let config_root = init_tiny(&output_dir, &opts)?;
            println!("Tiny workspace written. Train with:");
            println!("  rlhf-train train --config-root {}", config_root.display());
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
