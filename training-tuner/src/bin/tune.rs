//! Tuning binary.
//!
//! Usage:
//!   tune <COMMAND> [OPTIONS]
//!
//! Examples:
//!   # Largest batch size that fits in 64 MiB of device memory
//!   tune scale-batch-size --device-memory 67108864
//!
//!   # Learning rate range test, results saved as JSON
//!   tune lr-find --num-training 200 --output lr_find.json
//!
//!   # Trainer settings from a TOML file
//!   tune --config trainer.toml scale-batch-size --mode binsearch

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use training_tuner::{
    Accelerator, BoringModel, Devices, LrFindConfig, LrFindMode, ScaleBatchSizeConfig, ScaleMode,
    StrategyKind, Trainer, TrainerConfig, Tuner, TunerMethod,
};

#[derive(Parser)]
#[command(name = "tune")]
#[command(about = "Find the batch size and learning rate before training")]
#[command(version)]
struct Args {
    /// Trainer configuration (TOML); flags below override it
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Accelerator (cpu, cuda, mps, auto)
    #[arg(long)]
    accelerator: Option<Accelerator>,

    /// Devices (auto, -1, a count, or a list like 0,1)
    #[arg(long, allow_hyphen_values = true)]
    devices: Option<Devices>,

    /// Strategy (auto, single_device, ddp, ddp_spawn, fsdp, deepspeed)
    #[arg(long)]
    strategy: Option<StrategyKind>,

    /// Root directory for logs and temporary checkpoints
    #[arg(short = 'o', long)]
    root_dir: Option<PathBuf>,

    /// Maximum epochs per run
    #[arg(long)]
    max_epochs: Option<usize>,

    /// Device memory budget in bytes
    #[arg(long)]
    device_memory: Option<u64>,

    /// Samples in the demo model's datasets
    #[arg(long, default_value = "64")]
    dataset_len: usize,

    /// Initial learning rate of the demo model
    #[arg(long, default_value = "0.1")]
    lr: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search the largest batch size that fits
    ScaleBatchSize {
        /// Search mode (power, binsearch)
        #[arg(long, default_value = "power")]
        mode: ScaleMode,

        /// Trainer entry point (fit, validate)
        #[arg(long, default_value = "fit")]
        method: TunerMethod,

        /// Steps per trial
        #[arg(long, default_value = "3")]
        steps_per_trial: usize,

        /// Initial batch size
        #[arg(long, default_value = "2")]
        init_val: usize,

        /// Maximum number of trials
        #[arg(long, default_value = "25")]
        max_trials: usize,
    },
    /// Run the learning rate range test
    LrFind {
        /// Smallest learning rate
        #[arg(long, default_value = "1e-8")]
        min_lr: f64,

        /// Largest learning rate
        #[arg(long, default_value = "1.0")]
        max_lr: f64,

        /// Number of sweep steps
        #[arg(long, default_value = "100")]
        num_training: usize,

        /// Sweep shape (exponential, linear)
        #[arg(long, default_value = "exponential")]
        mode: LrFindMode,

        /// Stop once the loss exceeds this multiple of the best loss
        #[arg(long, default_value = "4.0")]
        early_stop_threshold: f64,

        /// Never stop early
        #[arg(long)]
        no_early_stop: bool,

        /// Write the sweep results to this JSON file
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn trainer_config(args: &Args) -> anyhow::Result<TrainerConfig> {
    let mut config = match &args.config {
        Some(path) => TrainerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => TrainerConfig::default(),
    };
    if let Some(accelerator) = args.accelerator {
        config.accelerator = accelerator;
    }
    if let Some(devices) = &args.devices {
        config.devices = devices.clone();
    }
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if let Some(dir) = &args.root_dir {
        config.default_root_dir = dir.clone();
    }
    if args.max_epochs.is_some() {
        config.max_epochs = args.max_epochs;
    }
    if args.device_memory.is_some() {
        config.device_memory_bytes = args.device_memory;
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("training_tuner=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = trainer_config(&args)?;
    let mut trainer = Trainer::from_config(config)?;
    let mut model = BoringModel::new()
        .with_dataset_len(args.dataset_len)
        .with_lr(args.lr)
        .save_hyperparameters();
    let mut tuner = Tuner::new(&mut trainer);

    match args.command {
        Command::ScaleBatchSize {
            mode,
            method,
            steps_per_trial,
            init_val,
            max_trials,
        } => {
            let config = ScaleBatchSizeConfig {
                method,
                mode,
                steps_per_trial,
                init_val,
                max_trials,
                ..Default::default()
            };
            match tuner.scale_batch_size(&mut model, config)? {
                Some(size) => println!("Optimal batch size: {size}"),
                None => println!("Batch size search skipped"),
            }
        }
        Command::LrFind {
            min_lr,
            max_lr,
            num_training,
            mode,
            early_stop_threshold,
            no_early_stop,
            output,
        } => {
            let config = LrFindConfig {
                min_lr,
                max_lr,
                num_training,
                mode,
                early_stop_threshold: (!no_early_stop).then_some(early_stop_threshold),
                ..Default::default()
            };
            let Some(mut finder) = tuner.lr_find(&mut model, config)? else {
                println!("Learning rate range test skipped");
                return Ok(());
            };
            match finder.suggestion(10, 1) {
                Some(lr) => println!("Suggested learning rate: {lr:.3e}"),
                None => println!("Not enough points for a suggestion"),
            }
            if let Some(path) = output {
                finder
                    .save(&path)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Results written to {}", path.display());
            }
        }
    }

    Ok(())
}
