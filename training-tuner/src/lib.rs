//! Batch size and learning rate tuning for training loops
//!
//! This crate provides:
//! - A [`Tuner`] that searches the largest batch size fitting in device memory
//! - A learning rate range test with a steepest-descent suggestion
//! - The training loop both searches drive: [`Trainer`], callbacks, data
//!   loaders and the [`LightningModule`] model interface
//! - Accelerator and strategy resolution with a device memory budget
//! - Temporary checkpoints so tuning leaves the model untouched
//!
//! # Binaries
//!
//! - `tune` - Run the batch size search or the learning rate range test on
//!   the demo model from the command line

pub mod accelerator;
pub mod boring;
pub mod callbacks;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod logger;
pub mod module;
pub mod optimizer;
pub mod trainer;
pub mod tuner;

pub use accelerator::{Accelerator, AcceleratorConnector, DeviceMemory, Devices, StrategyKind};
pub use boring::BoringModel;
pub use callbacks::{BatchSizeFinder, Callback, LearningRateFinder};
pub use config::{
    LrFindConfig, LrFindMode, ScaleBatchSizeConfig, ScaleMode, TrainerConfig, TunerMethod,
};
pub use data::{CombinedLoader, CombinedMode, DataLoader, Dataset, RandomDataset};
pub use error::{Result, TunerError};
pub use module::{HyperParameters, LightningModule, StateDict, StepOutput};
pub use optimizer::{Sgd, SgdConfig};
pub use trainer::{Trainer, TrainerState, TrainerStatus};
pub use tuner::{LrFinder, Tuner};
