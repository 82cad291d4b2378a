//! Configuration types for the trainer and the two tuning procedures.
//!
//! All configurations are serde structs with per-field defaults, so a TOML
//! file only needs to name what it changes.
//!
//! # Example
//!
//! ```rust
//! use training_tuner::config::{ScaleBatchSizeConfig, ScaleMode, TrainerConfig};
//!
//! let trainer = TrainerConfig::builder()
//!     .max_epochs(1)
//!     .default_root_dir("/tmp/runs")
//!     .build();
//! assert_eq!(trainer.effective_max_epochs(), Some(1));
//!
//! let scale = ScaleBatchSizeConfig {
//!     mode: ScaleMode::Binsearch,
//!     ..Default::default()
//! };
//! assert_eq!(scale.init_val, 2);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::accelerator::{Accelerator, Devices, StrategyKind};
use crate::error::{Result, TunerError};

/// Epoch limit applied when neither `max_epochs` nor `max_steps` is set.
pub const DEFAULT_MAX_EPOCHS: usize = 1000;

/// Trainer configuration.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `devices` | `auto` | Device count, `-1`, index list or `auto` |
/// | `strategy` | `auto` | Parallel strategy |
/// | `accelerator` | `auto` | Hardware backend |
/// | `default_root_dir` | `.` | Logs and temporary checkpoints |
/// | `max_epochs` | unset | 1000 when `max_steps` is unset too |
/// | `max_steps` | unset | Optimizer step limit |
/// | `fast_dev_run` | `false` | Run a single batch and skip tuning |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Devices to train on.
    #[serde(default)]
    pub devices: Devices,

    /// Parallel strategy.
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Hardware backend.
    #[serde(default)]
    pub accelerator: Accelerator,

    /// Root directory for logs and temporary tuner checkpoints.
    #[serde(default = "default_root_dir")]
    pub default_root_dir: PathBuf,

    /// Maximum number of epochs.
    #[serde(default)]
    pub max_epochs: Option<usize>,

    /// Maximum number of optimizer steps.
    #[serde(default)]
    pub max_steps: Option<usize>,

    /// Cap on training batches per epoch.
    #[serde(default)]
    pub limit_train_batches: Option<usize>,

    /// Cap on validation batches per run.
    #[serde(default)]
    pub limit_val_batches: Option<usize>,

    /// Run one training and one validation batch, then stop.
    #[serde(default)]
    pub fast_dev_run: bool,

    /// Write metrics to `default_root_dir/lightning_logs`.
    #[serde(default = "default_enable_logger")]
    pub enable_logger: bool,

    /// Logging interval in optimizer steps.
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,

    /// Device memory budget in bytes; detected when unset.
    #[serde(default)]
    pub device_memory_bytes: Option<u64>,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_enable_logger() -> bool {
    true
}
fn default_log_every_n_steps() -> usize {
    50
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            devices: Devices::default(),
            strategy: StrategyKind::default(),
            accelerator: Accelerator::default(),
            default_root_dir: default_root_dir(),
            max_epochs: None,
            max_steps: None,
            limit_train_batches: None,
            limit_val_batches: None,
            fast_dev_run: false,
            enable_logger: default_enable_logger(),
            log_every_n_steps: default_log_every_n_steps(),
            device_memory_bytes: None,
        }
    }
}

impl TrainerConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> TrainerConfigBuilder {
        TrainerConfigBuilder::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&content)?)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TunerError::misconfig(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.log_every_n_steps == 0 {
            return Err(TunerError::misconfig("log_every_n_steps must be > 0"));
        }
        if self.device_memory_bytes == Some(0) {
            return Err(TunerError::misconfig("device_memory_bytes must be > 0"));
        }
        Ok(())
    }

    /// Epoch limit after applying defaults; `None` means unlimited.
    pub fn effective_max_epochs(&self) -> Option<usize> {
        match (self.max_epochs, self.max_steps) {
            (Some(epochs), _) => Some(epochs),
            (None, None) => Some(DEFAULT_MAX_EPOCHS),
            (None, Some(_)) => None,
        }
    }
}

/// Builder for [`TrainerConfig`].
#[derive(Debug, Default)]
pub struct TrainerConfigBuilder {
    config: TrainerConfig,
}

impl TrainerConfigBuilder {
    /// Sets the devices.
    #[must_use]
    pub fn devices(mut self, devices: Devices) -> Self {
        self.config.devices = devices;
        self
    }

    /// Sets the strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Sets the accelerator.
    #[must_use]
    pub fn accelerator(mut self, accelerator: Accelerator) -> Self {
        self.config.accelerator = accelerator;
        self
    }

    /// Sets the root directory.
    #[must_use]
    pub fn default_root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.default_root_dir = dir.into();
        self
    }

    /// Sets the epoch limit.
    #[must_use]
    pub fn max_epochs(mut self, epochs: usize) -> Self {
        self.config.max_epochs = Some(epochs);
        self
    }

    /// Sets the step limit.
    #[must_use]
    pub fn max_steps(mut self, steps: usize) -> Self {
        self.config.max_steps = Some(steps);
        self
    }

    /// Caps training batches per epoch.
    #[must_use]
    pub fn limit_train_batches(mut self, batches: usize) -> Self {
        self.config.limit_train_batches = Some(batches);
        self
    }

    /// Caps validation batches.
    #[must_use]
    pub fn limit_val_batches(mut self, batches: usize) -> Self {
        self.config.limit_val_batches = Some(batches);
        self
    }

    /// Enables fast dev run.
    #[must_use]
    pub fn fast_dev_run(mut self, enabled: bool) -> Self {
        self.config.fast_dev_run = enabled;
        self
    }

    /// Enables or disables the metrics logger.
    #[must_use]
    pub fn enable_logger(mut self, enabled: bool) -> Self {
        self.config.enable_logger = enabled;
        self
    }

    /// Sets the logging interval.
    #[must_use]
    pub fn log_every_n_steps(mut self, steps: usize) -> Self {
        self.config.log_every_n_steps = steps;
        self
    }

    /// Sets an explicit device memory budget.
    #[must_use]
    pub fn device_memory_bytes(mut self, bytes: u64) -> Self {
        self.config.device_memory_bytes = Some(bytes);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> TrainerConfig {
        self.config
    }
}

/// Trainer entry point a tuning procedure drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunerMethod {
    /// `Trainer::fit`.
    #[default]
    Fit,
    /// `Trainer::validate`.
    Validate,
}

impl fmt::Display for TunerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fit => write!(f, "fit"),
            Self::Validate => write!(f, "validate"),
        }
    }
}

impl FromStr for TunerMethod {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fit" => Ok(Self::Fit),
            "validate" => Ok(Self::Validate),
            other => Err(TunerError::misconfig(format!(
                "method {other:?} is invalid. Should be one of `fit` or `validate`."
            ))),
        }
    }
}

/// How the batch size search explores sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMode {
    /// Keep doubling until a trial fails.
    #[default]
    Power,
    /// Double until the first failure, then bisect.
    Binsearch,
}

impl fmt::Display for ScaleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Power => write!(f, "power"),
            Self::Binsearch => write!(f, "binsearch"),
        }
    }
}

impl FromStr for ScaleMode {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "power" => Ok(Self::Power),
            "binsearch" => Ok(Self::Binsearch),
            _ => Err(TunerError::misconfig(
                "`mode` should be either of `power` or `binsearch`",
            )),
        }
    }
}

/// Settings for [`crate::Tuner::scale_batch_size`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleBatchSizeConfig {
    /// Trainer entry point to tune for.
    #[serde(default)]
    pub method: TunerMethod,

    /// Search mode.
    #[serde(default)]
    pub mode: ScaleMode,

    /// Optimizer steps run for each candidate size.
    #[serde(default = "default_steps_per_trial")]
    pub steps_per_trial: usize,

    /// First batch size to try.
    #[serde(default = "default_init_val")]
    pub init_val: usize,

    /// Maximum number of candidate sizes.
    #[serde(default = "default_max_trials")]
    pub max_trials: usize,

    /// Hyperparameter holding the batch size.
    #[serde(default = "default_batch_arg_name")]
    pub batch_arg_name: String,
}

fn default_steps_per_trial() -> usize {
    3
}
fn default_init_val() -> usize {
    2
}
fn default_max_trials() -> usize {
    25
}
fn default_batch_arg_name() -> String {
    "batch_size".to_string()
}

impl Default for ScaleBatchSizeConfig {
    fn default() -> Self {
        Self {
            method: TunerMethod::default(),
            mode: ScaleMode::default(),
            steps_per_trial: default_steps_per_trial(),
            init_val: default_init_val(),
            max_trials: default_max_trials(),
            batch_arg_name: default_batch_arg_name(),
        }
    }
}

impl ScaleBatchSizeConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.steps_per_trial == 0 {
            return Err(TunerError::misconfig("steps_per_trial must be > 0"));
        }
        if self.init_val == 0 {
            return Err(TunerError::misconfig("init_val must be > 0"));
        }
        if self.max_trials == 0 {
            return Err(TunerError::misconfig("max_trials must be > 0"));
        }
        if self.batch_arg_name.is_empty() {
            return Err(TunerError::misconfig("batch_arg_name must not be empty"));
        }
        Ok(())
    }
}

/// Learning rate sweep shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrFindMode {
    /// Geometric sweep from `min_lr` to `max_lr`.
    #[default]
    Exponential,
    /// Arithmetic sweep from `min_lr` to `max_lr`.
    Linear,
}

impl fmt::Display for LrFindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exponential => write!(f, "exponential"),
            Self::Linear => write!(f, "linear"),
        }
    }
}

impl FromStr for LrFindMode {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            _ => Err(TunerError::misconfig(
                "`mode` should be either 'linear' or 'exponential'",
            )),
        }
    }
}

/// Settings for [`crate::Tuner::lr_find`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrFindConfig {
    /// Trainer entry point; only `fit` is valid.
    #[serde(default)]
    pub method: TunerMethod,

    /// Lower end of the sweep.
    #[serde(default = "default_min_lr")]
    pub min_lr: f64,

    /// Upper end of the sweep.
    #[serde(default = "default_max_lr")]
    pub max_lr: f64,

    /// Number of steps in the sweep.
    #[serde(default = "default_num_training")]
    pub num_training: usize,

    /// Sweep shape.
    #[serde(default)]
    pub mode: LrFindMode,

    /// Stop once the smoothed loss exceeds this multiple of the best loss.
    #[serde(default = "default_early_stop_threshold")]
    pub early_stop_threshold: Option<f64>,

    /// Write the suggestion back into the model's hyperparameters.
    #[serde(default = "default_update_attr")]
    pub update_attr: bool,

    /// Hyperparameter holding the learning rate; empty means `lr` or `learning_rate`.
    #[serde(default)]
    pub attr_name: String,
}

fn default_min_lr() -> f64 {
    1e-8
}
fn default_max_lr() -> f64 {
    1.0
}
fn default_num_training() -> usize {
    100
}
fn default_early_stop_threshold() -> Option<f64> {
    Some(4.0)
}
fn default_update_attr() -> bool {
    true
}

impl Default for LrFindConfig {
    fn default() -> Self {
        Self {
            method: TunerMethod::default(),
            min_lr: default_min_lr(),
            max_lr: default_max_lr(),
            num_training: default_num_training(),
            mode: LrFindMode::default(),
            early_stop_threshold: default_early_stop_threshold(),
            update_attr: default_update_attr(),
            attr_name: String::new(),
        }
    }
}

impl LrFindConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.method != TunerMethod::Fit {
            return Err(TunerError::misconfig(
                "method='fit' is the only valid configuration to run lr finder.",
            ));
        }
        if !(self.min_lr > 0.0 && self.min_lr.is_finite()) {
            return Err(TunerError::misconfig("min_lr must be a positive number"));
        }
        if !(self.max_lr > self.min_lr && self.max_lr.is_finite()) {
            return Err(TunerError::misconfig("max_lr must be greater than min_lr"));
        }
        if self.num_training == 0 {
            return Err(TunerError::misconfig("num_training must be > 0"));
        }
        if let Some(threshold) = self.early_stop_threshold {
            if threshold <= 0.0 {
                return Err(TunerError::misconfig("early_stop_threshold must be > 0"));
            }
        }
        Ok(())
    }
}
