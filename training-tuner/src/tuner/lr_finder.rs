//! Learning rate range test.
//!
//! Sweeps the learning rate from `min_lr` to `max_lr` over `num_training`
//! optimizer steps while recording an exponentially smoothed loss. The
//! suggested rate sits where the loss falls fastest with respect to the
//! learning rate.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{error, info, warn};

use crate::callbacks::Callback;
use crate::checkpoint;
use crate::config::{LrFindConfig, LrFindMode};
use crate::error::{Result, TunerError};
use crate::module::{
    lightning_getattr_f64, lightning_hasattr, lightning_setattr, LightningModule, StepOutput,
};
use crate::trainer::Trainer;

/// Smoothing factor of the recorded loss.
const BETA: f64 = 0.98;

/// Sweep results and the learning rate they suggest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrFinder {
    /// Sweep shape
    pub mode: LrFindMode,
    /// First learning rate
    pub lr_min: f64,
    /// Last learning rate
    pub lr_max: f64,
    /// Planned number of steps
    pub num_training: usize,
    /// Learning rate of every recorded step
    pub lrs: Vec<f64>,
    /// Smoothed loss of every recorded step; diverged steps may be NaN
    #[serde(serialize_with = "nan_as_null", deserialize_with = "null_as_nan")]
    pub losses: Vec<f64>,
    optimal_idx: Option<usize>,
}

impl LrFinder {
    /// Empty results for a sweep.
    pub fn new(mode: LrFindMode, lr_min: f64, lr_max: f64, num_training: usize) -> Self {
        Self {
            mode,
            lr_min,
            lr_max,
            num_training,
            lrs: Vec::new(),
            losses: Vec::new(),
            optimal_idx: None,
        }
    }

    /// Learning rate of step `step` (0-based).
    pub fn lr_at(&self, step: usize) -> f64 {
        schedule(self.mode, self.lr_min, self.lr_max, self.num_training, step)
    }

    /// Index of the last suggestion, if any.
    pub fn optimal_idx(&self) -> Option<usize> {
        self.optimal_idx
    }

    /// Suggest the learning rate with the steepest loss descent.
    ///
    /// The first `skip_begin` and last `skip_end` points are ignored, as are
    /// non-finite losses. Needs at least two points; logs an error and
    /// returns `None` otherwise.
    pub fn suggestion(&mut self, skip_begin: usize, skip_end: usize) -> Option<f64> {
        let end = self.losses.len().min(self.lrs.len()).saturating_sub(skip_end);
        let candidates: Vec<usize> = (skip_begin..end)
            .filter(|&i| self.losses[i].is_finite())
            .collect();

        if candidates.len() < 2 {
            error!(
                "Failed to compute suggestion for learning rate because there are not enough points. \
                 Increase the loop iteration limits or the size of your dataset/dataloader."
            );
            self.optimal_idx = None;
            return None;
        }

        let xs: Vec<f64> = candidates.iter().map(|&i| self.lrs[i]).collect();
        let ys: Vec<f64> = candidates.iter().map(|&i| self.losses[i]).collect();
        let grads = gradient(&ys, &xs);
        let min_grad = grads
            .iter()
            .map(|g| if g.is_nan() { f64::INFINITY } else { *g })
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)?;

        let idx = candidates[min_grad];
        self.optimal_idx = Some(idx);
        Some(self.lrs[idx])
    }

    /// Write the results as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read results written by [`LrFinder::save`].
    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

fn nan_as_null<S: Serializer>(values: &[f64], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(values.iter().map(|v| v.is_finite().then_some(*v)))
}

fn null_as_nan<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<f64>, D::Error> {
    let raw: Vec<Option<f64>> = Deserialize::deserialize(deserializer)?;
    Ok(raw.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

/// Learning rate at `step` of a `num_training`-step sweep.
fn schedule(mode: LrFindMode, lr_min: f64, lr_max: f64, num_training: usize, step: usize) -> f64 {
    let r = step as f64 / num_training.max(1) as f64;
    match mode {
        LrFindMode::Exponential => lr_min * (lr_max / lr_min).powf(r),
        LrFindMode::Linear => lr_min + r * (lr_max - lr_min),
    }
}

/// `dy/dx` with second-order central differences on a non-uniform grid and
/// one-sided differences at both ends.
fn gradient(ys: &[f64], xs: &[f64]) -> Vec<f64> {
    let n = ys.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let mut out = vec![0.0; n];
    out[0] = (ys[1] - ys[0]) / (xs[1] - xs[0]);
    out[n - 1] = (ys[n - 1] - ys[n - 2]) / (xs[n - 1] - xs[n - 2]);
    for i in 1..n - 1 {
        let hl = xs[i] - xs[i - 1];
        let hr = xs[i + 1] - xs[i];
        out[i] = (hl * hl * ys[i + 1] - hr * hr * ys[i - 1] + (hr * hr - hl * hl) * ys[i])
            / (hl * hr * (hl + hr));
    }
    out
}

/// Sets the swept learning rate before each step and records the smoothed
/// loss after it.
pub(crate) struct LrRecorder {
    mode: LrFindMode,
    lr_min: f64,
    lr_max: f64,
    num_training: usize,
    early_stop_threshold: Option<f64>,
    avg_loss: f64,
    best_loss: f64,
    lrs: Vec<f64>,
    losses: Vec<f64>,
    stopped_early: bool,
}

impl LrRecorder {
    fn new(config: &LrFindConfig) -> Self {
        Self {
            mode: config.mode,
            lr_min: config.min_lr,
            lr_max: config.max_lr,
            num_training: config.num_training,
            early_stop_threshold: config.early_stop_threshold,
            avg_loss: 0.0,
            best_loss: 0.0,
            lrs: Vec::new(),
            losses: Vec::new(),
            stopped_early: false,
        }
    }

    /// Feed one raw loss; returns whether the sweep should stop.
    fn record_loss(&mut self, loss: f64) -> bool {
        let step = self.losses.len() + 1;
        self.avg_loss = BETA * self.avg_loss + (1.0 - BETA) * loss;
        let smoothed = self.avg_loss / (1.0 - BETA.powi(step as i32 + 1));

        let diverged = self
            .early_stop_threshold
            .is_some_and(|threshold| step > 1 && smoothed > threshold * self.best_loss);
        if smoothed < self.best_loss || step == 1 {
            self.best_loss = smoothed;
        }
        self.losses.push(smoothed);
        diverged
    }
}

impl Callback for LrRecorder {
    fn name(&self) -> &'static str {
        "LrRecorder"
    }

    fn on_train_batch_start(
        &mut self,
        trainer: &mut Trainer,
        _model: &mut dyn LightningModule,
        _batch_idx: usize,
    ) -> Result<()> {
        let lr = schedule(
            self.mode,
            self.lr_min,
            self.lr_max,
            self.num_training,
            self.lrs.len(),
        );
        let optimizer = trainer
            .optimizer_mut()
            .ok_or_else(|| TunerError::InvalidState("optimizer not configured".to_string()))?;
        optimizer.set_learning_rate(lr);
        self.lrs.push(lr);
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        trainer: &mut Trainer,
        _model: &mut dyn LightningModule,
        output: &StepOutput,
        _batch_idx: usize,
    ) -> Result<()> {
        if self.record_loss(f64::from(output.loss)) {
            self.stopped_early = true;
            trainer.set_should_stop(true);
        }
        Ok(())
    }
}

/// Field holding the learning rate: `attr_name` if given, else `lr`, else
/// `learning_rate`.
fn determine_lr_attr_name(model: &dyn LightningModule, attr_name: &str) -> Result<String> {
    if !attr_name.is_empty() {
        if lightning_hasattr(model, attr_name) {
            return Ok(attr_name.to_string());
        }
        return Err(TunerError::misconfig(format!(
            "The attribute name for the learning rate was set to {attr_name}, but could not find \
             this as a field in `model` or `model.hparams`."
        )));
    }
    ["lr", "learning_rate"]
        .into_iter()
        .find(|name| lightning_hasattr(model, name))
        .map(str::to_string)
        .ok_or_else(|| {
            TunerError::misconfig(
                "When using the learning rate finder either specify in the model `lr` or \
                 `learning_rate` attribute or set `attr_name` in `lr_find`",
            )
        })
}

/// Run the range test, optionally write the suggestion into the model and
/// return the results.
///
/// Model weights, optimizer state and loop progress are restored afterwards.
/// Returns `None` when `fast_dev_run` is on.
pub(crate) fn lr_find(
    trainer: &mut Trainer,
    model: &mut dyn LightningModule,
    config: &LrFindConfig,
) -> Result<Option<LrFinder>> {
    if trainer.fast_dev_run() {
        warn!("Skipping learning rate finder since `fast_dev_run` is enabled.");
        return Ok(None);
    }
    let lr_attr_name = if config.update_attr {
        Some(determine_lr_attr_name(model, &config.attr_name)?)
    } else {
        None
    };

    let ckpt_path = checkpoint::temporary_path(trainer.default_root_dir(), "lr_find");
    trainer.save_checkpoint(&ckpt_path, model)?;
    let start_step = trainer.global_step();
    let snapshot = trainer.begin_trials(start_step + config.num_training, config.num_training);
    trainer.add_callback(Box::new(LrRecorder::new(config)));

    let outcome = trainer
        .setup_data(model)
        .and_then(|()| trainer.run_fit_loop(model));
    let steps = trainer.global_step() - start_step;
    let recorder = trainer.remove_callback::<LrRecorder>();

    trainer.end_trials(snapshot);
    let restored = trainer.restore_checkpoint(&ckpt_path, model);
    checkpoint::discard(&ckpt_path);
    outcome?;
    restored?;

    let recorder = recorder
        .ok_or_else(|| TunerError::InvalidState("learning rate recorder was detached".to_string()))?;
    if recorder.stopped_early {
        info!("LR finder stopped early after {steps} steps due to diverging loss.");
    }

    let mut finder = LrFinder::new(config.mode, config.min_lr, config.max_lr, config.num_training);
    finder.lrs = recorder.lrs;
    finder.losses = recorder.losses;

    if let (Some(attr), Some(lr)) = (lr_attr_name, finder.suggestion(10, 1)) {
        let previous = lightning_getattr_f64(model, &attr)?;
        lightning_setattr(model, &attr, lr)?;
        trainer.reset_optimizer(model);
        info!(previous, "Learning rate set to {lr}");
    }
    Ok(Some(finder))
}
