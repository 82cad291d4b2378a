//! Batch size search.
//!
//! Trains for a few steps at growing batch sizes until a step runs out of
//! device memory, then settles on the largest size that worked. Candidates
//! never exceed the dataset length of the active loader, since a larger
//! batch would only ever see the same samples.

use tracing::{debug, info, warn};

use crate::checkpoint;
use crate::config::{ScaleBatchSizeConfig, ScaleMode, TunerMethod};
use crate::data::CombinedLoader;
use crate::error::Result;
use crate::module::{lightning_getattr_usize, lightning_setattr, LightningModule};
use crate::trainer::Trainer;

/// How to derive the next candidate.
#[derive(Debug, Clone, Copy)]
enum Adjust {
    /// Multiply the current size.
    Factor(f64),
    /// Use this size.
    Value(usize),
}

/// Search the largest batch size that fits, write it into the model and
/// return it.
///
/// Model weights, optimizer state and loop progress are restored afterwards;
/// only the batch size hyperparameter changes. Returns `None` when
/// `fast_dev_run` is on.
pub(crate) fn scale_batch_size(
    trainer: &mut Trainer,
    model: &mut dyn LightningModule,
    config: &ScaleBatchSizeConfig,
) -> Result<Option<usize>> {
    if trainer.fast_dev_run() {
        warn!("Skipping batch size scaler since `fast_dev_run` is enabled.");
        return Ok(None);
    }

    let original_size = lightning_getattr_usize(model, &config.batch_arg_name)?;
    let ckpt_path = checkpoint::temporary_path(trainer.default_root_dir(), "scale_batch_size");
    trainer.save_checkpoint(&ckpt_path, model)?;
    let snapshot = trainer.begin_trials(config.steps_per_trial, config.steps_per_trial);

    let outcome = run_search(trainer, model, config);

    trainer.end_trials(snapshot);
    let restored = trainer.restore_checkpoint(&ckpt_path, model);
    checkpoint::discard(&ckpt_path);
    let new_size = match outcome {
        Ok(size) => size,
        Err(e) => {
            let reverted = lightning_setattr(model, &config.batch_arg_name, original_size)
                .and_then(|()| reset_dataloaders(trainer, model, config.method));
            if let Err(revert_err) = reverted {
                warn!("Failed to restore batch size {original_size}: {revert_err}");
            }
            return Err(e);
        }
    };
    restored?;

    lightning_setattr(model, &config.batch_arg_name, new_size)?;
    reset_dataloaders(trainer, model, config.method)?;
    info!("Finished batch size finder, will continue with full run using batch size {new_size}");
    Ok(Some(new_size))
}

fn run_search(
    trainer: &mut Trainer,
    model: &mut dyn LightningModule,
    config: &ScaleBatchSizeConfig,
) -> Result<usize> {
    let (init_size, _) = adjust_batch_size(
        trainer,
        model,
        config,
        Adjust::Value(config.init_val),
        None,
    )?;
    debug!(mode = %config.mode, init_size, "Starting batch size search");

    match config.mode {
        ScaleMode::Power => run_power_scaling(trainer, model, config, init_size),
        ScaleMode::Binsearch => run_binsearch_scaling(trainer, model, config, init_size),
    }
}

/// Double until a trial fails or the size stops changing.
fn run_power_scaling(
    trainer: &mut Trainer,
    model: &mut dyn LightningModule,
    config: &ScaleBatchSizeConfig,
    mut new_size: usize,
) -> Result<usize> {
    let mut last_successful = None;

    for trial in 0..config.max_trials {
        match try_loop_run(trainer, model, config.method) {
            Ok(()) => {
                last_successful = Some(new_size);
                if trial + 1 >= config.max_trials {
                    break;
                }
                let (size, changed) =
                    adjust_batch_size(trainer, model, config, Adjust::Factor(2.0), Some("succeeded"))?;
                if !changed {
                    break;
                }
                new_size = size;
            }
            Err(e) if e.is_oom() => {
                if new_size <= 1 && last_successful.is_none() {
                    return Err(e);
                }
                let (size, _) =
                    adjust_batch_size(trainer, model, config, Adjust::Factor(0.5), Some("failed"))?;
                new_size = size;
                if last_successful.is_some() {
                    break;
                }
            }
            Err(e) => return Err(e),
        }
    }

    finish(model, config, last_successful, new_size)
}

/// Double until the first failure, then bisect between the last success
/// and the smallest failure.
fn run_binsearch_scaling(
    trainer: &mut Trainer,
    model: &mut dyn LightningModule,
    config: &ScaleBatchSizeConfig,
    mut new_size: usize,
) -> Result<usize> {
    let mut low = 1;
    let mut high: Option<usize> = None;
    let mut last_successful = None;

    for trial in 0..config.max_trials {
        match try_loop_run(trainer, model, config.method) {
            Ok(()) => {
                last_successful = Some(new_size);
                if trial + 1 >= config.max_trials {
                    break;
                }
                low = new_size;
                let (size, changed) = match high {
                    Some(high) => {
                        if high.saturating_sub(low) <= 1 {
                            break;
                        }
                        let midval = (high + low) / 2;
                        adjust_batch_size(trainer, model, config, Adjust::Value(midval), Some("succeeded"))?
                    }
                    None => {
                        adjust_batch_size(trainer, model, config, Adjust::Factor(2.0), Some("succeeded"))?
                    }
                };
                if !changed {
                    break;
                }
                new_size = size;
            }
            Err(e) if e.is_oom() => {
                if new_size <= 1 {
                    return Err(e);
                }
                high = Some(new_size);
                let midval = (new_size + low) / 2;
                let (size, _) =
                    adjust_batch_size(trainer, model, config, Adjust::Value(midval), Some("failed"))?;
                new_size = size;
                if high.is_some_and(|high| high.saturating_sub(low) <= 1) {
                    break;
                }
            }
            Err(e) => return Err(e),
        }
    }

    finish(model, config, last_successful, new_size)
}

/// Settle on the last size that trained, falling back to the current one.
fn finish(
    model: &mut dyn LightningModule,
    config: &ScaleBatchSizeConfig,
    last_successful: Option<usize>,
    new_size: usize,
) -> Result<usize> {
    let size = last_successful.unwrap_or(new_size);
    if size != new_size {
        lightning_setattr(model, &config.batch_arg_name, size)?;
    }
    Ok(size)
}

/// Run one trial from fresh progress with freshly built loaders.
fn try_loop_run(
    trainer: &mut Trainer,
    model: &mut dyn LightningModule,
    method: TunerMethod,
) -> Result<()> {
    trainer.fit_loop.reset_progress();
    trainer.set_should_stop(false);
    reset_dataloaders(trainer, model, method)?;
    match method {
        TunerMethod::Fit => trainer.run_fit_loop(model),
        TunerMethod::Validate => trainer.run_validation(model).map(|_| ()),
    }
}

fn reset_dataloaders(
    trainer: &mut Trainer,
    model: &dyn LightningModule,
    method: TunerMethod,
) -> Result<()> {
    match method {
        TunerMethod::Fit => trainer.setup_data(model),
        TunerMethod::Validate => trainer.setup_val_data(model),
    }
}

fn active_loader(trainer: &Trainer, method: TunerMethod) -> Option<&CombinedLoader> {
    match method {
        TunerMethod::Fit => trainer.train_loader(),
        TunerMethod::Validate => trainer.val_loader(),
    }
}

/// Move the model's batch size by `adjust`, capped at the dataset length.
///
/// Returns the new size and whether it differs from the old one.
fn adjust_batch_size(
    trainer: &mut Trainer,
    model: &mut dyn LightningModule,
    config: &ScaleBatchSizeConfig,
    adjust: Adjust,
    desc: Option<&str>,
) -> Result<(usize, bool)> {
    let batch_size = lightning_getattr_usize(model, &config.batch_arg_name)?;
    reset_dataloaders(trainer, model, config.method)?;
    let dataset_length = active_loader(trainer, config.method).and_then(CombinedLoader::dataset_length);

    let mut new_size = match adjust {
        Adjust::Factor(factor) => (batch_size as f64 * factor) as usize,
        Adjust::Value(value) => value,
    }
    .max(1);

    if let Some(length) = dataset_length {
        if new_size > length {
            if batch_size >= length {
                info!("The batch size {batch_size} is greater or equal than the length of your dataset.");
            }
            new_size = length.max(1);
        }
    }

    if let Some(desc) = desc {
        info!("Batch size {batch_size} {desc}, trying batch size {new_size}");
    }
    lightning_setattr(model, &config.batch_arg_name, new_size)?;
    Ok((new_size, new_size != batch_size))
}
