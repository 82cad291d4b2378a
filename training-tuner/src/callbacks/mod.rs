//! Trainer callbacks.
//!
//! Callbacks hook into the trainer's lifecycle. Every hook receives the
//! trainer and the model mutably, so a callback may run nested training
//! (this is how the finders work) or request an early stop.
//!
//! While a hook runs, the trainer's own callback list is detached: nested
//! runs started from inside a hook see only the callbacks registered during
//! that hook.

mod batch_size_finder;
mod lr_finder;

use std::any::Any;

pub use batch_size_finder::BatchSizeFinder;
pub use lr_finder::LearningRateFinder;

use crate::config::TunerMethod;
use crate::error::Result;
use crate::module::{LightningModule, StepOutput};
use crate::trainer::Trainer;

/// Upcast to [`Any`] for callback type checks.
pub trait AsAny: Any {
    /// `&self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;

    /// `Box<Self>` as `Box<dyn Any>`.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Lifecycle hooks. Every hook defaults to a no-op.
#[allow(unused_variables)]
pub trait Callback: AsAny + Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Called once when `fit` or `validate` begins.
    fn setup(
        &mut self,
        trainer: &mut Trainer,
        model: &mut dyn LightningModule,
        stage: TunerMethod,
    ) -> Result<()> {
        Ok(())
    }

    /// Called after data setup, before the first training epoch.
    fn on_fit_start(&mut self, trainer: &mut Trainer, model: &mut dyn LightningModule) -> Result<()> {
        Ok(())
    }

    /// Called before a validation run.
    fn on_validation_start(
        &mut self,
        trainer: &mut Trainer,
        model: &mut dyn LightningModule,
    ) -> Result<()> {
        Ok(())
    }

    /// Called at the start of each training epoch.
    fn on_train_epoch_start(
        &mut self,
        trainer: &mut Trainer,
        model: &mut dyn LightningModule,
    ) -> Result<()> {
        Ok(())
    }

    /// Called before every training step.
    fn on_train_batch_start(
        &mut self,
        trainer: &mut Trainer,
        model: &mut dyn LightningModule,
        batch_idx: usize,
    ) -> Result<()> {
        Ok(())
    }

    /// Called after every optimizer step.
    fn on_train_batch_end(
        &mut self,
        trainer: &mut Trainer,
        model: &mut dyn LightningModule,
        output: &StepOutput,
        batch_idx: usize,
    ) -> Result<()> {
        Ok(())
    }

    /// Called at the end of each training epoch.
    fn on_train_epoch_end(
        &mut self,
        trainer: &mut Trainer,
        model: &mut dyn LightningModule,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once when `fit` or `validate` ends, also on failure.
    fn teardown(
        &mut self,
        trainer: &mut Trainer,
        model: &mut dyn LightningModule,
        stage: TunerMethod,
    ) -> Result<()> {
        Ok(())
    }
}

/// Whether `callback` is a `T`.
pub fn is_callback<T: Callback>(callback: &dyn Callback) -> bool {
    callback.as_any().is::<T>()
}
