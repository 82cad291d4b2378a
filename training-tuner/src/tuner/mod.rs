//! Pre-training searches for the batch size and the learning rate.
//!
//! [`Tuner`] borrows a [`Trainer`] and runs one search at a time by attaching
//! the matching finder callback in exit-early mode, running the trainer and
//! detaching the callback again.
//!
//! # Example
//!
//! ```rust,no_run
//! use training_tuner::{BoringModel, ScaleBatchSizeConfig, Trainer, TrainerConfig, Tuner};
//!
//! let mut trainer = Trainer::from_config(TrainerConfig::builder().max_epochs(1).build())?;
//! let mut model = BoringModel::new().save_hyperparameters();
//!
//! let batch_size = Tuner::new(&mut trainer)
//!     .scale_batch_size(&mut model, ScaleBatchSizeConfig::default())?;
//! println!("batch size: {batch_size:?}");
//! # Ok::<(), training_tuner::TunerError>(())
//! ```

mod batch_size_scaling;
mod lr_finder;

pub(crate) use batch_size_scaling::scale_batch_size;
pub(crate) use lr_finder::lr_find;
pub use lr_finder::LrFinder;

use tracing::info;

use crate::callbacks::{BatchSizeFinder, LearningRateFinder};
use crate::config::{LrFindConfig, ScaleBatchSizeConfig, TunerMethod};
use crate::error::{Result, TunerError};
use crate::module::LightningModule;
use crate::trainer::Trainer;

/// Automatic batch size and learning rate selection.
#[derive(Debug)]
pub struct Tuner<'a> {
    trainer: &'a mut Trainer,
}

impl<'a> Tuner<'a> {
    /// Tuner driving `trainer`.
    pub fn new(trainer: &'a mut Trainer) -> Self {
        Self { trainer }
    }

    /// The driven trainer.
    pub fn trainer(&self) -> &Trainer {
        self.trainer
    }

    /// Find the largest batch size that trains without running out of
    /// memory and write it into the model's `batch_arg_name`.
    ///
    /// Returns `None` when `fast_dev_run` is on.
    ///
    /// # Errors
    ///
    /// Fails with [`TunerError::Misconfiguration`] under a distributed
    /// strategy or when a [`BatchSizeFinder`] is already attached.
    pub fn scale_batch_size(
        &mut self,
        model: &mut dyn LightningModule,
        config: ScaleBatchSizeConfig,
    ) -> Result<Option<usize>> {
        config.validate()?;
        self.check_scale_batch_size_configuration()?;

        let method = config.method;
        let finder = BatchSizeFinder::new(config)?.with_early_exit();
        self.trainer.prepend_callback(Box::new(finder));
        info!("Scaling batch size with `{method}`");

        let outcome = match method {
            TunerMethod::Fit => self.trainer.fit(model),
            TunerMethod::Validate => self.trainer.validate(model).map(|_| ()),
        };
        let finder = self.trainer.remove_callback::<BatchSizeFinder>();
        outcome?;
        Ok(finder.and_then(|finder| finder.optimal_batch_size()))
    }

    /// Run the learning rate range test and, with `update_attr`, write the
    /// suggestion into the model.
    ///
    /// Returns `None` when `fast_dev_run` is on.
    ///
    /// # Errors
    ///
    /// Fails with [`TunerError::Misconfiguration`] for a method other than
    /// `fit` or when a [`LearningRateFinder`] is already attached.
    pub fn lr_find(
        &mut self,
        model: &mut dyn LightningModule,
        config: LrFindConfig,
    ) -> Result<Option<LrFinder>> {
        config.validate()?;
        self.check_lr_find_configuration()?;

        let finder = LearningRateFinder::new(config)?.with_early_exit();
        self.trainer.prepend_callback(Box::new(finder));
        info!("Running learning rate range test");

        let outcome = self.trainer.fit(model);
        let finder = self.trainer.remove_callback::<LearningRateFinder>();
        outcome?;
        Ok(finder.and_then(|finder| finder.into_optimal_lr()))
    }

    fn check_scale_batch_size_configuration(&self) -> Result<()> {
        if self.trainer.connector().is_distributed() {
            return Err(TunerError::misconfig(
                "Tuning the batch size is currently not supported with distributed strategies.",
            ));
        }
        if self.trainer.has_callback::<BatchSizeFinder>() {
            return Err(TunerError::misconfig(
                "Trainer is already configured with a `BatchSizeFinder` callback. \
                 Please remove it if you want to use the Tuner.",
            ));
        }
        Ok(())
    }

    fn check_lr_find_configuration(&self) -> Result<()> {
        if self.trainer.has_callback::<LearningRateFinder>() {
            return Err(TunerError::misconfig(
                "Trainer is already configured with a `LearningRateFinder` callback. \
                 Please remove it if you want to use the Tuner.",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::Accelerator;
    use crate::boring::BoringModel;
    use crate::config::TrainerConfig;
    use tempfile::TempDir;

    #[test]
    fn test_finder_removed_after_failure() {
        let dir = TempDir::new().unwrap();
        let config = TrainerConfig::builder()
            .accelerator(Accelerator::Cpu)
            .default_root_dir(dir.path())
            .build();
        let mut trainer = Trainer::from_config(config).unwrap();
        // No `batch_size` hyperparameter recorded.
        let err = Tuner::new(&mut trainer)
            .scale_batch_size(&mut BoringModel::new(), ScaleBatchSizeConfig::default())
            .unwrap_err();
        assert!(matches!(err, TunerError::MissingAttribute { .. }));
        assert!(trainer.callbacks().is_empty());
    }

    #[test]
    fn test_tuner_leaves_user_callbacks_in_place() {
        let dir = TempDir::new().unwrap();
        let config = TrainerConfig::builder()
            .accelerator(Accelerator::Cpu)
            .default_root_dir(dir.path())
            .max_epochs(1)
            .build();
        let finder = LearningRateFinder::default();
        let mut trainer = Trainer::new(config, vec![Box::new(finder)]).unwrap();
        let mut model = BoringModel::new().with_dataset_len(5).save_hyperparameters();

        let size = Tuner::new(&mut trainer)
            .scale_batch_size(&mut model, ScaleBatchSizeConfig::default())
            .unwrap();
        assert_eq!(size, Some(5));
        assert_eq!(trainer.callbacks().len(), 1);
        assert!(trainer.has_callback::<LearningRateFinder>());
    }
}
