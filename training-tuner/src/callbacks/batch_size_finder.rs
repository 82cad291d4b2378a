//! Callback that searches the batch size when a run starts.

use tracing::debug;

use super::Callback;
use crate::config::{ScaleBatchSizeConfig, TunerMethod};
use crate::error::{Result, TunerError};
use crate::module::{lightning_hasattr, LightningModule};
use crate::trainer::Trainer;
use crate::tuner::scale_batch_size;

/// Finds the largest batch size that fits in device memory.
///
/// Attached by the user, it tunes the batch size and lets the run continue
/// with the result. Attached by [`crate::Tuner`], it ends the run right after
/// the search.
#[derive(Debug, Clone, Default)]
pub struct BatchSizeFinder {
    config: ScaleBatchSizeConfig,
    early_exit: bool,
    optimal_batch_size: Option<usize>,
}

impl BatchSizeFinder {
    /// Finder with the given search settings.
    pub fn new(config: ScaleBatchSizeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Default::default()
        })
    }

    /// End the run once the search is done.
    pub(crate) fn with_early_exit(mut self) -> Self {
        self.early_exit = true;
        self
    }

    /// Search settings.
    pub fn config(&self) -> &ScaleBatchSizeConfig {
        &self.config
    }

    /// Result of the last search.
    pub fn optimal_batch_size(&self) -> Option<usize> {
        self.optimal_batch_size
    }

    fn scale(&mut self, trainer: &mut Trainer, model: &mut dyn LightningModule) -> Result<()> {
        self.optimal_batch_size = scale_batch_size(trainer, model, &self.config)?;
        debug!(batch_size = ?self.optimal_batch_size, "Batch size search done");
        if self.early_exit {
            return Err(TunerError::TunerExit);
        }
        Ok(())
    }
}

impl Callback for BatchSizeFinder {
    fn name(&self) -> &'static str {
        "BatchSizeFinder"
    }

    fn setup(
        &mut self,
        trainer: &mut Trainer,
        model: &mut dyn LightningModule,
        _stage: TunerMethod,
    ) -> Result<()> {
        if trainer.connector().is_distributed() {
            return Err(TunerError::misconfig(
                "The Batch size finder is not supported with distributed strategies.",
            ));
        }
        if !lightning_hasattr(model, &self.config.batch_arg_name) {
            return Err(TunerError::MissingAttribute {
                name: self.config.batch_arg_name.clone(),
            });
        }
        Ok(())
    }

    fn on_fit_start(&mut self, trainer: &mut Trainer, model: &mut dyn LightningModule) -> Result<()> {
        if self.config.method != TunerMethod::Fit {
            return Ok(());
        }
        self.scale(trainer, model)
    }

    fn on_validation_start(
        &mut self,
        trainer: &mut Trainer,
        model: &mut dyn LightningModule,
    ) -> Result<()> {
        if self.config.method != TunerMethod::Validate
            || trainer.state().stage != Some(TunerMethod::Validate)
        {
            return Ok(());
        }
        self.scale(trainer, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::{Accelerator, Devices, StrategyKind};
    use crate::boring::BoringModel;
    use crate::config::TrainerConfig;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> crate::config::TrainerConfigBuilder {
        TrainerConfig::builder()
            .accelerator(Accelerator::Cpu)
            .default_root_dir(dir.path())
            .enable_logger(false)
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let err = BatchSizeFinder::new(ScaleBatchSizeConfig {
            steps_per_trial: 0,
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("steps_per_trial"));
    }

    #[test]
    fn test_user_callback_tunes_then_trains() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(
            config(&dir).max_steps(4).build(),
            vec![Box::new(BatchSizeFinder::default())],
        )
        .unwrap();
        let mut model = BoringModel::new().with_dataset_len(16).save_hyperparameters();
        trainer.fit(&mut model).unwrap();

        let finder = trainer.callback::<BatchSizeFinder>().unwrap();
        assert_eq!(finder.optimal_batch_size(), Some(16));
        assert_eq!(model.batch_size(), 16);
        assert_eq!(trainer.global_step(), 4);
        assert_eq!(trainer.max_steps(), Some(4));
    }

    #[test]
    fn test_missing_batch_arg_fails_setup() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(
            config(&dir).build(),
            vec![Box::new(BatchSizeFinder::default())],
        )
        .unwrap();
        let err = trainer.fit(&mut BoringModel::new()).unwrap_err();
        assert!(matches!(err, TunerError::MissingAttribute { .. }));
    }

    #[test]
    fn test_distributed_fails_setup() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(
            config(&dir)
                .devices(Devices::Count(2))
                .strategy(StrategyKind::Ddp)
                .build(),
            vec![Box::new(BatchSizeFinder::default())],
        )
        .unwrap();
        let err = trainer
            .fit(&mut BoringModel::new().save_hyperparameters())
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("The Batch size finder is not supported with distributed strategies."));
    }
}
