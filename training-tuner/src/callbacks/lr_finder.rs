//! Callback that runs the learning rate range test when fitting starts.

use super::Callback;
use crate::config::LrFindConfig;
use crate::error::{Result, TunerError};
use crate::module::LightningModule;
use crate::trainer::Trainer;
use crate::tuner::{lr_find, LrFinder};

/// Runs the learning rate range test on `fit` start.
///
/// Attached by the user, the run continues with the suggested learning rate
/// (when `update_attr` is set). Attached by [`crate::Tuner`], it ends the run
/// right after the test.
#[derive(Debug, Clone, Default)]
pub struct LearningRateFinder {
    config: LrFindConfig,
    early_exit: bool,
    optimal_lr: Option<LrFinder>,
}

impl LearningRateFinder {
    /// Finder with the given sweep settings.
    pub fn new(config: LrFindConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Default::default()
        })
    }

    pub(crate) fn with_early_exit(mut self) -> Self {
        self.early_exit = true;
        self
    }

    /// Sweep settings.
    pub fn config(&self) -> &LrFindConfig {
        &self.config
    }

    /// Results of the last sweep.
    pub fn optimal_lr(&self) -> Option<&LrFinder> {
        self.optimal_lr.as_ref()
    }

    pub(crate) fn into_optimal_lr(self) -> Option<LrFinder> {
        self.optimal_lr
    }
}

impl Callback for LearningRateFinder {
    fn name(&self) -> &'static str {
        "LearningRateFinder"
    }

    fn on_fit_start(&mut self, trainer: &mut Trainer, model: &mut dyn LightningModule) -> Result<()> {
        self.optimal_lr = lr_find(trainer, model, &self.config)?;
        if self.early_exit {
            return Err(TunerError::TunerExit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::Accelerator;
    use crate::boring::BoringModel;
    use crate::config::{TrainerConfig, TunerMethod};
    use tempfile::TempDir;

    #[test]
    fn test_rejects_validate_method() {
        let err = LearningRateFinder::new(LrFindConfig {
            method: TunerMethod::Validate,
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("method='fit'"));
    }

    #[test]
    fn test_user_callback_sets_lr_then_trains() {
        let dir = TempDir::new().unwrap();
        let config = TrainerConfig::builder()
            .accelerator(Accelerator::Cpu)
            .default_root_dir(dir.path())
            .enable_logger(false)
            .max_steps(3)
            .build();
        let finder = LearningRateFinder::new(LrFindConfig {
            num_training: 30,
            ..Default::default()
        })
        .unwrap();
        let mut trainer = Trainer::new(config, vec![Box::new(finder)]).unwrap();
        let mut model = BoringModel::new().save_hyperparameters();
        trainer.fit(&mut model).unwrap();

        let results = trainer
            .callback::<LearningRateFinder>()
            .and_then(LearningRateFinder::optimal_lr)
            .unwrap();
        let idx = results.optimal_idx().unwrap();
        assert_eq!(model.lr(), results.lrs[idx]);
        assert_eq!(trainer.global_step(), 3);
    }
}
