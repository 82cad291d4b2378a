//! The training loop the tuner drives.
//!
//! [`Trainer`] runs `fit` and `validate` for a [`LightningModule`], firing
//! [`Callback`] hooks along the way. Data-parallel strategies run every rank
//! in process: each rank reads its [`DistributedSampler`] shard and the
//! gradients are averaged before the optimizer step. Every step first checks
//! its memory footprint against the device budget, so a batch that does not
//! fit fails with [`TunerError::OutOfMemory`] like a real device would.

use std::fmt;
use std::path::Path;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::accelerator::{AcceleratorConnector, DeviceMemory};
use crate::callbacks::{is_callback, Callback};
use crate::checkpoint::Checkpoint;
use crate::config::{TrainerConfig, TunerMethod};
use crate::data::{CombinedBatch, CombinedLoader, DistributedSampler};
use crate::error::{Result, TunerError};
use crate::logger::MetricsLogger;
use crate::module::{LightningModule, StepOutput};
use crate::optimizer::Sgd;

/// Lifecycle of the current or last stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainerStatus {
    /// Nothing ran yet.
    #[default]
    Initializing,
    /// A stage is running.
    Running,
    /// The last stage completed, possibly through a tuner exit.
    Finished,
    /// The last stage failed.
    Interrupted,
}

/// Which stage ran last and how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainerState {
    /// Current or last stage
    pub stage: Option<TunerMethod>,
    /// Status of that stage
    pub status: TrainerStatus,
}

/// Progress and limits of the fit loop.
#[derive(Debug, Clone, Default)]
pub(crate) struct FitLoop {
    pub(crate) max_epochs: Option<usize>,
    pub(crate) max_steps: Option<usize>,
    pub(crate) global_step: usize,
    pub(crate) current_epoch: usize,
    pub(crate) combined_loader: Option<CombinedLoader>,
}

impl FitLoop {
    fn max_steps_reached(&self) -> bool {
        self.max_steps.is_some_and(|max| self.global_step >= max)
    }

    fn done(&self) -> bool {
        self.max_steps_reached() || self.max_epochs.is_some_and(|max| self.current_epoch >= max)
    }

    pub(crate) fn reset_progress(&mut self) {
        self.global_step = 0;
        self.current_epoch = 0;
    }
}

/// Loop settings a tuning run overrides and puts back afterwards.
pub(crate) struct TrialSnapshot {
    callbacks: Vec<Box<dyn Callback>>,
    max_steps: Option<usize>,
    limit_val_batches: Option<usize>,
    logger_enabled: bool,
}

/// Runs `fit` and `validate` for a model.
pub struct Trainer {
    config: TrainerConfig,
    connector: AcceleratorConnector,
    memory: DeviceMemory,
    callbacks: Vec<Box<dyn Callback>>,
    state: TrainerState,
    pub(crate) fit_loop: FitLoop,
    limit_train_batches: Option<usize>,
    limit_val_batches: Option<usize>,
    val_loader: Option<CombinedLoader>,
    optimizer: Option<Sgd>,
    logger_enabled: bool,
    logger: Option<MetricsLogger>,
    should_stop: bool,
    last_val_loss: Option<f32>,
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let callbacks: Vec<&str> = self.callbacks.iter().map(|cb| cb.name()).collect();
        f.debug_struct("Trainer")
            .field("connector", &self.connector)
            .field("memory", &self.memory)
            .field("callbacks", &callbacks)
            .field("state", &self.state)
            .field("global_step", &self.fit_loop.global_step)
            .field("current_epoch", &self.fit_loop.current_epoch)
            .finish_non_exhaustive()
    }
}

impl Trainer {
    /// Validate `config`, resolve the accelerator and attach `callbacks`.
    pub fn new(config: TrainerConfig, callbacks: Vec<Box<dyn Callback>>) -> Result<Self> {
        config.validate()?;
        let connector =
            AcceleratorConnector::new(config.accelerator, &config.devices, config.strategy)?;
        let memory = DeviceMemory::detect(&connector, config.device_memory_bytes);

        let mut fit_loop = FitLoop {
            max_epochs: config.effective_max_epochs(),
            max_steps: config.max_steps,
            ..Default::default()
        };
        let mut limit_train_batches = config.limit_train_batches;
        let mut limit_val_batches = config.limit_val_batches;
        let mut logger_enabled = config.enable_logger;

        if config.fast_dev_run {
            info!("Running in `fast_dev_run` mode: will run the requested loop using 1 batch(es).");
            fit_loop.max_epochs = Some(1);
            fit_loop.max_steps = Some(1);
            limit_train_batches = Some(1);
            limit_val_batches = Some(1);
            logger_enabled = false;
        }

        info!(
            accelerator = %connector.accelerator(),
            strategy = %connector.strategy(),
            devices = connector.num_devices(),
            "Trainer ready"
        );

        Ok(Self {
            config,
            connector,
            memory,
            callbacks,
            state: TrainerState::default(),
            fit_loop,
            limit_train_batches,
            limit_val_batches,
            val_loader: None,
            optimizer: None,
            logger_enabled,
            logger: None,
            should_stop: false,
            last_val_loss: None,
        })
    }

    /// Trainer without callbacks.
    pub fn from_config(config: TrainerConfig) -> Result<Self> {
        Self::new(config, Vec::new())
    }

    /// The configuration this trainer was built from.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Resolved accelerator, devices and strategy.
    pub fn connector(&self) -> &AcceleratorConnector {
        &self.connector
    }

    /// Device memory budget.
    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    /// Stage and status.
    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Whether `fast_dev_run` is on.
    pub fn fast_dev_run(&self) -> bool {
        self.config.fast_dev_run
    }

    /// Root directory for logs and temporary checkpoints.
    pub fn default_root_dir(&self) -> &Path {
        &self.config.default_root_dir
    }

    /// Optimizer steps taken.
    pub fn global_step(&self) -> usize {
        self.fit_loop.global_step
    }

    /// Epochs completed.
    pub fn current_epoch(&self) -> usize {
        self.fit_loop.current_epoch
    }

    /// Step limit, if any.
    pub fn max_steps(&self) -> Option<usize> {
        self.fit_loop.max_steps
    }

    /// Epoch limit, if any.
    pub fn max_epochs(&self) -> Option<usize> {
        self.fit_loop.max_epochs
    }

    /// Validation batch limit, if any.
    pub fn limit_val_batches(&self) -> Option<usize> {
        self.limit_val_batches
    }

    /// Whether metrics are written to disk.
    pub fn logger_enabled(&self) -> bool {
        self.logger_enabled
    }

    /// Directory of the metrics log, once something was logged.
    pub fn log_dir(&self) -> Option<&Path> {
        self.logger.as_ref().map(MetricsLogger::log_dir)
    }

    /// Whether the current run was asked to stop.
    pub fn should_stop(&self) -> bool {
        self.should_stop
    }

    /// Ask the current run to stop after the current step.
    pub fn set_should_stop(&mut self, stop: bool) {
        self.should_stop = stop;
    }

    /// Mean loss of the last validation run.
    pub fn last_val_loss(&self) -> Option<f32> {
        self.last_val_loss
    }

    /// Training data of the current run.
    pub fn train_loader(&self) -> Option<&CombinedLoader> {
        self.fit_loop.combined_loader.as_ref()
    }

    /// Validation data of the current run.
    pub fn val_loader(&self) -> Option<&CombinedLoader> {
        self.val_loader.as_ref()
    }

    /// The optimizer, once `fit` configured it.
    pub fn optimizer(&self) -> Option<&Sgd> {
        self.optimizer.as_ref()
    }

    /// The optimizer, mutable.
    pub fn optimizer_mut(&mut self) -> Option<&mut Sgd> {
        self.optimizer.as_mut()
    }

    /// Attached callbacks, in firing order.
    pub fn callbacks(&self) -> &[Box<dyn Callback>] {
        &self.callbacks
    }

    /// Attach `callback` after the existing ones.
    pub fn add_callback(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    /// Attach `callback` before the existing ones.
    pub(crate) fn prepend_callback(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.insert(0, callback);
    }

    /// Whether a `T` is attached.
    pub fn has_callback<T: Callback>(&self) -> bool {
        self.callbacks.iter().any(|cb| is_callback::<T>(&**cb))
    }

    /// The first attached `T`.
    pub fn callback<T: Callback>(&self) -> Option<&T> {
        self.callbacks
            .iter()
            .find_map(|cb| (**cb).as_any().downcast_ref::<T>())
    }

    /// Detach and return the first attached `T`.
    pub fn remove_callback<T: Callback>(&mut self) -> Option<Box<T>> {
        let idx = self
            .callbacks
            .iter()
            .position(|cb| is_callback::<T>(&**cb))?;
        self.callbacks.remove(idx).into_any().downcast::<T>().ok()
    }

    /// Train `model` until the step or epoch limit.
    pub fn fit(&mut self, model: &mut dyn LightningModule) -> Result<()> {
        self.run_stage(model, TunerMethod::Fit).map(|_| ())
    }

    /// Run one validation pass and return the mean loss.
    pub fn validate(&mut self, model: &mut dyn LightningModule) -> Result<Option<f32>> {
        self.run_stage(model, TunerMethod::Validate)
    }

    fn run_stage(
        &mut self,
        model: &mut dyn LightningModule,
        stage: TunerMethod,
    ) -> Result<Option<f32>> {
        info!("Starting `{stage}`");
        self.state = TrainerState {
            stage: Some(stage),
            status: TrainerStatus::Running,
        };
        self.should_stop = false;

        let outcome = self.run_stage_inner(model, stage);
        let teardown = self.dispatch(|callback, trainer| callback.teardown(trainer, model, stage));
        if let Some(logger) = self.logger.as_mut() {
            if let Err(e) = logger.flush() {
                warn!("Failed to flush metrics: {e}");
            }
        }

        match outcome {
            Ok(loss) => {
                teardown?;
                self.state.status = TrainerStatus::Finished;
                Ok(loss)
            }
            Err(TunerError::TunerExit) => {
                teardown?;
                debug!("`{stage}` ended early on tuner request");
                self.state.status = TrainerStatus::Finished;
                Ok(self.last_val_loss)
            }
            Err(e) => {
                if let Err(teardown_err) = teardown {
                    warn!("Callback teardown failed after error: {teardown_err}");
                }
                self.state.status = TrainerStatus::Interrupted;
                Err(e)
            }
        }
    }

    fn run_stage_inner(
        &mut self,
        model: &mut dyn LightningModule,
        stage: TunerMethod,
    ) -> Result<Option<f32>> {
        self.dispatch(|callback, trainer| callback.setup(trainer, model, stage))?;

        match stage {
            TunerMethod::Fit => {
                self.optimizer = Some(model.configure_optimizers());
                self.setup_data(model)?;
                self.dispatch(|callback, trainer| callback.on_fit_start(trainer, model))?;
                self.run_fit_loop(model)?;
                Ok(self.last_val_loss)
            }
            TunerMethod::Validate => {
                self.setup_val_data(model)?;
                if self.val_loader.is_none() {
                    return Err(TunerError::misconfig(
                        "No `val_dataloader()` method defined to run `Trainer.validate`.",
                    ));
                }
                self.dispatch(|callback, trainer| callback.on_validation_start(trainer, model))?;
                self.run_validation(model)
            }
        }
    }

    /// Fire one hook on every attached callback.
    ///
    /// The list is detached while the hook runs. Callbacks a hook attaches
    /// stay attached after the existing ones.
    fn dispatch<F>(&mut self, mut hook: F) -> Result<()>
    where
        F: FnMut(&mut dyn Callback, &mut Trainer) -> Result<()>,
    {
        if self.callbacks.is_empty() {
            return Ok(());
        }
        let mut callbacks = std::mem::take(&mut self.callbacks);
        let mut result = Ok(());
        for callback in callbacks.iter_mut() {
            if let Err(e) = hook(&mut **callback, self) {
                result = Err(e);
                break;
            }
        }
        callbacks.append(&mut self.callbacks);
        self.callbacks = callbacks;
        result
    }

    /// (Re)build the data loaders from the model's current settings.
    pub(crate) fn setup_data(&mut self, model: &dyn LightningModule) -> Result<()> {
        let train = model.train_dataloader()?;
        debug!(batches = ?train.len(), "Training data ready");
        self.fit_loop.combined_loader = Some(train);
        self.val_loader = model.val_dataloader()?;
        Ok(())
    }

    /// (Re)build only the validation loader.
    pub(crate) fn setup_val_data(&mut self, model: &dyn LightningModule) -> Result<()> {
        self.val_loader = model.val_dataloader()?;
        Ok(())
    }

    /// (Re)configure the optimizer from the model's current settings.
    pub(crate) fn reset_optimizer(&mut self, model: &dyn LightningModule) {
        self.optimizer = Some(model.configure_optimizers());
    }

    /// Run epochs until a limit is hit or a stop is requested.
    pub(crate) fn run_fit_loop(&mut self, model: &mut dyn LightningModule) -> Result<()> {
        let loader = self.fit_loop.combined_loader.clone().ok_or_else(|| {
            TunerError::InvalidState("the fit loop has no training data".to_string())
        })?;
        if self.optimizer.is_none() {
            self.reset_optimizer(model);
        }

        let world_size = self.connector.world_size();
        let shards = if world_size > 1 {
            (0..world_size)
                .map(|rank| {
                    DistributedSampler::new(rank, world_size).map(|sampler| loader.sharded(sampler))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![loader]
        };

        while !self.should_stop && !self.fit_loop.done() {
            self.dispatch(|callback, trainer| callback.on_train_epoch_start(trainer, model))?;

            let mut iters: Vec<_> = shards.iter().map(CombinedLoader::iter).collect();
            let mut batch_idx = 0;
            while !self.should_stop && !self.fit_loop.max_steps_reached() {
                if self.limit_train_batches.is_some_and(|limit| batch_idx >= limit) {
                    break;
                }
                let Some(batches) = iters
                    .iter_mut()
                    .map(Iterator::next)
                    .collect::<Option<Vec<_>>>()
                else {
                    break;
                };

                self.dispatch(|callback, trainer| {
                    callback.on_train_batch_start(trainer, model, batch_idx)
                })?;
                let output = self.training_step(model, &batches, batch_idx)?;
                self.fit_loop.global_step += 1;
                if self.fit_loop.global_step % self.config.log_every_n_steps == 0 {
                    self.log_metric("train_loss", f64::from(output.loss))?;
                }
                self.dispatch(|callback, trainer| {
                    callback.on_train_batch_end(trainer, model, &output, batch_idx)
                })?;
                batch_idx += 1;
            }

            if batch_idx == 0 {
                warn!(
                    epoch = self.fit_loop.current_epoch,
                    "Training epoch produced no batches, stopping"
                );
                break;
            }

            if !self.should_stop {
                self.run_validation(model)?;
            }
            self.dispatch(|callback, trainer| callback.on_train_epoch_end(trainer, model))?;
            self.fit_loop.current_epoch += 1;
            debug!(
                epoch = self.fit_loop.current_epoch,
                global_step = self.fit_loop.global_step,
                "Epoch finished"
            );
        }
        Ok(())
    }

    /// One optimizer step over one batch per rank.
    fn training_step(
        &mut self,
        model: &mut dyn LightningModule,
        batches: &[CombinedBatch],
        batch_idx: usize,
    ) -> Result<StepOutput> {
        let mut reduced = StepOutput::default();
        for batch in batches {
            let samples = batch.num_samples();
            self.memory.allocate(model.memory_footprint(samples), samples)?;
            let output = model.training_step(batch, batch_idx)?;
            reduced.loss += output.loss;
            for (name, grad) in output.gradients {
                let acc = reduced
                    .gradients
                    .entry(name)
                    .or_insert_with(|| vec![0.0; grad.len()]);
                for (a, g) in acc.iter_mut().zip(&grad) {
                    *a += g;
                }
            }
        }

        // All-reduce mean across ranks.
        if batches.len() > 1 {
            let scale = 1.0 / batches.len() as f32;
            reduced.loss *= scale;
            for grad in reduced.gradients.values_mut() {
                grad.iter_mut().for_each(|g| *g *= scale);
            }
        }

        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| TunerError::InvalidState("optimizer not configured".to_string()))?;
        optimizer.step(model.parameters_mut(), &reduced.gradients)?;
        Ok(reduced)
    }

    /// One pass over the validation data, returning the mean loss.
    pub(crate) fn run_validation(
        &mut self,
        model: &mut dyn LightningModule,
    ) -> Result<Option<f32>> {
        let Some(loader) = self.val_loader.clone() else {
            return Ok(None);
        };

        let mut total = 0.0;
        let mut count = 0usize;
        for (batch_idx, batch) in loader.iter().enumerate() {
            if self.limit_val_batches.is_some_and(|limit| batch_idx >= limit) {
                break;
            }
            let samples = batch.num_samples();
            self.memory.allocate(model.memory_footprint(samples), samples)?;
            total += model.validation_step(&batch, batch_idx)?;
            count += 1;
        }
        if count == 0 {
            return Ok(None);
        }

        let loss = total / count as f32;
        self.last_val_loss = Some(loss);
        self.log_metric("val_loss", f64::from(loss))?;
        debug!(val_loss = loss, batches = count, "Validation finished");
        Ok(Some(loss))
    }

    fn log_metric(&mut self, name: &str, value: f64) -> Result<()> {
        if !self.logger_enabled {
            return Ok(());
        }
        if self.logger.is_none() {
            self.logger = Some(MetricsLogger::create(&self.config.default_root_dir)?);
        }
        if let Some(logger) = self.logger.as_mut() {
            logger.log(
                name,
                value,
                self.fit_loop.global_step,
                self.fit_loop.current_epoch,
            )?;
        }
        Ok(())
    }

    /// Save model weights, optimizer state and loop progress to `path`.
    pub fn save_checkpoint(&self, path: &Path, model: &dyn LightningModule) -> Result<()> {
        let checkpoint = Checkpoint {
            global_step: self.fit_loop.global_step,
            epoch: self.fit_loop.current_epoch,
            state_dict: model.parameters().clone(),
            optimizer: self.optimizer.clone(),
            created_at: Utc::now(),
        };
        checkpoint.save(path)?;
        debug!("Saved checkpoint to {}", path.display());
        Ok(())
    }

    /// Restore what [`Trainer::save_checkpoint`] wrote.
    ///
    /// Hyperparameters are left untouched so tuned values survive.
    pub fn restore_checkpoint(&mut self, path: &Path, model: &mut dyn LightningModule) -> Result<()> {
        let checkpoint = Checkpoint::load(path)?;
        model.load_state_dict(&checkpoint.state_dict)?;
        self.optimizer = checkpoint.optimizer;
        self.fit_loop.global_step = checkpoint.global_step;
        self.fit_loop.current_epoch = checkpoint.epoch;
        info!("Restored states from the checkpoint file at {}", path.display());
        Ok(())
    }

    /// Override loop settings for tuning trials.
    ///
    /// Detaches the callbacks, silences the logger and caps the steps.
    pub(crate) fn begin_trials(
        &mut self,
        max_steps: usize,
        limit_val_batches: usize,
    ) -> TrialSnapshot {
        let snapshot = TrialSnapshot {
            callbacks: std::mem::take(&mut self.callbacks),
            max_steps: self.fit_loop.max_steps,
            limit_val_batches: self.limit_val_batches,
            logger_enabled: self.logger_enabled,
        };
        self.fit_loop.max_steps = Some(max_steps);
        self.limit_val_batches = Some(limit_val_batches);
        self.logger_enabled = false;
        snapshot
    }

    /// Undo [`Trainer::begin_trials`].
    pub(crate) fn end_trials(&mut self, snapshot: TrialSnapshot) {
        self.callbacks = snapshot.callbacks;
        self.fit_loop.max_steps = snapshot.max_steps;
        self.limit_val_batches = snapshot.limit_val_batches;
        self.logger_enabled = snapshot.logger_enabled;
        self.should_stop = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::{Accelerator, Devices, StrategyKind};
    use crate::boring::BoringModel;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> crate::config::TrainerConfigBuilder {
        TrainerConfig::builder()
            .accelerator(Accelerator::Cpu)
            .default_root_dir(dir.path())
    }

    struct Counter {
        batches: usize,
        epochs: usize,
        stop_after: Option<usize>,
    }

    impl Callback for Counter {
        fn name(&self) -> &'static str {
            "Counter"
        }

        fn on_train_batch_end(
            &mut self,
            trainer: &mut Trainer,
            _model: &mut dyn LightningModule,
            _output: &StepOutput,
            _batch_idx: usize,
        ) -> Result<()> {
            self.batches += 1;
            if self.stop_after == Some(self.batches) {
                trainer.set_should_stop(true);
            }
            Ok(())
        }

        fn on_train_epoch_end(
            &mut self,
            _trainer: &mut Trainer,
            _model: &mut dyn LightningModule,
        ) -> Result<()> {
            self.epochs += 1;
            Ok(())
        }
    }

    fn counter(stop_after: Option<usize>) -> Box<dyn Callback> {
        Box::new(Counter {
            batches: 0,
            epochs: 0,
            stop_after,
        })
    }

    #[test]
    fn test_fit_respects_max_steps() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(
            config(&dir).max_steps(5).enable_logger(false).build(),
            vec![counter(None)],
        )
        .unwrap();
        let mut model = BoringModel::new();
        trainer.fit(&mut model).unwrap();

        assert_eq!(trainer.global_step(), 5);
        assert_eq!(trainer.state().status, TrainerStatus::Finished);
        assert_eq!(trainer.callback::<Counter>().unwrap().batches, 5);
    }

    #[test]
    fn test_fit_runs_epochs_and_validation() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(
            config(&dir).max_epochs(2).enable_logger(false).build(),
            vec![counter(None)],
        )
        .unwrap();
        let mut model = BoringModel::new().with_dataset_len(8);
        trainer.fit(&mut model).unwrap();

        // 8 samples at batch size 2
        assert_eq!(trainer.global_step(), 8);
        assert_eq!(trainer.current_epoch(), 2);
        assert_eq!(trainer.callback::<Counter>().unwrap().epochs, 2);
        assert!(trainer.last_val_loss().is_some());
    }

    #[test]
    fn test_should_stop_ends_fit() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(
            config(&dir).max_steps(50).enable_logger(false).build(),
            vec![counter(Some(3))],
        )
        .unwrap();
        trainer.fit(&mut BoringModel::new()).unwrap();
        assert_eq!(trainer.global_step(), 3);
    }

    #[test]
    fn test_fast_dev_run_single_batch() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::from_config(config(&dir).fast_dev_run(true).build()).unwrap();
        trainer.fit(&mut BoringModel::new()).unwrap();
        assert_eq!(trainer.global_step(), 1);
        assert!(!trainer.logger_enabled());
        assert!(trainer.log_dir().is_none());
    }

    #[test]
    fn test_out_of_memory_interrupts_fit() {
        let dir = TempDir::new().unwrap();
        let mut model = BoringModel::new().with_activation_bytes_per_sample(1_000);
        let budget = model.memory_footprint(1);
        let mut trainer = Trainer::from_config(
            config(&dir)
                .max_steps(2)
                .enable_logger(false)
                .device_memory_bytes(budget)
                .build(),
        )
        .unwrap();

        let err = trainer.fit(&mut model).unwrap_err();
        assert!(err.is_oom());
        assert_eq!(trainer.state().status, TrainerStatus::Interrupted);
    }

    #[test]
    fn test_ddp_shards_data_across_ranks() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::from_config(
            config(&dir)
                .devices(Devices::Count(2))
                .strategy(StrategyKind::Ddp)
                .max_epochs(1)
                .enable_logger(false)
                .build(),
        )
        .unwrap();
        assert_eq!(trainer.connector().world_size(), 2);

        let mut model = BoringModel::new().with_dataset_len(8);
        trainer.fit(&mut model).unwrap();
        // 4 samples per rank at batch size 2
        assert_eq!(trainer.global_step(), 2);
    }

    #[test]
    fn test_validate_returns_mean_loss() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::from_config(config(&dir).enable_logger(false).build()).unwrap();
        let loss = trainer.validate(&mut BoringModel::new()).unwrap();
        assert!(loss.unwrap() > 0.0);
        assert_eq!(trainer.global_step(), 0);
    }

    #[test]
    fn test_checkpoint_restores_weights_and_progress() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::from_config(
            config(&dir).max_steps(3).enable_logger(false).build(),
        )
        .unwrap();
        let mut model = BoringModel::new();
        let before = model.parameters().clone();
        let path = dir.path().join("state.ckpt");

        trainer.save_checkpoint(&path, &model).unwrap();
        trainer.fit(&mut model).unwrap();
        assert_ne!(model.parameters(), &before);

        trainer.restore_checkpoint(&path, &mut model).unwrap();
        assert_eq!(model.parameters(), &before);
        assert_eq!(trainer.global_step(), 0);
    }

    #[test]
    fn test_metrics_are_logged() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::from_config(
            config(&dir).max_steps(4).log_every_n_steps(2).build(),
        )
        .unwrap();
        trainer.fit(&mut BoringModel::new()).unwrap();

        let log_dir = trainer.log_dir().unwrap().to_path_buf();
        let records = crate::logger::read_metrics(&log_dir.join("metrics.jsonl")).unwrap();
        let train: Vec<_> = records.iter().filter(|r| r.name == "train_loss").collect();
        assert_eq!(train.len(), 2);
        assert_eq!(train[1].step, 4);
    }

    #[test]
    fn test_remove_callback_downcasts() {
        let dir = TempDir::new().unwrap();
        let mut trainer =
            Trainer::new(config(&dir).build(), vec![counter(Some(7))]).unwrap();
        assert!(trainer.has_callback::<Counter>());
        let removed = trainer.remove_callback::<Counter>().unwrap();
        assert_eq!(removed.stop_after, Some(7));
        assert!(!trainer.has_callback::<Counter>());
    }
}
