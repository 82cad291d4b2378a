//! A minimal model for demos and tests.
//!
//! `BoringModel` is a single linear layer (32 → 2) trained with an MSE loss
//! against a target of ones on seeded random inputs. It is small enough that
//! every tuning procedure finishes in milliseconds, yet its loss curve
//! responds to the learning rate the way a real model's does: it falls for
//! moderate rates and diverges once the rate gets too large.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::{CombinedBatch, CombinedLoader, DataLoader, Dataset, RandomDataset};
use crate::error::{Result, TunerError};
use crate::module::{HyperParameters, LightningModule, StateDict, StepOutput};
use crate::optimizer::Sgd;

const IN_FEATURES: usize = 32;
const OUT_FEATURES: usize = 2;
const WEIGHT: &str = "layer.weight";
const BIAS: &str = "layer.bias";

/// Linear regression onto a constant target.
#[derive(Debug, Clone)]
pub struct BoringModel {
    params: StateDict,
    hparams: HyperParameters,
    batch_size: usize,
    lr: f64,
    train_data: Arc<RandomDataset>,
    val_data: Arc<RandomDataset>,
    reported_dataset_len: Option<usize>,
    activation_bytes_per_sample: u64,
}

impl Default for BoringModel {
    fn default() -> Self {
        Self::new()
    }
}

impl BoringModel {
    /// Model with 64 training and 64 validation samples, batch size 2, lr 0.1.
    pub fn new() -> Self {
        let bound = 1.0 / (IN_FEATURES as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(42);
        let mut params = StateDict::new();
        params.insert(
            WEIGHT.to_string(),
            (0..IN_FEATURES * OUT_FEATURES)
                .map(|_| rng.random_range(-bound..bound))
                .collect(),
        );
        params.insert(
            BIAS.to_string(),
            (0..OUT_FEATURES).map(|_| rng.random_range(-bound..bound)).collect(),
        );

        Self {
            params,
            hparams: HyperParameters::new(),
            batch_size: 2,
            lr: 0.1,
            train_data: Arc::new(RandomDataset::with_seed(IN_FEATURES, 64, 0)),
            val_data: Arc::new(RandomDataset::with_seed(IN_FEATURES, 64, 1)),
            reported_dataset_len: None,
            activation_bytes_per_sample: ((IN_FEATURES + OUT_FEATURES) * 4 * 2) as u64,
        }
    }

    /// Record `batch_size` and `lr` as hyperparameters so the tuner can
    /// read and overwrite them.
    #[must_use]
    pub fn save_hyperparameters(mut self) -> Self {
        self.hparams.set("batch_size", self.batch_size);
        self.hparams.set("lr", self.lr);
        self
    }

    /// Use `len` samples for both training and validation data.
    #[must_use]
    pub fn with_dataset_len(mut self, len: usize) -> Self {
        self.train_data = Arc::new(RandomDataset::with_seed(IN_FEATURES, len, 0));
        self.val_data = Arc::new(RandomDataset::with_seed(IN_FEATURES, len, 1));
        self
    }

    /// Keep the datasets but have every loader report `len` as the dataset
    /// length.
    #[must_use]
    pub fn with_reported_dataset_len(mut self, len: usize) -> Self {
        self.reported_dataset_len = Some(len);
        self
    }

    /// Initial batch size (before [`BoringModel::save_hyperparameters`]).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Initial learning rate (before [`BoringModel::save_hyperparameters`]).
    #[must_use]
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    /// Activation memory one sample needs during a step.
    #[must_use]
    pub fn with_activation_bytes_per_sample(mut self, bytes: u64) -> Self {
        self.activation_bytes_per_sample = bytes;
        self
    }

    /// Effective batch size: the hyperparameter if saved, else the default.
    pub fn batch_size(&self) -> usize {
        self.hparams
            .get_usize("batch_size")
            .unwrap_or(self.batch_size)
    }

    /// Effective learning rate: the hyperparameter if saved, else the default.
    pub fn lr(&self) -> f64 {
        self.hparams.get_f64("lr").unwrap_or(self.lr)
    }

    fn loader(&self, dataset: Arc<dyn Dataset>) -> Result<CombinedLoader> {
        let loader = CombinedLoader::single(DataLoader::new(dataset, self.batch_size())?);
        Ok(match self.reported_dataset_len {
            Some(len) => loader.with_dataset_length(len),
            None => loader,
        })
    }

    fn forward(&self, sample: &[f32]) -> [f32; OUT_FEATURES] {
        let weight = &self.params[WEIGHT];
        let bias = &self.params[BIAS];
        let mut out = [0.0; OUT_FEATURES];
        for (j, o) in out.iter_mut().enumerate() {
            let row = &weight[j * IN_FEATURES..(j + 1) * IN_FEATURES];
            *o = bias[j] + row.iter().zip(sample).map(|(w, x)| w * x).sum::<f32>();
        }
        out
    }

    fn loss_and_grads(&self, batch: &CombinedBatch, with_grads: bool) -> Result<StepOutput> {
        let n = batch.num_samples();
        if n == 0 {
            return Err(TunerError::InvalidState("empty batch".to_string()));
        }
        let denom = (n * OUT_FEATURES) as f32;
        let mut loss = 0.0;
        let mut grad_w = vec![0.0; IN_FEATURES * OUT_FEATURES];
        let mut grad_b = vec![0.0; OUT_FEATURES];

        for sample in batch.samples() {
            if sample.len() != IN_FEATURES {
                return Err(TunerError::InvalidState(format!(
                    "expected {IN_FEATURES} features, got {}",
                    sample.len()
                )));
            }
            let preds = self.forward(sample);
            for (j, p) in preds.iter().enumerate() {
                let diff = p - 1.0;
                loss += diff * diff / denom;
                if with_grads {
                    let d = 2.0 * diff / denom;
                    grad_b[j] += d;
                    for (g, x) in grad_w[j * IN_FEATURES..(j + 1) * IN_FEATURES]
                        .iter_mut()
                        .zip(sample)
                    {
                        *g += d * x;
                    }
                }
            }
        }

        let mut gradients = StateDict::new();
        if with_grads {
            gradients.insert(WEIGHT.to_string(), grad_w);
            gradients.insert(BIAS.to_string(), grad_b);
        }
        Ok(StepOutput { loss, gradients })
    }
}

impl LightningModule for BoringModel {
    fn training_step(&mut self, batch: &CombinedBatch, _batch_idx: usize) -> Result<StepOutput> {
        self.loss_and_grads(batch, true)
    }

    fn validation_step(&mut self, batch: &CombinedBatch, _batch_idx: usize) -> Result<f32> {
        Ok(self.loss_and_grads(batch, false)?.loss)
    }

    fn configure_optimizers(&self) -> Sgd {
        Sgd::with_lr(self.lr())
    }

    fn train_dataloader(&self) -> Result<CombinedLoader> {
        self.loader(self.train_data.clone())
    }

    fn val_dataloader(&self) -> Result<Option<CombinedLoader>> {
        self.loader(self.val_data.clone()).map(Some)
    }

    fn hparams(&self) -> &HyperParameters {
        &self.hparams
    }

    fn hparams_mut(&mut self) -> &mut HyperParameters {
        &mut self.hparams
    }

    fn parameters(&self) -> &StateDict {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut StateDict {
        &mut self.params
    }

    fn memory_footprint(&self, batch_size: usize) -> u64 {
        let params: usize = self.params.values().map(Vec::len).sum();
        (params * 4 * 3) as u64 + batch_size as u64 * self.activation_bytes_per_sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_batch(model: &BoringModel) -> CombinedBatch {
        model.train_dataloader().unwrap().iter().next().unwrap()
    }

    #[test]
    fn test_defaults() {
        let model = BoringModel::new();
        assert_eq!(model.batch_size(), 2);
        assert_eq!(model.lr(), 0.1);
        assert!(model.hparams().is_empty());
        assert_eq!(model.parameters()[WEIGHT].len(), 64);
        assert_eq!(
            model.train_dataloader().unwrap().dataset_length(),
            Some(64)
        );
    }

    #[test]
    fn test_save_hyperparameters() {
        let model = BoringModel::new().with_batch_size(4).save_hyperparameters();
        assert_eq!(model.hparams().get_usize("batch_size"), Some(4));
        assert_eq!(model.hparams().get_f64("lr"), Some(0.1));
    }

    #[test]
    fn test_dataset_len_override() {
        let model = BoringModel::new().with_dataset_len(5);
        let loader = model.train_dataloader().unwrap();
        assert_eq!(loader.dataset_length(), Some(5));
        assert_eq!(loader.len(), Some(3));
    }

    #[test]
    fn test_reported_dataset_len_keeps_samples() {
        let model = BoringModel::new()
            .with_reported_dataset_len(5)
            .save_hyperparameters();
        let train = model.train_dataloader().unwrap();
        assert_eq!(train.dataset_length(), Some(5));
        assert_eq!(train.len(), Some(32));
        let val = model.val_dataloader().unwrap().unwrap();
        assert_eq!(val.dataset_length(), Some(5));
    }

    #[test]
    fn test_gradient_descent_reduces_loss() {
        let mut model = BoringModel::new();
        let batch = first_batch(&model);
        let mut sgd = model.configure_optimizers();

        let before = model.training_step(&batch, 0).unwrap();
        for _ in 0..20 {
            let out = model.training_step(&batch, 0).unwrap();
            sgd.step(model.parameters_mut(), &out.gradients).unwrap();
        }
        let after = model.validation_step(&batch, 0).unwrap();
        assert!(after < before.loss);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut model = BoringModel::new();
        let batch = first_batch(&model);
        let analytic = model.training_step(&batch, 0).unwrap().gradients[BIAS][0];

        let eps = 1e-3;
        model.parameters_mut().get_mut(BIAS).unwrap()[0] += eps;
        let up = model.validation_step(&batch, 0).unwrap();
        model.parameters_mut().get_mut(BIAS).unwrap()[0] -= 2.0 * eps;
        let down = model.validation_step(&batch, 0).unwrap();
        let numeric = (up - down) / (2.0 * eps);

        assert!((analytic - numeric).abs() < 1e-2);
    }

    #[test]
    fn test_memory_footprint_grows_with_batch() {
        let model = BoringModel::new().with_activation_bytes_per_sample(100);
        assert_eq!(
            model.memory_footprint(10) - model.memory_footprint(0),
            1_000
        );
    }
}
