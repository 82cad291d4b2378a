//! The model interface the trainer and tuner drive.
//!
//! A [`LightningModule`] bundles the model parameters, its training and
//! validation steps, its data and its hyperparameters. The tuner reads and
//! writes tunable values (batch size, learning rate) through the
//! [`HyperParameters`] map, so any model that records them there can be tuned.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::{CombinedBatch, CombinedLoader};
use crate::error::{Result, TunerError};
use crate::optimizer::Sgd;

/// Named parameter tensors, flattened.
pub type StateDict = BTreeMap<String, Vec<f32>>;

/// Loss and gradients of one training step.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Scalar loss.
    pub loss: f32,
    /// Gradient per parameter, same layout as the [`StateDict`].
    pub gradients: StateDict,
}

/// Saved hyperparameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HyperParameters(Map<String, Value>);

impl HyperParameters {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is recorded.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Raw value of `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// `name` as an unsigned integer.
    pub fn get_usize(&self, name: &str) -> Option<usize> {
        self.0
            .get(name)
            .and_then(Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
    }

    /// `name` as a float.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    /// Record `value` under `name`, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// A trainable model with its data and hyperparameters.
pub trait LightningModule: Send {
    /// Loss and gradients for one batch.
    fn training_step(&mut self, batch: &CombinedBatch, batch_idx: usize) -> Result<StepOutput>;

    /// Validation loss for one batch.
    fn validation_step(&mut self, batch: &CombinedBatch, batch_idx: usize) -> Result<f32>;

    /// Optimizer for this model.
    fn configure_optimizers(&self) -> Sgd;

    /// Training data.
    fn train_dataloader(&self) -> Result<CombinedLoader>;

    /// Validation data, if any.
    fn val_dataloader(&self) -> Result<Option<CombinedLoader>> {
        Ok(None)
    }

    /// Saved hyperparameters.
    fn hparams(&self) -> &HyperParameters;

    /// Saved hyperparameters, mutable.
    fn hparams_mut(&mut self) -> &mut HyperParameters;

    /// Model parameters.
    fn parameters(&self) -> &StateDict;

    /// Model parameters, mutable.
    fn parameters_mut(&mut self) -> &mut StateDict;

    /// Device bytes a training step with `batch_size` samples needs.
    ///
    /// Default: weights, gradients and one optimizer buffer in fp32.
    fn memory_footprint(&self, batch_size: usize) -> u64 {
        let _ = batch_size;
        let params: usize = self.parameters().values().map(Vec::len).sum();
        (params * 4 * 3) as u64
    }

    /// Replace the parameters with `state`.
    ///
    /// Every key must exist with the same length.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let params = self.parameters_mut();
        if params.len() != state.len() {
            return Err(TunerError::InvalidState(format!(
                "state dict has {} entries, model has {}",
                state.len(),
                params.len()
            )));
        }
        for (name, values) in state {
            match params.get_mut(name) {
                Some(p) if p.len() == values.len() => p.copy_from_slice(values),
                Some(p) => {
                    return Err(TunerError::InvalidState(format!(
                        "size mismatch for `{name}`: checkpoint {} vs model {}",
                        values.len(),
                        p.len()
                    )));
                }
                None => {
                    return Err(TunerError::InvalidState(format!(
                        "unexpected key `{name}` in state dict"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Whether `model` records the hyperparameter `name`.
pub fn lightning_hasattr(model: &dyn LightningModule, name: &str) -> bool {
    model.hparams().contains(name)
}

/// Integer hyperparameter `name` of `model`.
pub fn lightning_getattr_usize(model: &dyn LightningModule, name: &str) -> Result<usize> {
    model
        .hparams()
        .get_usize(name)
        .ok_or_else(|| TunerError::MissingAttribute {
            name: name.to_string(),
        })
}

/// Float hyperparameter `name` of `model`.
pub fn lightning_getattr_f64(model: &dyn LightningModule, name: &str) -> Result<f64> {
    model
        .hparams()
        .get_f64(name)
        .ok_or_else(|| TunerError::MissingAttribute {
            name: name.to_string(),
        })
}

/// Overwrite the existing hyperparameter `name` of `model`.
pub fn lightning_setattr(
    model: &mut dyn LightningModule,
    name: &str,
    value: impl Into<Value>,
) -> Result<()> {
    if !lightning_hasattr(model, name) {
        return Err(TunerError::MissingAttribute {
            name: name.to_string(),
        });
    }
    model.hparams_mut().set(name, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boring::BoringModel;

    #[test]
    fn test_hparams_typed_access() {
        let mut hp = HyperParameters::new();
        hp.set("batch_size", 8);
        hp.set("lr", 0.01);
        assert_eq!(hp.get_usize("batch_size"), Some(8));
        assert_eq!(hp.get_f64("lr"), Some(0.01));
        assert_eq!(hp.get_usize("lr"), None);
        assert_eq!(hp.len(), 2);
    }

    #[test]
    fn test_hparams_serde_transparent() {
        let mut hp = HyperParameters::new();
        hp.set("batch_size", 4);
        let json = serde_json::to_string(&hp).unwrap();
        assert_eq!(json, r#"{"batch_size":4}"#);
    }

    #[test]
    fn test_attr_helpers() {
        let mut model = BoringModel::new().save_hyperparameters();
        assert!(lightning_hasattr(&model, "batch_size"));
        assert_eq!(lightning_getattr_usize(&model, "batch_size").unwrap(), 2);
        assert_eq!(lightning_getattr_f64(&model, "lr").unwrap(), 0.1);

        lightning_setattr(&mut model, "batch_size", 16).unwrap();
        assert_eq!(lightning_getattr_usize(&model, "batch_size").unwrap(), 16);

        let err = lightning_setattr(&mut model, "missing", 1).unwrap_err();
        assert!(matches!(err, TunerError::MissingAttribute { .. }));
    }

    #[test]
    fn test_load_state_dict_checks_shapes() {
        let mut model = BoringModel::new();
        let mut state = model.parameters().clone();
        state.get_mut("layer.bias").unwrap().push(0.0);
        assert!(model.load_state_dict(&state).is_err());

        let mut state = model.parameters().clone();
        state.get_mut("layer.bias").unwrap()[0] = 7.0;
        model.load_state_dict(&state).unwrap();
        assert_eq!(model.parameters()["layer.bias"][0], 7.0);
    }
}
