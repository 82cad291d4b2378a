//! Stochastic gradient descent over a [`StateDict`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};
use crate::module::StateDict;

/// Optimizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Momentum factor (0 disables momentum)
    pub momentum: f64,
    /// L2 penalty
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

/// SGD with optional momentum and weight decay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sgd {
    config: SgdConfig,
    /// Momentum buffers, created on first use.
    velocity: BTreeMap<String, Vec<f32>>,
}

impl Sgd {
    /// Optimizer with these settings.
    pub fn new(config: SgdConfig) -> Self {
        Self {
            config,
            velocity: BTreeMap::new(),
        }
    }

    /// Plain SGD at `learning_rate`.
    pub fn with_lr(learning_rate: f64) -> Self {
        Self::new(SgdConfig {
            learning_rate,
            ..Default::default()
        })
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Set learning rate (used by the learning rate finder).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Apply `gradients` to `params`.
    ///
    /// # Errors
    ///
    /// Returns an error if a gradient has no matching parameter or a
    /// different length.
    pub fn step(&mut self, params: &mut StateDict, gradients: &StateDict) -> Result<()> {
        let lr = self.config.learning_rate as f32;
        let momentum = self.config.momentum as f32;
        let weight_decay = self.config.weight_decay as f32;

        for (name, grad) in gradients {
            let param = params.get_mut(name).ok_or_else(|| {
                TunerError::InvalidState(format!("gradient for unknown parameter `{name}`"))
            })?;
            if param.len() != grad.len() {
                return Err(TunerError::InvalidState(format!(
                    "gradient for `{name}` has {} values, parameter has {}",
                    grad.len(),
                    param.len()
                )));
            }

            if momentum == 0.0 {
                for (p, g) in param.iter_mut().zip(grad) {
                    *p -= lr * (g + weight_decay * *p);
                }
                continue;
            }

            let buf = self
                .velocity
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; grad.len()]);
            for ((p, g), v) in param.iter_mut().zip(grad).zip(buf.iter_mut()) {
                *v = momentum * *v + g + weight_decay * *p;
                *p -= lr * *v;
            }
        }
        Ok(())
    }

    /// Drop the momentum buffers.
    pub fn zero_state(&mut self) {
        self.velocity.clear();
    }
}
