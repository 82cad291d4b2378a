//! Error types for training-tuner.
//!
//! Every fallible operation in the crate returns [`Result`]. Misconfiguration
//! problems are reported eagerly, before any training step runs, so a tuning
//! call either fails fast or produces a verified value.
//!
//! # Example
//!
//! ```rust
//! use training_tuner::{Result, TunerError};
//!
//! fn check_batch(batch_size: usize) -> Result<()> {
//!     if batch_size == 0 {
//!         return Err(TunerError::Misconfiguration(
//!             "batch size must be positive".to_string(),
//!         ));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_batch(0).is_err());
//! ```

use thiserror::Error;

/// Result type alias for training-tuner operations.
pub type Result<T> = std::result::Result<T, TunerError>;

/// Errors that can occur while configuring, training, or tuning.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TunerError {
    /// Invalid or incompatible configuration.
    #[error("{0}")]
    Misconfiguration(String),

    /// A hyperparameter the tuner needs to read or write is missing.
    #[error("Field `{name}` not found in `model` nor its `hparams` attributes.")]
    MissingAttribute {
        /// Name of the missing field.
        name: String,
    },

    /// A training step needed more device memory than is available.
    #[error(
        "out of memory: tried to allocate {requested} bytes with batch size {batch_size} \
         ({available} bytes available)"
    )]
    OutOfMemory {
        /// Bytes the step asked for.
        requested: u64,
        /// Bytes the device has.
        available: u64,
        /// Batch size of the failing step.
        batch_size: usize,
    },

    /// The requested accelerator cannot run on this machine.
    #[error("`{0}` can not run on your system since the accelerator is not available.")]
    AcceleratorUnavailable(String),

    /// The trainer was driven in an order it does not support.
    #[error("invalid trainer state: {0}")]
    InvalidState(String),

    /// A finder asked the trainer to stop after tuning.
    ///
    /// Raised from a callback hook and consumed by [`crate::Trainer::fit`]
    /// and [`crate::Trainer::validate`]; never surfaces to callers.
    #[error("tuner finished, exiting the run")]
    TunerExit,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (checkpoint, metrics, finder results) error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file parse error.
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

impl TunerError {
    /// Whether this error is a recoverable out-of-memory failure.
    ///
    /// The batch size search reacts to these by shrinking the batch; every
    /// other error aborts the search.
    #[must_use]
    pub fn is_oom(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Shorthand for building a [`TunerError::Misconfiguration`].
    pub(crate) fn misconfig(msg: impl Into<String>) -> Self {
        Self::Misconfiguration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_oom() {
        let oom = TunerError::OutOfMemory {
            requested: 10,
            available: 5,
            batch_size: 64,
        };
        assert!(oom.is_oom());
        assert!(!TunerError::misconfig("nope").is_oom());
        assert!(!TunerError::TunerExit.is_oom());
    }

    #[test]
    fn test_missing_attribute_message() {
        let err = TunerError::MissingAttribute {
            name: "batch_size".to_string(),
        };
        assert!(err.to_string().contains("Field `batch_size` not found"));
    }

    #[test]
    fn test_misconfiguration_is_verbatim() {
        let err = TunerError::misconfig("exact text");
        assert_eq!(err.to_string(), "exact text");
    }
}
