//! Temporary checkpoints taken around tuning runs.
//!
//! The finders train the model for real while they search, so the model
//! weights, the optimizer state and the loop counters are saved to disk
//! before the search and restored afterwards.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::module::StateDict;
use crate::optimizer::Sgd;

/// Everything needed to put a model and its loop back where they were.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Optimizer steps taken so far
    pub global_step: usize,
    /// Epochs completed so far
    pub epoch: usize,
    /// Model weights
    pub state_dict: StateDict,
    /// Optimizer state, if an optimizer was configured
    pub optimizer: Option<Sgd>,
    /// Timestamp
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Write the checkpoint as JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a checkpoint written by [`Checkpoint::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Unique hidden checkpoint path under `root`, e.g.
/// `.scale_batch_size_<uuid>.ckpt`.
pub fn temporary_path(root: &Path, prefix: &str) -> PathBuf {
    root.join(format!(".{prefix}_{}.ckpt", Uuid::new_v4()))
}

/// Delete a temporary checkpoint. A missing file is not an error.
pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed temporary checkpoint {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// [`remove`] that only warns on failure, so cleanup never hides the
/// outcome of the run that used the checkpoint.
pub fn discard(path: &Path) {
    if let Err(e) = remove(path) {
        tracing::warn!("Failed to remove temporary checkpoint {}: {e}", path.display());
    }
}
