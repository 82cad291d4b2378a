//! JSON-lines metrics logger.
//!
//! Each run writes to `<root>/lightning_logs/version_<n>/metrics.jsonl`, one
//! [`MetricRecord`] per line, where `n` is the first unused version number.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Metric name, e.g. `train_loss`
    pub name: String,
    /// Value
    pub value: f64,
    /// Global step when logged
    pub step: usize,
    /// Epoch when logged
    pub epoch: usize,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Appends metrics of one run.
#[derive(Debug)]
pub struct MetricsLogger {
    log_dir: PathBuf,
    writer: BufWriter<File>,
}

impl MetricsLogger {
    /// Create the next `version_<n>` directory under `root/lightning_logs`.
    pub fn create(root: &Path) -> Result<Self> {
        let base = root.join("lightning_logs");
        fs::create_dir_all(&base)?;
        let version = next_version(&base)?;
        let log_dir = base.join(format!("version_{version}"));
        fs::create_dir_all(&log_dir)?;
        let file = File::create(log_dir.join("metrics.jsonl"))?;
        tracing::debug!("Logging metrics to {}", log_dir.display());
        Ok(Self {
            log_dir,
            writer: BufWriter::new(file),
        })
    }

    /// Directory of this run.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Append one metric.
    pub fn log(&mut self, name: &str, value: f64, step: usize, epoch: usize) -> Result<()> {
        let record = MetricRecord {
            name: name.to_string(),
            value,
            step,
            epoch,
            timestamp: Utc::now(),
        };
        writeln!(self.writer, "{}", serde_json::to_string(&record)?)?;
        Ok(())
    }

    /// Flush buffered records to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn next_version(base: &Path) -> Result<usize> {
    let mut next = 0;
    for entry in fs::read_dir(base)? {
        let name = entry?.file_name();
        if let Some(n) = name
            .to_str()
            .and_then(|s| s.strip_prefix("version_"))
            .and_then(|s| s.parse::<usize>().ok())
        {
            next = next.max(n + 1);
        }
    }
    Ok(next)
}

/// Read all records of a `metrics.jsonl` file.
pub fn read_metrics(path: &Path) -> Result<Vec<MetricRecord>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_versions_increment() {
        let dir = TempDir::new().unwrap();
        let first = MetricsLogger::create(dir.path()).unwrap();
        let second = MetricsLogger::create(dir.path()).unwrap();
        assert!(first.log_dir().ends_with("version_0"));
        assert!(second.log_dir().ends_with("version_1"));
    }

    #[test]
    fn test_log_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut logger = MetricsLogger::create(dir.path()).unwrap();
        logger.log("train_loss", 0.5, 1, 0).unwrap();
        logger.log("val_loss", 0.25, 1, 0).unwrap();
        logger.flush().unwrap();

        let records = read_metrics(&logger.log_dir().join("metrics.jsonl")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].name, "val_loss");
        assert_eq!(records[1].value, 0.25);
    }
}
