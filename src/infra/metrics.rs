// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Appends one CSV row per progress event so a run's loss curve
// can be plotted afterwards.
//
// Output file: <output_dir>/metrics.csv
//
//   epoch,step,avg_loss,learning_rate
//   0,10,5.431200,0.000045
//   0,20,5.102900,0.000040
//
// avg_loss is the cumulative average since the start of the run.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One progress report from the training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// 0-based epoch the step belongs to
    pub epoch: usize,

    /// Global optimizer step count, starting at 1
    pub step: usize,

    /// Mean loss over every step so far
    pub average_loss: f64,

    pub learning_rate: f64,
}

pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Create the logger, writing the CSV header if the file is new.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create metrics directory '{}'", dir.display()))?;

        let csv_path = dir.join("metrics.csv");
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)?;
            writeln!(f, "epoch,step,avg_loss,learning_rate")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    pub fn log(&self, event: &ProgressEvent) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot open '{}'", self.csv_path.display()))?;

        writeln!(
            f,
            "{},{},{:.6},{:.6e}",
            event.epoch, event.step, event.average_loss, event.learning_rate,
        )?;
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_rows_under_a_single_header() {
        let tmp = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(tmp.path()).unwrap();
        let event = ProgressEvent { epoch: 0, step: 10, average_loss: 2.5, learning_rate: 1e-4 };
        logger.log(&event).unwrap();

        // Re-opening must not write a second header
        let again = MetricsLogger::new(tmp.path()).unwrap();
        again.log(&ProgressEvent { step: 20, ..event }).unwrap();

        let text = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "epoch,step,avg_loss,learning_rate");
        assert!(lines[1].starts_with("0,10,2.500000,"));
        assert!(lines[2].starts_with("0,20,"));
    }
}
