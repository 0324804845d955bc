// ============================================================
// Layer 3 — TrainingConfig Domain Type
// ============================================================
// Loop, logging and checkpoint settings for a fine-tuning run,
// with the validation applied before any work starts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{FineTuneError, Result};

/// Loop and checkpoint settings for one TrainingJob.
///
/// `logging_interval` and `checkpoint_interval` are step counts; 0 turns
/// the periodic action off. `retention` is how many interval checkpoints
/// survive eviction; 0 keeps only the latest one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub output_dir:          PathBuf,
    pub batch_size:          usize,
    pub epochs:              usize,
    pub learning_rate:       f64,
    pub logging_interval:    usize,
    pub checkpoint_interval: usize,
    pub retention:           usize,
    /// Shuffle the example order once with this seed. None keeps file order.
    pub shuffle_seed:        Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir:          PathBuf::from("fine_tune/output"),
            batch_size:          4,
            epochs:              1,
            learning_rate:       5e-5,
            logging_interval:    10,
            checkpoint_interval: 100,
            retention:           2,
            shuffle_seed:        None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(FineTuneError::InvalidConfig(
                "batch size must be a positive integer".into(),
            ));
        }
        if self.epochs == 0 {
            return Err(FineTuneError::InvalidConfig(
                "epoch count must be a positive integer".into(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(FineTuneError::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}
