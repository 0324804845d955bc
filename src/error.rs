// ============================================================
// Error taxonomy
// ============================================================
// Every failure the fine-tuning pipeline can surface. Each variant
// carries the identifier the user needs to act on: a model name,
// a file path, or a sublayer name.
//
// Setup errors (model, adapter, dataset) are raised before a
// TrainingJob exists. Faults during a step move the job to Failed
// and are returned as TrainingFault.

use std::path::PathBuf;

use thiserror::Error;

use crate::ml::trainer::JobState;

#[derive(Debug, Error)]
pub enum FineTuneError {
    #[error("model '{name}' not found (known models: {known})")]
    ModelNotFound { name: String, known: String },

    #[error("target sublayer '{target}' does not exist in model '{model}'")]
    InvalidTarget { target: String, model: String },

    #[error("model '{model}' already carries an adapter")]
    AlreadyAdapted { model: String },

    #[error("dataset '{}' line {line}: {reason}", path.display())]
    DatasetFormat {
        path:   PathBuf,
        line:   usize,
        reason: String,
    },

    #[error("cannot read dataset '{}': {source}", path.display())]
    DatasetRead {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset '{}' contains no examples", path.display())]
    EmptyDataset { path: PathBuf },

    #[error("checkpoint I/O failed at '{}': {reason}", path.display())]
    CheckpointIo { path: PathBuf, reason: String },

    #[error("no checkpoint found at '{}'", path.display())]
    CheckpointNotFound { path: PathBuf },

    #[error("tokenizer for '{model}': {reason}")]
    Tokenizer { model: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("training fault at epoch {epoch}, step {step}: {reason}")]
    TrainingFault {
        epoch:  usize,
        step:   usize,
        reason: String,
    },

    #[error("training job is {state:?} and cannot be started again")]
    InvalidState { state: JobState },
}

impl FineTuneError {
    /// Build a CheckpointIo error from anything displayable.
    pub fn checkpoint_io(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::CheckpointIo {
            path:   path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FineTuneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offending_identifier() {
        let e = FineTuneError::InvalidTarget {
            target: "q_proj".into(),
            model:  "tiny-gpt2".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("q_proj"));
        assert!(msg.contains("tiny-gpt2"));

        let e = FineTuneError::DatasetFormat {
            path:   PathBuf::from("data/train.jsonl"),
            line:   3,
            reason: "missing field `response`".into(),
        };
        assert!(e.to_string().contains("data/train.jsonl"));
        assert!(e.to_string().contains("line 3"));
    }
}
