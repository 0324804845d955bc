// ============================================================
// Layer 4 — JSONL Dataset Loader
// ============================================================
// Reads a newline-delimited JSON file where every record is an
// object with two string fields:
//
//   {"instruction": "2+2?", "response": "4"}
//
// Blank lines are skipped. Extra fields are ignored. A record that
// is not an object, or that lacks either field, fails the whole
// load with the file path and the 1-based line number.
//
// An empty file produces an empty Dataset; refusing to train on it
// is the TrainingJob's decision, not the loader's.

use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::example::{Dataset, Example};
use crate::domain::traits::ExampleSource;
use crate::error::{FineTuneError, Result};

/// Loads instruction/response examples from a JSONL file.
pub struct JsonlLoader {
    path: PathBuf,
}

impl JsonlLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ExampleSource for JsonlLoader {
    fn load(&self) -> Result<Dataset> {
        let text = fs::read_to_string(&self.path).map_err(|source| FineTuneError::DatasetRead {
            path: self.path.clone(),
            source,
        })?;

        let examples = parse_records(&self.path, &text)?;
        tracing::info!(
            "Loaded {} examples from '{}'",
            examples.len(),
            self.path.display()
        );

        Ok(Dataset::new(self.path.clone(), examples))
    }
}

/// Parse every non-blank line of `text` into an Example.
fn parse_records(path: &Path, text: &str) -> Result<Vec<Example>> {
    let mut examples = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // serde reports "missing field `response`" or "invalid type"
        // which is exactly what the user needs to fix the record
        let example: Example =
            serde_json::from_str(line).map_err(|e| FineTuneError::DatasetFormat {
                path:   path.to_path_buf(),
                line:   idx + 1,
                reason: e.to_string(),
            })?;

        examples.push(example);
    }

    Ok(examples)
}
