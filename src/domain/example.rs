// ============================================================
// Layer 3 — Example and Dataset Domain Types
// ============================================================
// An Example is one supervised instruction/response pair.
// A Dataset is the ordered list of Examples read from a single
// file. It is loaded once and never mutated afterwards, so the
// pipeline shares it behind an Arc.
//
// Every Example is rendered into one training string with a
// fixed template:
//
//   Instruction: {instruction}
//   Response: {response}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The prefix placed before the instruction text.
pub const INSTRUCTION_PREFIX: &str = "Instruction: ";

/// The separator placed between instruction and response.
pub const RESPONSE_PREFIX: &str = "\nResponse:";

/// A single instruction/response training pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub instruction: String,
    pub response:    String,
}

impl Example {
    pub fn new(instruction: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            response:    response.into(),
        }
    }

    /// Render the example into the single string the model is trained on.
    pub fn render(&self) -> String {
        format!("{} {}", render_prompt(&self.instruction), self.response)
    }
}

/// Render the instruction half of the template, ending right after
/// "Response:". The generator feeds this to the model and lets it
/// continue with the answer.
pub fn render_prompt(instruction: &str) -> String {
    format!("{INSTRUCTION_PREFIX}{instruction}{RESPONSE_PREFIX}")
}

/// An ordered, immutable collection of Examples plus the file it came from.
#[derive(Debug, Clone)]
pub struct Dataset {
    source:   PathBuf,
    examples: Vec<Example>,
}

impl Dataset {
    pub fn new(source: impl Into<PathBuf>, examples: Vec<Example>) -> Self {
        Self {
            source: source.into(),
            examples,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn get(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}
