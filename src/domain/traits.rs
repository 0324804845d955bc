// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The seams between the fine-tuning core and whatever consumes it.
//
//   ExampleSource  → anything that yields a Dataset
//                    (JsonlLoader reads newline-delimited JSON)
//   TextGenerator  → anything that turns a prompt into a reply
//                    (Generator runs a base model + adapter)
//
// The chat/agent layer only ever sees TextGenerator.

use crate::domain::example::Dataset;
use crate::error::Result;

// ─── ExampleSource ────────────────────────────────────────────────────────────
/// A component that can load a labelled instruction/response dataset.
pub trait ExampleSource {
    fn load(&self) -> Result<Dataset>;
}

// ─── TextGenerator ────────────────────────────────────────────────────────────
/// A component that produces a text reply for a prompt.
pub trait TextGenerator {
    fn generate(&self, prompt: &str) -> Result<String>;
}
