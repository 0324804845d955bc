// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything between the JSONL file on disk and the tensors the
// training loop consumes:
//
//   train.jsonl
//       │
//       ▼
//   JsonlLoader       → reads records into a Dataset
//       │
//       ▼
//   tokenize()        → renders the template, encodes, pads per batch
//       │
//       ▼
//   LmBatcher         → stacks a TokenizedBatch into [N, S] tensors
//       │
//       ▼
//   TrainingJob       → consumes batches strictly in order
//
// Each module owns exactly one step.

/// Reads instruction/response records from JSONL files
pub mod loader;

/// Lazy, deterministic tokenisation into padded batches
pub mod preprocessor;

/// Converts token batches into backend tensors
pub mod batcher;
