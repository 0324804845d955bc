// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types describing the fine-tuning problem:
// what an example is, how an adapter is shaped, and how a
// training run is configured. No tensors and no file I/O here.

// Instruction/response pairs and the dataset that holds them
pub mod example;

// Declarative low-rank adapter description
pub mod adapter_spec;

// Epoch, batch and checkpoint cadence settings
pub mod training_config;

// Abstractions implemented by the data and ml layers
pub mod traits;
