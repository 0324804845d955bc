// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// Everything that touches Burn modules or the optimiser:
//
//   model.rs      — GPT-2 style causal decoder with named sublayers
//   adapter.rs    — Low-rank adapter modules and injection
//   provider.rs   — Built-in model lookup table and cache
//   trainer.rs    — TrainingJob state machine and loop
//   inferencer.rs — Greedy text generation
//
// Reference: Burn Book §3 (Building Blocks), §5 (Training)

/// Causal decoder architecture
pub mod model;

/// LoRA adapter overlay, injection and re-attachment
pub mod adapter;

/// Resolves model names to base models and tokenizers
pub mod provider;

/// Training loop with checkpointing and cancellation
pub mod trainer;

/// Generation with an adapted model
pub mod inferencer;
