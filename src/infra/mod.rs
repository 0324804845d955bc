// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Cross-cutting concerns used by several layers:
//
//   checkpoint.rs      — Adapter checkpoints on disk
//                        Staged, atomic saves; retention; reload
//                        of the latest checkpoint for generation.
//
//   tokenizer_store.rs — Byte-level BPE tokenizer
//                        Built in-process from the GPT-2 byte
//                        alphabet, with pad and EOS resolution.
//
//   metrics.rs         — Progress CSV
//                        One row per logged training step.
//
// Reference: Burn Book §5 (Checkpointing)

/// Adapter checkpoint store
pub mod checkpoint;

/// Byte-level tokenizer construction and encoding
pub mod tokenizer_store;

/// Training metrics CSV logger
pub mod metrics;
