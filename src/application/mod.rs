// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// Coordinates the other layers to accomplish one goal each.
//
// Rules for this layer:
//   - No tensor math or module code here
//   - No printing here (that's Layer 1)
//   - Only workflow coordination

// The fine-tuning workflow
pub mod train_use_case;

// Generation with a saved adapter
pub mod generate_use_case;
