// ============================================================
// Layer 4 — Language-Model Batcher
// ============================================================
// Converts a TokenizedBatch into tensors on the target device.
//
//   Input:  N rows of token ids, each already padded to length S
//   Output: LmBatch with input_ids and attention_mask of shape [N, S]
//
// The rows are flattened into one Vec<i32> and reshaped, the same
// way for ids and mask. Labels are not stored separately: for a
// causal language model the targets are the inputs shifted by one.

use burn::prelude::*;

use crate::data::preprocessor::TokenizedBatch;

/// A batch ready for the model forward pass.
#[derive(Debug, Clone)]
pub struct LmBatch<B: Backend> {
    /// Token ids — shape: [batch_size, seq_len]
    pub input_ids: Tensor<B, 2, Int>,

    /// 1 = real token, 0 = padding — shape: [batch_size, seq_len]
    pub attention_mask: Tensor<B, 2, Int>,

    /// Host-side copy of the mask, used to build the attention bias
    pub mask_rows: Vec<Vec<u32>>,
}

#[derive(Clone, Debug)]
pub struct LmBatcher<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> LmBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    pub fn batch(&self, batch: &TokenizedBatch) -> LmBatch<B> {
        let batch_size = batch.len();
        let seq_len    = batch.seq_len();

        let input_flat: Vec<i32> = batch
            .input_ids
            .iter()
            .flat_map(|row| row.iter().map(|&x| x as i32))
            .collect();

        let mask_flat: Vec<i32> = batch
            .attention_mask
            .iter()
            .flat_map(|row| row.iter().map(|&x| x as i32))
            .collect();

        let input_ids = Tensor::<B, 1, Int>::from_ints(input_flat.as_slice(), &self.device)
            .reshape([batch_size, seq_len]);

        let attention_mask = Tensor::<B, 1, Int>::from_ints(mask_flat.as_slice(), &self.device)
            .reshape([batch_size, seq_len]);

        LmBatch {
            input_ids,
            attention_mask,
            mask_rows: batch.attention_mask.clone(),
        }
    }
}
