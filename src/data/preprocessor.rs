// ============================================================
// Layer 4 — Dataset Preprocessor
// ============================================================
// Turns a Dataset into a lazy, restartable sequence of padded
// token batches.
//
// For each batch:
//   1. Take the next `batch_size` example indices (file order,
//      or a fixed permutation when a shuffle seed is set)
//   2. Render each example with the instruction/response template
//   3. Encode, truncating to the tokenizer's max length
//   4. Pad every row to the longest row IN THIS BATCH with the
//      pad id and build the matching attention mask
//
// Nothing is tokenised until a batch is requested. Calling iter()
// again restarts from the first batch and yields identical output.
// The final batch may be shorter than batch_size; it is kept.

use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::domain::example::Dataset;
use crate::error::{FineTuneError, Result};
use crate::infra::tokenizer_store::TextTokenizer;

/// A group of token sequences padded to a common length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedBatch {
    /// Dataset positions of the rows, in row order
    pub indices:        Vec<usize>,
    /// Token ids, one row per example, all of length seq_len()
    pub input_ids:      Vec<Vec<u32>>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<Vec<u32>>,
}

impl TokenizedBatch {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map_or(0, Vec::len)
    }
}

/// The lazily tokenised view of a Dataset.
#[derive(Debug, Clone)]
pub struct TokenizedBatches {
    dataset:    Arc<Dataset>,
    tokenizer:  TextTokenizer,
    batch_size: usize,
    order:      Vec<usize>,
}

/// Split `dataset` into batches of `batch_size` examples, in file order.
pub fn tokenize(
    dataset:    Arc<Dataset>,
    tokenizer:  TextTokenizer,
    batch_size: usize,
) -> Result<TokenizedBatches> {
    if batch_size == 0 {
        return Err(FineTuneError::InvalidConfig(
            "batch size must be a positive integer".into(),
        ));
    }
    let order = (0..dataset.len()).collect();
    Ok(TokenizedBatches { dataset, tokenizer, batch_size, order })
}

impl TokenizedBatches {
    /// Replace file order with one seeded permutation. The same seed
    /// always gives the same batches.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        tracing::debug!("Shuffled {} examples with seed {}", self.order.len(), seed);
        self
    }

    /// Number of batches, counting a final partial one.
    pub fn len(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    /// Tokenise batch number `index`.
    pub fn batch(&self, index: usize) -> Result<TokenizedBatch> {
        let start = index * self.batch_size;
        let end   = (start + self.batch_size).min(self.order.len());
        let indices: Vec<usize> = self.order.get(start..end).unwrap_or_default().to_vec();

        let mut rows = Vec::with_capacity(indices.len());
        for &i in &indices {
            // Indices come from 0..dataset.len(), so the lookup cannot miss
            if let Some(example) = self.dataset.get(i) {
                rows.push(self.tokenizer.encode(&example.render())?);
            }
        }

        Ok(pad_rows(indices, rows, self.tokenizer.pad_id()))
    }

    /// Iterate the batches from the beginning.
    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter { batches: self, next: 0 }
    }
}

/// Pad every row to the longest one and build the attention mask.
fn pad_rows(indices: Vec<usize>, rows: Vec<Vec<u32>>, pad_id: u32) -> TokenizedBatch {
    let seq_len = rows.iter().map(Vec::len).max().unwrap_or(0);

    let mut input_ids      = Vec::with_capacity(rows.len());
    let mut attention_mask = Vec::with_capacity(rows.len());

    for mut row in rows {
        let real = row.len();
        let mut mask = vec![1u32; real];
        row.resize(seq_len, pad_id);
        mask.resize(seq_len, 0);
        input_ids.push(row);
        attention_mask.push(mask);
    }

    TokenizedBatch { indices, input_ids, attention_mask }
}

/// Iterator over the batches of a TokenizedBatches, in order.
pub struct BatchIter<'a> {
    batches: &'a TokenizedBatches,
    next:    usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<TokenizedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.batches.len() {
            return None;
        }
        let batch = self.batches.batch(self.next);
        self.next += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.batches.len().saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for BatchIter<'_> {}

impl<'a> IntoIterator for &'a TokenizedBatches {
    type Item     = Result<TokenizedBatch>;
    type IntoIter = BatchIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::example::Example;
    use crate::infra::tokenizer_store::build_byte_level;

    fn scenario_dataset() -> Arc<Dataset> {
        Arc::new(Dataset::new(
            "train.jsonl",
            vec![
                Example::new("2+2?", "4"),
                Example::new("Capital of France?", "Paris"),
            ],
        ))
    }

    fn tokenizer() -> TextTokenizer {
        build_byte_level("tiny-gpt2", 128).unwrap()
    }

    #[test]
    fn test_batch_size_one_yields_one_batch_per_example_in_order() {
        let batches = tokenize(scenario_dataset(), tokenizer(), 1).unwrap();
        let all: Vec<TokenizedBatch> = batches.iter().collect::<Result<_>>().unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(all[0].indices, vec![0]);
        assert_eq!(all[1].indices, vec![1]);

        let tok = tokenizer();
        let expected = tok.encode("Instruction: 2+2?\nResponse: 4").unwrap();
        assert_eq!(all[0].input_ids[0], expected);
    }

    #[test]
    fn test_pads_to_longest_row_in_batch() {
        let batches = tokenize(scenario_dataset(), tokenizer(), 2).unwrap();
        let batch = batches.batch(0).unwrap();
        let short = "Instruction: 2+2?\nResponse: 4".len();
        let long  = "Instruction: Capital of France?\nResponse: Paris".len();

        assert_eq!(batch.seq_len(), long);
        assert_eq!(batch.attention_mask[0].iter().sum::<u32>() as usize, short);
        assert_eq!(batch.attention_mask[1].iter().sum::<u32>() as usize, long);
        assert_eq!(batch.input_ids[0][short], tokenizer().pad_id());
    }

    #[test]
    fn test_keeps_final_partial_batch() {
        let ds = Arc::new(Dataset::new(
            "x",
            (0..5).map(|i| Example::new(format!("q{i}"), "a")).collect(),
        ));
        let batches = tokenize(ds, tokenizer(), 2).unwrap();
        assert_eq!(batches.len(), 3);
        let last = batches.batch(2).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last.indices, vec![4]);
    }

    #[test]
    fn test_iteration_is_deterministic_and_restartable() {
        let batches = tokenize(scenario_dataset(), tokenizer(), 1).unwrap();
        let first:  Vec<TokenizedBatch> = batches.iter().collect::<Result<_>>().unwrap();
        let second: Vec<TokenizedBatch> = batches.iter().collect::<Result<_>>().unwrap();
        assert_eq!(first, second);

        let again = tokenize(scenario_dataset(), tokenizer(), 1).unwrap();
        let third: Vec<TokenizedBatch> = again.iter().collect::<Result<_>>().unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_same_shuffle_seed_gives_same_order() {
        let ds = Arc::new(Dataset::new(
            "x",
            (0..20).map(|i| Example::new(format!("q{i}"), "a")).collect(),
        ));
        let a = tokenize(ds.clone(), tokenizer(), 3).unwrap().with_shuffle(7);
        let b = tokenize(ds, tokenizer(), 3).unwrap().with_shuffle(7);
        let ia: Vec<Vec<usize>> = a.iter().map(|r| r.unwrap().indices).collect();
        let ib: Vec<Vec<usize>> = b.iter().map(|r| r.unwrap().indices).collect();
        assert_eq!(ia, ib);
        assert_eq!(ia.iter().map(Vec::len).sum::<usize>(), 20);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(tokenize(scenario_dataset(), tokenizer(), 0).is_err());
    }

    #[test]
    fn test_empty_dataset_has_no_batches() {
        let ds = Arc::new(Dataset::new("empty.jsonl", Vec::new()));
        let batches = tokenize(ds, tokenizer(), 4).unwrap();
        assert!(batches.is_empty());
        assert_eq!(batches.iter().count(), 0);
    }
}
