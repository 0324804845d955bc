// ============================================================
// Layer 5 — Generator
// ============================================================
// Greedy decoding with an adapted model.
//
//   1. Render "Instruction: {prompt}\nResponse:"
//   2. Encode, run the model, take argmax of the last position
//   3. Append and repeat until <|endoftext|>, max_new_tokens,
//      or the model's context length
//   4. Decode only the generated tokens

use burn::prelude::*;

use crate::domain::example::render_prompt;
use crate::domain::traits::TextGenerator;
use crate::error::Result;
use crate::infra::tokenizer_store::TextTokenizer;
use crate::ml::adapter::AdaptedModel;

pub const DEFAULT_MAX_NEW_TOKENS: usize = 32;

pub struct Generator<B: Backend> {
    model:          AdaptedModel<B>,
    tokenizer:      TextTokenizer,
    max_new_tokens: usize,
}

impl<B: Backend> Generator<B> {
    pub fn new(model: AdaptedModel<B>, tokenizer: TextTokenizer, max_new_tokens: usize) -> Self {
        Self { model, tokenizer, max_new_tokens }
    }

    /// Token ids produced after the prompt, EOS excluded.
    pub fn generate_ids(&self, prompt: &str) -> Result<Vec<u32>> {
        let device = self.model.device();
        let mut ids = self.tokenizer.encode(&render_prompt(prompt))?;
        let prompt_len = ids.len();
        let limit = self.tokenizer.max_len().min(self.model.base().config.max_seq_len);

        for _ in 0..self.max_new_tokens {
            if ids.is_empty() || ids.len() >= limit {
                break;
            }
            let seq = ids.len();
            let flat: Vec<i32> = ids.iter().map(|&x| x as i32).collect();
            let input = Tensor::<B, 1, Int>::from_ints(flat.as_slice(), &device).reshape([1, seq]);

            let logits = self.model.forward(input, &[vec![1; seq]]); // [1, seq, vocab]
            let [_, _, vocab] = logits.dims();
            let last = logits.slice([0..1, seq - 1..seq, 0..vocab]).reshape([vocab]);
            let next = last.argmax(0).into_scalar().elem::<i64>() as u32;

            if next == self.tokenizer.eos_id() {
                break;
            }
            ids.push(next);
        }

        Ok(ids.split_off(prompt_len))
    }
}

impl<B: Backend> TextGenerator for Generator<B> {
    fn generate(&self, prompt: &str) -> Result<String> {
        let generated = self.generate_ids(prompt)?;
        let text = self.tokenizer.decode(&generated)?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::adapter_spec::AdapterSpec;
    use crate::ml::adapter::inject;
    use crate::ml::provider::{SequenceModelProvider, DEFAULT_MODEL};
    use burn::backend::NdArray;

    fn generator(max_new_tokens: usize) -> Generator<NdArray> {
        let mut provider = SequenceModelProvider::<NdArray>::new(Default::default());
        let (base, tokenizer) = provider.load(DEFAULT_MODEL).unwrap();
        let model = inject(base, &AdapterSpec::default()).unwrap();
        Generator::new(model, tokenizer, max_new_tokens)
    }

    #[test]
    fn test_respects_max_new_tokens() {
        let ids = generator(5).generate_ids("2+2?").unwrap();
        assert!(ids.len() <= 5);
    }

    #[test]
    fn test_decoding_is_deterministic() {
        let g = generator(8);
        assert_eq!(g.generate("Capital of France?").unwrap(), g.generate("Capital of France?").unwrap());
    }

    #[test]
    fn test_zero_budget_generates_nothing() {
        assert_eq!(generator(0).generate("hi").unwrap(), "");
    }
}
