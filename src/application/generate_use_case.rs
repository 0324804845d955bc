// ============================================================
// Layer 2 — Generate Use Case
// ============================================================
// Rebuilds a fine-tuned model from its output directory and
// answers prompts with it:
//
//   1. Load the newest adapter checkpoint
//   2. Load the base model named in the checkpoint
//   3. Re-attach the saved adapter
//   4. Greedy-decode the response

use std::path::Path;

use burn::prelude::*;

use crate::domain::traits::TextGenerator;
use crate::error::Result;
use crate::infra::checkpoint::CheckpointStore;
use crate::ml::{adapter::reattach, inferencer::Generator, provider::SequenceModelProvider};

pub struct GenerateUseCase<B: Backend> {
    generator: Generator<B>,
}

impl<B: Backend> GenerateUseCase<B> {
    pub fn new(adapter_dir: &Path, max_new_tokens: usize, device: B::Device) -> Result<Self> {
        let weights = CheckpointStore::new(adapter_dir).load_latest::<B>(&device)?;

        let mut provider = SequenceModelProvider::<B>::new(device);
        let (base, tokenizer) = provider.load(&weights.checkpoint.base_model)?;
        let model = reattach(base, weights)?;

        Ok(Self {
            generator: Generator::new(model, tokenizer, max_new_tokens),
        })
    }
}

impl<B: Backend> TextGenerator for GenerateUseCase<B> {
    fn generate(&self, prompt: &str) -> Result<String> {
        self.generator.generate(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    use crate::domain::adapter_spec::AdapterSpec;
    use crate::error::FineTuneError;
    use crate::infra::checkpoint::{CheckpointKind, SavePoint};
    use crate::ml::adapter::inject;
    use crate::ml::provider::DEFAULT_MODEL;

    #[test]
    fn test_reloaded_adapter_generates_the_same_text() {
        let tmp = tempfile::tempdir().unwrap();
        let mut provider = SequenceModelProvider::<NdArray>::new(Default::default());
        let (base, tokenizer) = provider.load(DEFAULT_MODEL).unwrap();
        let model = inject(base, &AdapterSpec::default()).unwrap();

        CheckpointStore::new(tmp.path())
            .save(&model, CheckpointKind::Completed, SavePoint { step: 1, epoch: 0 })
            .unwrap();

        let before = Generator::new(model, tokenizer, 6).generate("2+2?").unwrap();
        let reloaded = GenerateUseCase::<NdArray>::new(tmp.path(), 6, Default::default())
            .unwrap()
            .generate("2+2?")
            .unwrap();
        assert_eq!(before, reloaded);
    }

    #[test]
    fn test_missing_output_dir_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = GenerateUseCase::<NdArray>::new(&tmp.path().join("none"), 4, Default::default())
            .err()
            .unwrap();
        assert!(matches!(err, FineTuneError::CheckpointNotFound { .. }));
    }
}
