// ============================================================
// Layer 5 — Sequence Model Provider
// ============================================================
// Resolves a model name to a base model and its tokenizer.
//
// Models come from a built-in lookup table. Weights are generated
// from each profile's fixed seed, so "tiny-gpt2" is the same model
// on every machine and in every run. The tokenizer is the shared
// byte-level BPE (256 byte symbols + <|endoftext|>).
//
// Loaded models are cached per provider; a second load() of the
// same name returns a clone of the cached pair.

use std::collections::HashMap;

use burn::prelude::*;

use crate::error::{FineTuneError, Result};
use crate::infra::tokenizer_store::{build_byte_level, TextTokenizer};
use crate::ml::model::{BaseModel, SequenceModelConfig};

pub const DEFAULT_MODEL: &str = "tiny-gpt2";

/// Shape of one built-in model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProfile {
    pub name:        &'static str,
    pub d_model:     usize,
    pub num_heads:   usize,
    pub num_layers:  usize,
    pub d_ff:        usize,
    pub max_seq_len: usize,
    pub seed:        u64,
}

pub const BUILTIN_MODELS: [ModelProfile; 2] = [
    ModelProfile {
        name:        "tiny-gpt2",
        d_model:     32,
        num_heads:   4,
        num_layers:  2,
        d_ff:        128,
        max_seq_len: 128,
        seed:        2019,
    },
    ModelProfile {
        name:        "tiny-gpt2-medium",
        d_model:     64,
        num_heads:   4,
        num_layers:  4,
        d_ff:        256,
        max_seq_len: 256,
        seed:        2020,
    },
];

/// Find a built-in profile by name.
pub fn lookup(name: &str) -> Result<&'static ModelProfile> {
    BUILTIN_MODELS
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| FineTuneError::ModelNotFound {
            name:  name.to_string(),
            known: BUILTIN_MODELS.iter().map(|p| p.name).collect::<Vec<_>>().join(", "),
        })
}

pub struct SequenceModelProvider<B: Backend> {
    device: B::Device,
    cache:  HashMap<String, (BaseModel<B>, TextTokenizer)>,
}

impl<B: Backend> SequenceModelProvider<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device, cache: HashMap::new() }
    }

    /// Load the named model and its tokenizer.
    pub fn load(&mut self, name: &str) -> Result<(BaseModel<B>, TextTokenizer)> {
        if let Some(cached) = self.cache.get(name) {
            tracing::debug!("Model '{}' served from cache", name);
            return Ok(cached.clone());
        }

        let profile   = lookup(name)?;
        let tokenizer = build_byte_level(profile.name, profile.max_seq_len)?;
        let config = SequenceModelConfig::new(
            tokenizer.vocab_size(),
            profile.max_seq_len,
            profile.d_model,
            profile.num_heads,
            profile.num_layers,
            profile.d_ff,
        )
        .with_seed(profile.seed);

        let model = BaseModel::new(profile.name, config.clone(), config.init(&self.device));
        tracing::info!(
            "Loaded base model '{}': {} layers, d_model={}, {} params",
            profile.name,
            profile.num_layers,
            profile.d_model,
            model.num_params()
        );

        self.cache.insert(name.to_string(), (model.clone(), tokenizer.clone()));
        Ok((model, tokenizer))
    }
}
