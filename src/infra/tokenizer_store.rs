// ============================================================
// Layer 6 — Tokenizer Store
// ============================================================
// Builds the tokenizer for a built-in model profile and wraps it
// with the pad / eos / max-length policy the pipeline needs.
//
// The built-in models use a GPT-2 style byte-level BPE vocabulary
// with no merges: 256 byte symbols plus <|endoftext|>. Any UTF-8
// text round-trips through it exactly. The tokenizer JSON is
// written out by hand and parsed by the tokenizers crate, which
// sidesteps the trainer type plumbing entirely.
//
// Like GPT-2, this vocabulary has no pad token. TextTokenizer
// substitutes the end-of-sequence token and logs that it did so.
//
// Reference: Radford et al. (2019) GPT-2, byte-level BPE

use std::fmt;
use std::str::FromStr;

use tokenizers::Tokenizer;

use crate::error::{FineTuneError, Result};

pub const EOS_TOKEN: &str = "<|endoftext|>";

const PAD_CANDIDATES: [&str; 3] = ["<pad>", "[PAD]", "<|pad|>"];

/// A tokenizer plus the special-token ids and length limit of its model.
#[derive(Clone)]
pub struct TextTokenizer {
    model:   String,
    inner:   Tokenizer,
    pad_id:  u32,
    eos_id:  u32,
    max_len: usize,
}

impl fmt::Debug for TextTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextTokenizer")
            .field("model", &self.model)
            .field("pad_id", &self.pad_id)
            .field("eos_id", &self.eos_id)
            .field("max_len", &self.max_len)
            .finish()
    }
}

impl TextTokenizer {
    /// Wrap a tokenizer, resolving its eos and pad tokens.
    ///
    /// If no pad token is defined the eos token is used for padding.
    pub fn new(model: impl Into<String>, inner: Tokenizer, max_len: usize) -> Result<Self> {
        let model = model.into();

        let eos_id = inner.token_to_id(EOS_TOKEN).ok_or_else(|| FineTuneError::Tokenizer {
            model:  model.clone(),
            reason: format!("vocabulary has no '{EOS_TOKEN}' token"),
        })?;

        let explicit_pad = inner
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| PAD_CANDIDATES.iter().find_map(|t| inner.token_to_id(t)));

        let pad_id = match explicit_pad {
            Some(id) => id,
            None => {
                tracing::warn!(
                    "Tokenizer for '{}' defines no pad token; padding with '{}' (id {})",
                    model,
                    EOS_TOKEN,
                    eos_id
                );
                eos_id
            }
        };

        Ok(Self { model, inner, pad_id, eos_id, max_len })
    }

    /// Encode text without special tokens, truncated to `max_len`.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .inner
            .encode(text, false)
            .map_err(|e| self.error(format!("cannot encode text: {e}")))?;
        let mut ids = enc.get_ids().to_vec();
        ids.truncate(self.max_len);
        Ok(ids)
    }

    /// Decode ids back to text, dropping special tokens.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| self.error(format!("cannot decode ids: {e}")))
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn error(&self, reason: String) -> FineTuneError {
        FineTuneError::Tokenizer { model: self.model.clone(), reason }
    }
}

// ─── Byte-level vocabulary ────────────────────────────────────────────────────

/// GPT-2's byte → printable character table. Printable Latin-1 bytes map
/// to themselves; the remaining 68 bytes map to code points from U+0100.
fn byte_level_alphabet() -> Vec<char> {
    let printable = |b: u32| {
        (u32::from('!')..=u32::from('~')).contains(&b)
            || (u32::from('¡')..=u32::from('¬')).contains(&b)
            || (u32::from('®')..=u32::from('ÿ')).contains(&b)
    };

    let mut shifted = 0u32;
    (0u32..256)
        .map(|b| {
            let code = if printable(b) {
                b
            } else {
                shifted += 1;
                255 + shifted
            };
            char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
        })
        .collect()
}

/// Build the byte-level tokenizer shared by the built-in model profiles.
/// Ids 0..=255 are bytes and id 256 is the end-of-sequence token.
pub fn build_byte_level(model: &str, max_len: usize) -> Result<TextTokenizer> {
    let mut vocab = serde_json::Map::new();
    for (id, ch) in byte_level_alphabet().into_iter().enumerate() {
        vocab.insert(ch.to_string(), serde_json::json!(id));
    }
    let eos_id = vocab.len();
    vocab.insert(EOS_TOKEN.to_string(), serde_json::json!(eos_id));

    let byte_level = serde_json::json!({
        "type": "ByteLevel",
        "add_prefix_space": false,
        "trim_offsets": true,
        "use_regex": true
    });

    let tokenizer_json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": eos_id, "content": EOS_TOKEN, "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": byte_level.clone(),
        "post_processor": null,
        "decoder": byte_level,
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": vocab,
            "merges": []
        }
    });

    let inner = Tokenizer::from_str(&tokenizer_json.to_string()).map_err(|e| {
        FineTuneError::Tokenizer {
            model:  model.to_string(),
            reason: format!("cannot build byte-level tokenizer: {e}"),
        }
    })?;

    tracing::debug!("Built byte-level tokenizer for '{}' ({} tokens)", model, eos_id + 1);
    TextTokenizer::new(model, inner, max_len)
}
