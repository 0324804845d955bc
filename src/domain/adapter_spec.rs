// ============================================================
// Layer 3 — AdapterSpec Domain Type
// ============================================================
// Declarative description of a low-rank adapter (LoRA).
//
// For a targeted projection W (d_in × d_out) the adapter adds
//
//   y = x·W + b  +  (alpha / rank) · dropout(x)·A·B  [+ Δb]
//
// where A is d_in × rank and B is rank × d_out. Only A, B and the
// optional bias deltas Δb are trained; W and b stay frozen.
//
// The spec is immutable once a TrainingJob starts: the adapted
// model owns it and hands out shared references only.
//
// Reference: Hu et al. (2021) LoRA: Low-Rank Adaptation of
//            Large Language Models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FineTuneError, Result};

/// Which biases become trainable alongside the low-rank matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasMode {
    /// No bias is trained.
    None,
    /// Every projection sublayer in the model gets a trainable bias delta.
    All,
    /// Only the targeted sublayers get a trainable bias delta.
    LoraOnly,
}

impl fmt::Display for BiasMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BiasMode::None     => "none",
            BiasMode::All      => "all",
            BiasMode::LoraOnly => "lora_only",
        };
        f.write_str(s)
    }
}

impl FromStr for BiasMode {
    type Err = FineTuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none"                    => Ok(BiasMode::None),
            "all"                     => Ok(BiasMode::All),
            "lora_only" | "lora-only" => Ok(BiasMode::LoraOnly),
            other => Err(FineTuneError::InvalidConfig(format!(
                "unknown bias mode '{other}' (expected none, all or lora_only)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    /// Inner dimension of the A·B factorisation
    pub rank: usize,

    /// Scaling numerator; the update is multiplied by alpha / rank
    pub alpha: f64,

    /// Sublayer names to augment. A name matches a qualified sublayer
    /// either exactly or as a dot-separated suffix ("c_proj" matches
    /// "h.0.attn.c_proj" and "h.0.mlp.c_proj").
    pub target_modules: Vec<String>,

    /// Dropout probability applied to the adapter input, in [0, 1)
    pub dropout: f64,

    pub bias: BiasMode,

    /// Seed for the A-matrix initialisation
    pub init_seed: u64,
}

impl Default for AdapterSpec {
    fn default() -> Self {
        Self {
            rank:           8,
            alpha:          32.0,
            target_modules: vec!["c_attn".to_string(), "c_proj".to_string()],
            dropout:        0.05,
            bias:           BiasMode::None,
            init_seed:      42,
        }
    }
}

impl AdapterSpec {
    /// The factor applied to the low-rank update.
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    /// Check the values that do not depend on the base model.
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(FineTuneError::InvalidConfig(
                "adapter rank must be a positive integer".into(),
            ));
        }
        if !self.alpha.is_finite() || self.alpha <= 0.0 {
            return Err(FineTuneError::InvalidConfig(format!(
                "adapter alpha must be positive, got {}",
                self.alpha
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(FineTuneError::InvalidConfig(format!(
                "adapter dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.target_modules.is_empty() {
            return Err(FineTuneError::InvalidConfig(
                "adapter needs at least one target sublayer".into(),
            ));
        }
        Ok(())
    }

    /// Does `target` select the qualified sublayer `name`?
    pub fn target_matches(target: &str, name: &str) -> bool {
        name == target
            || name
                .strip_suffix(target)
                .map_or(false, |head| head.ends_with('.'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_reference_adapter() {
        let spec = AdapterSpec::default();
        assert_eq!(spec.rank, 8);
        assert_eq!(spec.scaling(), 4.0);
        assert_eq!(spec.bias, BiasMode::None);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_zero_rank_rejected() {
        let spec = AdapterSpec { rank: 0, ..AdapterSpec::default() };
        assert!(matches!(spec.validate(), Err(FineTuneError::InvalidConfig(_))));
    }

    #[test]
    fn test_dropout_out_of_range_rejected() {
        let spec = AdapterSpec { dropout: 1.0, ..AdapterSpec::default() };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_suffix_matching_respects_dot_boundary() {
        assert!(AdapterSpec::target_matches("c_proj", "h.0.attn.c_proj"));
        assert!(AdapterSpec::target_matches("attn.c_proj", "h.1.attn.c_proj"));
        assert!(AdapterSpec::target_matches("h.0.mlp.c_fc", "h.0.mlp.c_fc"));
        assert!(!AdapterSpec::target_matches("proj", "h.0.attn.c_proj"));
        assert!(!AdapterSpec::target_matches("q_proj", "h.0.attn.c_proj"));
    }

    #[test]
    fn test_bias_mode_parsing() {
        assert_eq!("lora_only".parse::<BiasMode>().ok(), Some(BiasMode::LoraOnly));
        assert_eq!("all".parse::<BiasMode>().ok(), Some(BiasMode::All));
        assert!("some".parse::<BiasMode>().is_err());
    }

    #[test]
    fn test_serialises_with_snake_case_bias() {
        let spec = AdapterSpec { bias: BiasMode::LoraOnly, ..AdapterSpec::default() };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"lora_only\""));
        let back: AdapterSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
