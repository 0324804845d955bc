// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the two subcommands, `train` and `generate`, and all
// their flags.
//
// Reference: Rust Book §12 (Building a CLI Program)

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::application::train_use_case::TrainConfig;
use crate::domain::{
    adapter_spec::{AdapterSpec, BiasMode},
    training_config::TrainingConfig,
};
use crate::ml::inferencer::DEFAULT_MAX_NEW_TOKENS;
use crate::ml::provider::DEFAULT_MODEL;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fine-tune a low-rank adapter on a JSONL instruction dataset
    Train(TrainArgs),

    /// Generate a response with a fine-tuned adapter
    Generate(GenerateArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// JSONL file with "instruction" and "response" fields
    #[arg(long)]
    pub data: PathBuf,

    /// Name of the base model to adapt
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub base_model: String,

    /// Where checkpoints, metrics and the run config are written
    #[arg(long, default_value = "fine_tune/output")]
    pub output_dir: PathBuf,

    #[arg(long, default_value_t = 4)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1)]
    pub epochs: usize,

    /// Peak learning rate; decays linearly to zero
    #[arg(long, default_value_t = 5e-5)]
    pub lr: f64,

    /// Report progress every N steps (0 = never)
    #[arg(long, default_value_t = 10)]
    pub logging_steps: usize,

    /// Save an interval checkpoint every N steps (0 = never)
    #[arg(long, default_value_t = 100)]
    pub save_steps: usize,

    /// How many interval checkpoints to keep
    #[arg(long, default_value_t = 2)]
    pub save_total_limit: usize,

    /// Adapter rank
    #[arg(long, default_value_t = 8)]
    pub rank: usize,

    #[arg(long, default_value_t = 32.0)]
    pub alpha: f64,

    /// Comma-separated sublayer names, matched exactly or by suffix
    #[arg(long, value_delimiter = ',', default_value = "c_attn,c_proj")]
    pub target_modules: Vec<String>,

    #[arg(long, default_value_t = 0.05)]
    pub lora_dropout: f64,

    /// none, all or lora_only
    #[arg(long, default_value = "none")]
    pub bias: BiasMode,

    /// Seed for the adapter initialisation
    #[arg(long, default_value_t = 42)]
    pub init_seed: u64,

    /// Shuffle the examples once with this seed
    #[arg(long)]
    pub shuffle_seed: Option<u64>,
}

/// The application layer never sees clap types.
impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            base_model: a.base_model,
            data_path:  a.data,
            training: TrainingConfig {
                output_dir:          a.output_dir,
                batch_size:          a.batch_size,
                epochs:              a.epochs,
                learning_rate:       a.lr,
                logging_interval:    a.logging_steps,
                checkpoint_interval: a.save_steps,
                retention:           a.save_total_limit,
                shuffle_seed:        a.shuffle_seed,
            },
            adapter: AdapterSpec {
                rank:           a.rank,
                alpha:          a.alpha,
                target_modules: a.target_modules,
                dropout:        a.lora_dropout,
                bias:           a.bias,
                init_seed:      a.init_seed,
            },
        }
    }
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// The instruction to respond to
    #[arg(long)]
    pub prompt: String,

    /// Output directory of a training run, or one checkpoint inside it
    #[arg(long, default_value = "fine_tune/output")]
    pub adapter_dir: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MAX_NEW_TOKENS)]
    pub max_new_tokens: usize,
}
