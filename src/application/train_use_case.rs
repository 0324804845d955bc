// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates one fine-tuning run in order:
//
//   Step 1: Validate the configuration
//   Step 2: Load the base model + tokenizer   (Layer 5 - ml)
//   Step 3: Inject the adapter                (Layer 5 - ml)
//   Step 4: Load the JSONL dataset            (Layer 4 - data)
//   Step 5: Tokenise into batches             (Layer 4 - data)
//   Step 6: Build the job                     (Layer 5 - ml)
//   Step 7: Save the run config               (Layer 6 - infra)
//   Step 8: Run the training loop             (Layer 5 - ml)
//
// Model and adapter problems surface before the dataset is read,
// so a bad target name never costs a dataset load.

use std::path::PathBuf;
use std::sync::Arc;

use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::data::{loader::JsonlLoader, preprocessor::tokenize};
use crate::domain::{adapter_spec::AdapterSpec, training_config::TrainingConfig, traits::ExampleSource};
use crate::error::Result;
use crate::infra::{checkpoint::CheckpointStore, metrics::MetricsLogger};
use crate::ml::{
    adapter::inject,
    provider::{SequenceModelProvider, DEFAULT_MODEL},
    trainer::{CancellationToken, JobReport, TrainingJob},
};

// ─── Run Configuration ───────────────────────────────────────────────────────
// Everything needed to reproduce a run. Written to
// <output_dir>/training_config.json before the first step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub base_model: String,
    pub data_path:  PathBuf,
    pub training:   TrainingConfig,
    pub adapter:    AdapterSpec,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            base_model: DEFAULT_MODEL.to_string(),
            data_path:  PathBuf::from("train.jsonl"),
            training:   TrainingConfig::default(),
            adapter:    AdapterSpec::default(),
        }
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
    cancel: CancellationToken,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config, cancel: CancellationToken::new() }
    }

    /// Stop the run at the next batch boundary when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Execute the full pipeline on `device`.
    pub fn execute<B: AutodiffBackend>(&self, device: B::Device) -> Result<JobReport> {
        let cfg = &self.config;

        // ── Step 1: Validate ─────────────────────────────────────────────────
        cfg.training.validate()?;
        cfg.adapter.validate()?;

        // ── Step 2: Base model ───────────────────────────────────────────────
        let mut provider = SequenceModelProvider::<B>::new(device);
        let (base, tokenizer) = provider.load(&cfg.base_model)?;

        // ── Step 3: Adapter ──────────────────────────────────────────────────
        let model = inject(base, &cfg.adapter)?;
        tracing::info!(
            "Trainable parameters: {} of {} ({:.3}%)",
            model.trainable_params(),
            model.total_params(),
            100.0 * model.trainable_params() as f64 / model.total_params() as f64
        );

        // ── Step 4: Dataset ──────────────────────────────────────────────────
        let dataset = JsonlLoader::new(&cfg.data_path).load()?;

        // ── Step 5: Batches ──────────────────────────────────────────────────
        let mut batches = tokenize(Arc::new(dataset), tokenizer, cfg.training.batch_size)?;
        if let Some(seed) = cfg.training.shuffle_seed {
            batches = batches.with_shuffle(seed);
        }

        // ── Step 6: Job ──────────────────────────────────────────────────────
        // EmptyDataset is raised here, before anything is written
        let store = CheckpointStore::new(&cfg.training.output_dir)
            .with_retention(cfg.training.retention);
        let job = TrainingJob::new(cfg.training.clone(), model, batches, store)?
            .with_cancellation(self.cancel.clone());

        // ── Step 7: Run config ───────────────────────────────────────────────
        CheckpointStore::new(&cfg.training.output_dir).save_config(cfg)?;
        let mut job = match MetricsLogger::new(&cfg.training.output_dir) {
            Ok(metrics) => job.with_metrics(metrics),
            Err(e) => {
                tracing::warn!("Metrics CSV disabled: {:#}", e);
                job
            }
        };

        // ── Step 8: Train ────────────────────────────────────────────────────
        job.run()
    }
}
