// ============================================================
// Layer 5 — Training Job
// ============================================================
// Drives the optimisation loop over an adapted model.
//
// Lifecycle:
//
//   Initialized ──run()──▶ Running ──▶ Completed
//                                  ├──▶ Cancelled  (token set between batches)
//                                  └──▶ Failed     (non-finite loss, I/O fault)
//
// Per batch:
//   1. Forward through base + adapter overlay
//   2. Shifted next-token cross-entropy, padding ignored
//   3. Backward, Adam step on the adapter ONLY
//   4. Progress event every `logging_interval` steps
//   5. Interval checkpoint every `checkpoint_interval` steps
//   6. Check the cancellation token, unless that was the last batch
//
// A final checkpoint is always written when the loop stops on its
// own or on cancellation. A job runs once; a second run() is an
// InvalidState error.
//
// Reference: Kingma & Ba (2015) Adam

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use burn::{
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::data::{batcher::LmBatcher, preprocessor::{TokenizedBatch, TokenizedBatches}};
use crate::domain::training_config::TrainingConfig;
use crate::error::{FineTuneError, Result};
use crate::infra::checkpoint::{Checkpoint, CheckpointKind, CheckpointStore, SavePoint};
use crate::infra::metrics::{MetricsLogger, ProgressEvent};
use crate::ml::adapter::{AdaptedModel, LoraAdapter};
use crate::ml::model::lm_loss;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Initialized,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// Shared stop flag. Clone it into a signal handler and call cancel().
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Loop counters. Owned by the job and only touched from the loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    /// 0-based epoch currently running
    pub epoch:           usize,
    /// Optimizer steps taken so far
    pub step:            usize,
    pub cumulative_loss: f64,
}

impl TrainingState {
    pub fn average_loss(&self) -> f64 {
        if self.step == 0 {
            0.0
        } else {
            self.cumulative_loss / self.step as f64
        }
    }
}

/// What a finished run hands back.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub state:            JobState,
    pub steps:            usize,
    pub epochs_completed: usize,
    pub average_loss:     f64,
    pub progress:         Vec<ProgressEvent>,
    pub final_checkpoint: Checkpoint,
}

enum LoopEnd {
    Finished,
    Cancelled { epochs_completed: usize },
}

pub struct TrainingJob<B: AutodiffBackend> {
    config:  TrainingConfig,
    model:   AdaptedModel<B>,
    batches: TokenizedBatches,
    store:   CheckpointStore,
    metrics: Option<MetricsLogger>,
    cancel:  CancellationToken,
    state:   JobState,
}

impl<B: AutodiffBackend> TrainingJob<B> {
    /// Errors with EmptyDataset when there is nothing to train on.
    pub fn new(
        config:  TrainingConfig,
        model:   AdaptedModel<B>,
        batches: TokenizedBatches,
        store:   CheckpointStore,
    ) -> Result<Self> {
        config.validate()?;
        if batches.is_empty() {
            return Err(FineTuneError::EmptyDataset {
                path: batches.dataset().source().to_path_buf(),
            });
        }
        Ok(Self {
            config,
            model,
            batches,
            store,
            metrics: None,
            cancel: CancellationToken::new(),
            state: JobState::Initialized,
        })
    }

    pub fn with_metrics(mut self, metrics: MetricsLogger) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn model(&self) -> &AdaptedModel<B> {
        &self.model
    }

    pub fn into_model(self) -> AdaptedModel<B> {
        self.model
    }

    pub fn total_steps(&self) -> usize {
        self.config.epochs * self.batches.len()
    }

    /// Linear decay from the configured rate towards zero.
    pub fn learning_rate_at(&self, step: usize) -> f64 {
        let total = self.total_steps().max(1) as f64;
        self.config.learning_rate * (1.0 - step as f64 / total)
    }

    /// Run the loop to a terminal state.
    pub fn run(&mut self) -> Result<JobReport> {
        if self.state != JobState::Initialized {
            return Err(FineTuneError::InvalidState { state: self.state });
        }
        self.state = JobState::Running;

        tracing::info!(
            "Training '{}': {} examples, {} batches/epoch, {} epochs, {} trainable params",
            self.model.base_model_name(),
            self.batches.dataset().len(),
            self.batches.len(),
            self.config.epochs,
            self.model.trainable_params()
        );

        let mut optim    = AdamConfig::new().with_epsilon(1e-8).init::<B, LoraAdapter<B>>();
        let mut state    = TrainingState::default();
        let mut progress = Vec::new();

        let end = match self.run_epochs(&mut optim, &mut state, &mut progress) {
            Ok(end) => end,
            Err(e) => {
                self.state = JobState::Failed;
                tracing::error!("Training failed: {}", e);
                return Err(e);
            }
        };

        let (kind, terminal) = match end {
            LoopEnd::Finished         => (CheckpointKind::Completed, JobState::Completed),
            LoopEnd::Cancelled { .. } => (CheckpointKind::Cancelled, JobState::Cancelled),
        };

        let at = SavePoint { step: state.step, epoch: state.epoch };
        let saved = self
            .store
            .save(&self.model, kind, at)
            .and_then(|ckpt| self.store.enforce_retention().map(|_| ckpt));
        let final_checkpoint = match saved {
            Ok(ckpt) => ckpt,
            Err(e) => {
                self.state = JobState::Failed;
                tracing::error!("Final checkpoint failed: {}", e);
                return Err(e);
            }
        };

        self.state = terminal;
        let epochs_completed = match end {
            LoopEnd::Finished                       => self.config.epochs,
            LoopEnd::Cancelled { epochs_completed } => epochs_completed,
        };
        tracing::info!(
            "Training {:?} after {} steps, average loss {:.4}",
            terminal,
            state.step,
            state.average_loss()
        );

        Ok(JobReport {
            state: terminal,
            steps: state.step,
            epochs_completed,
            average_loss: state.average_loss(),
            progress,
            final_checkpoint,
        })
    }

    fn run_epochs<O: Optimizer<LoraAdapter<B>, B>>(
        &mut self,
        optim:    &mut O,
        state:    &mut TrainingState,
        progress: &mut Vec<ProgressEvent>,
    ) -> Result<LoopEnd> {
        let batcher = LmBatcher::<B>::new(self.model.device());

        for epoch in 0..self.config.epochs {
            state.epoch = epoch;

            for index in 0..self.batches.len() {
                let batch = self.batches.batch(index)?;
                self.train_step(optim, &batcher, state, &batch)?;

                if self.config.logging_interval > 0 && state.step % self.config.logging_interval == 0 {
                    progress.push(self.report_progress(state));
                }

                if self.config.checkpoint_interval > 0
                    && state.step % self.config.checkpoint_interval == 0
                {
                    let at = SavePoint { step: state.step, epoch };
                    self.store.save(&self.model, CheckpointKind::Interval, at)?;
                    self.store.enforce_retention()?;
                }

                let epoch_done = index + 1 == self.batches.len();
                let last_batch = epoch_done && epoch + 1 == self.config.epochs;
                if !last_batch && self.cancel.is_cancelled() {
                    tracing::warn!("Cancellation requested at step {}", state.step);
                    let epochs_completed = if epoch_done { epoch + 1 } else { epoch };
                    return Ok(LoopEnd::Cancelled { epochs_completed });
                }
            }
        }
        Ok(LoopEnd::Finished)
    }

    fn train_step<O: Optimizer<LoraAdapter<B>, B>>(
        &mut self,
        optim:   &mut O,
        batcher: &LmBatcher<B>,
        state:   &mut TrainingState,
        batch:   &TokenizedBatch,
    ) -> Result<()> {
        let fault = |reason: String| FineTuneError::TrainingFault {
            epoch: state.epoch,
            step:  state.step + 1,
            reason,
        };

        if batch.seq_len() < 2 {
            return Err(fault(format!(
                "sequences of length {} leave no next token to predict",
                batch.seq_len()
            )));
        }

        let lm     = batcher.batch(batch);
        let logits = self.model.forward(lm.input_ids.clone(), &lm.mask_rows);
        let loss   = lm_loss(logits, lm.input_ids, self.batches.tokenizer().pad_id());

        let loss_val: f64 = loss.clone().into_scalar().elem::<f64>();
        if !loss_val.is_finite() {
            return Err(fault(format!("loss became {loss_val}")));
        }

        let lr      = self.learning_rate_at(state.step);
        let grads   = loss.backward();
        let grads   = GradientsParams::from_grads(grads, self.model.adapter());
        let adapter = optim.step(lr, self.model.adapter().clone(), grads);
        self.model.set_adapter(adapter);

        state.step            += 1;
        state.cumulative_loss += loss_val;
        Ok(())
    }

    fn report_progress(&self, state: &TrainingState) -> ProgressEvent {
        let event = ProgressEvent {
            epoch:         state.epoch,
            step:          state.step,
            average_loss:  state.average_loss(),
            learning_rate: self.learning_rate_at(state.step),
        };
        tracing::info!(
            "epoch {} | step {:>5}/{} | avg_loss={:.4} | lr={:.2e}",
            event.epoch,
            event.step,
            self.total_steps(),
            event.average_loss,
            event.learning_rate
        );
        if let Some(metrics) = &self.metrics {
            if let Err(e) = metrics.log(&event) {
                tracing::warn!("Could not write metrics row: {:#}", e);
            }
        }
        event
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    use crate::domain::adapter_spec::AdapterSpec;
    use crate::domain::example::{Dataset, Example};
    use crate::data::preprocessor::tokenize;
    use crate::infra::tokenizer_store::build_byte_level;
    use burn::module::Param;

    use crate::ml::adapter::{inject, reattach};
    use crate::ml::model::{BaseModel, SequenceModelConfig};

    type TestBackend = Autodiff<NdArray>;

    fn adapter_values(model: &AdaptedModel<TestBackend>) -> Vec<f32> {
        model
            .adapter()
            .blocks
            .iter()
            .flat_map(|b| b.sublayers.iter().flatten())
            .filter_map(|s| s.low_rank.as_ref())
            .flat_map(|lr| {
                let mut v = lr.lora_a.val().into_data().to_vec::<f32>().unwrap();
                v.extend(lr.lora_b.val().into_data().to_vec::<f32>().unwrap());
                v
            })
            .collect()
    }

    fn kinds_and_steps(dir: &std::path::Path) -> Vec<(CheckpointKind, usize)> {
        CheckpointStore::new(dir).list().unwrap().iter().map(|c| (c.kind, c.step)).collect()
    }

    fn adapted(max_len: usize) -> AdaptedModel<TestBackend> {
        let config = SequenceModelConfig::new(257, max_len.max(2), 16, 2, 1, 32).with_seed(1);
        let base = BaseModel::new("tiny-test", config.clone(), config.init(&Default::default()));
        let spec = AdapterSpec { rank: 2, dropout: 0.0, ..AdapterSpec::default() };
        inject(base, &spec).unwrap()
    }

    fn batches(n: usize, max_len: usize) -> TokenizedBatches {
        batches_of(n, max_len, 2)
    }

    fn batches_of(n: usize, max_len: usize, batch_size: usize) -> TokenizedBatches {
        let examples = (0..n).map(|i| Example::new(format!("{i}+{i}?"), format!("{}", 2 * i))).collect();
        let ds = Arc::new(Dataset::new("train.jsonl", examples));
        tokenize(ds, build_byte_level("tiny-test", max_len).unwrap(), batch_size).unwrap()
    }

    fn config(dir: &std::path::Path) -> TrainingConfig {
        TrainingConfig {
            output_dir:          dir.to_path_buf(),
            batch_size:          2,
            epochs:              1,
            learning_rate:       1e-3,
            logging_interval:    1,
            checkpoint_interval: 0,
            retention:           2,
            shuffle_seed:        None,
        }
    }

    fn job(dir: &std::path::Path, cfg: TrainingConfig, n: usize) -> TrainingJob<TestBackend> {
        let store = CheckpointStore::new(dir).with_retention(cfg.retention);
        TrainingJob::new(cfg, adapted(32), batches(n, 32), store).unwrap()
    }

    #[test]
    fn test_empty_dataset_fails_before_any_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let store = CheckpointStore::new(&out);
        let err = TrainingJob::new(config(&out), adapted(32), batches(0, 32), store).err().unwrap();

        assert!(matches!(err, FineTuneError::EmptyDataset { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn test_completed_run_writes_exactly_one_final_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job = job(tmp.path(), config(tmp.path()), 5);

        let report = job.run().unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(report.steps, 3);
        assert_eq!(report.epochs_completed, 1);
        assert_eq!(report.progress.len(), 3);
        assert!(report.average_loss.is_finite());

        let all = CheckpointStore::new(tmp.path()).list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, CheckpointKind::Completed);
        assert_eq!(all[0].step, 3);
    }

    #[test]
    fn test_checkpoint_count_stays_within_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = TrainingConfig { checkpoint_interval: 1, retention: 1, epochs: 2, ..config(tmp.path()) };
        let mut job = job(tmp.path(), cfg, 6);

        let report = job.run().unwrap();
        assert_eq!(report.steps, 6);

        let all = CheckpointStore::new(tmp.path()).list().unwrap();
        assert!(all.len() <= 2);
        assert!(all.iter().any(|c| c.kind == CheckpointKind::Completed));
    }

    #[test]
    fn test_retention_two_over_five_interval_saves() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = TrainingConfig {
            batch_size:          1,
            checkpoint_interval: 1,
            retention:           2,
            ..config(tmp.path())
        };
        let store = CheckpointStore::new(tmp.path()).with_retention(cfg.retention);
        let mut job = TrainingJob::new(cfg, adapted(32), batches_of(5, 32, 1), store).unwrap();

        let report = job.run().unwrap();
        assert_eq!(report.steps, 5);
        assert_eq!(
            kinds_and_steps(tmp.path()),
            vec![
                (CheckpointKind::Interval, 4),
                (CheckpointKind::Interval, 5),
                (CheckpointKind::Completed, 5),
            ]
        );
    }

    #[test]
    fn test_fault_after_a_save_leaves_that_checkpoint_loadable() {
        let device = Default::default();
        let tokenizer = build_byte_level("tiny-test", 32).unwrap();
        let poison = tokenizer.encode("~").unwrap()[0] as usize;

        // Any sequence containing '~' embeds to NaN and yields a NaN loss
        let model_config = SequenceModelConfig::new(257, 32, 16, 2, 1, 32).with_seed(1);
        let mut inner = model_config.init::<TestBackend>(&device);
        let weight = inner.wte.weight.val();
        let [_, d_model] = weight.dims();
        let nan = Tensor::full([1, d_model], f32::NAN, &device);
        inner.wte.weight = Param::from_tensor(weight.slice_assign([poison..poison + 1, 0..d_model], nan).detach());
        let base = BaseModel::new("tiny-test", model_config, inner);
        let spec = AdapterSpec { rank: 2, dropout: 0.0, ..AdapterSpec::default() };
        let model = inject(base.clone(), &spec).unwrap();

        let examples = vec![Example::new("1+1?", "2"), Example::new("~", "~")];
        let ds = Arc::new(Dataset::new("train.jsonl", examples));
        let batches = tokenize(ds, tokenizer, 1).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let cfg = TrainingConfig { batch_size: 1, checkpoint_interval: 1, ..config(tmp.path()) };
        let store = CheckpointStore::new(tmp.path()).with_retention(cfg.retention);
        let mut job = TrainingJob::new(cfg, model, batches, store).unwrap();

        let err = job.run().unwrap_err();
        assert!(matches!(err, FineTuneError::TrainingFault { step: 2, .. }));
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(kinds_and_steps(tmp.path()), vec![(CheckpointKind::Interval, 1)]);

        let weights = CheckpointStore::load::<TestBackend>(&tmp.path().join("checkpoint-1"), &device).unwrap();
        let restored = reattach(base, weights).unwrap();
        assert_eq!(adapter_values(&restored), adapter_values(job.model()));
    }

    #[test]
    fn test_training_moves_only_the_adapter() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job = job(tmp.path(), config(tmp.path()), 4);
        let base_before = job.model().base().model.lm_head.weight.val().into_data().to_vec::<f32>().unwrap();

        job.run().unwrap();

        let model = job.into_model();
        let base_after = model.base().model.lm_head.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(base_after, base_before);
        let moved = model
            .adapter()
            .blocks
            .iter()
            .flat_map(|b| b.sublayers.iter().flatten())
            .filter_map(|s| s.low_rank.as_ref())
            .any(|lr| lr.lora_b.val().abs().sum().into_scalar().elem::<f64>() > 0.0);
        assert!(moved);
    }

    #[test]
    fn test_cancellation_stops_at_batch_boundary_with_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job = job(tmp.path(), config(tmp.path()), 8);
        job.cancellation_token().cancel();

        let report = job.run().unwrap();
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(report.steps, 1);
        assert_eq!(report.final_checkpoint.kind, CheckpointKind::Cancelled);
        assert!(report.final_checkpoint.path.join("adapter_model.mpk.gz").is_file());
    }

    #[test]
    fn test_cancellation_after_the_last_batch_still_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job = job(tmp.path(), config(tmp.path()), 2);
        job.cancellation_token().cancel();

        let report = job.run().unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.epochs_completed, 1);
        assert_eq!(report.final_checkpoint.kind, CheckpointKind::Completed);
    }

    #[test]
    fn test_cancellation_at_epoch_end_counts_that_epoch() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = TrainingConfig { epochs: 3, ..config(tmp.path()) };
        let mut job = job(tmp.path(), cfg, 2);
        job.cancellation_token().cancel();

        let report = job.run().unwrap();
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(report.steps, 1);
        assert_eq!(report.epochs_completed, 1);
    }

    #[test]
    fn test_too_short_sequences_fail_the_job() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let mut job = TrainingJob::new(config(tmp.path()), adapted(1), batches(2, 1), store).unwrap();

        let err = job.run().unwrap_err();
        assert!(matches!(err, FineTuneError::TrainingFault { step: 1, .. }));
        assert_eq!(job.state(), JobState::Failed);
        assert!(CheckpointStore::new(tmp.path()).list().unwrap().is_empty());
    }

    #[test]
    fn test_second_run_is_invalid_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job = job(tmp.path(), config(tmp.path()), 2);
        job.run().unwrap();

        let err = job.run().unwrap_err();
        assert!(matches!(err, FineTuneError::InvalidState { state: JobState::Completed }));
    }

    #[test]
    fn test_learning_rate_decays_linearly() {
        let tmp = tempfile::tempdir().unwrap();
        let job = job(tmp.path(), config(tmp.path()), 8); // 4 steps
        assert_eq!(job.learning_rate_at(0), 1e-3);
        assert!((job.learning_rate_at(2) - 5e-4).abs() < 1e-12);
    }
}
