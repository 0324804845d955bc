// ============================================================
// Layer 6 — Checkpoint Store
// ============================================================
// Persists adapter weights, never the base model.
//
// Layout under the output directory:
//
//   output/
//     training_config.json        ← the full run configuration
//     checkpoint-100/             ← interval checkpoint at step 100
//       adapter_model.mpk.gz      ← LoraAdapter record (full precision)
//       adapter_config.json       ← the AdapterSpec
//       checkpoint.json           ← step, epoch, kind, base model, time
//     checkpoint-200/
//     final/                      ← completed or cancelled run
//
// Saves are atomic per checkpoint: everything is written into a
// hidden staging directory first and renamed into place only when
// complete. A failed save leaves the previous checkpoint of the
// same name intact.
//
// Retention keeps the newest `retention` interval checkpoints,
// ordered by creation time then step. final/ is never evicted.
// With retention 0 the latest interval checkpoint survives until a
// final checkpoint newer than it exists. A final/ left behind by an
// earlier run in the same directory is older than every checkpoint
// of the current run, so it neither counts for retention nor wins
// in load_latest().
//
// Reference: Burn Book §5 (Records and Checkpointing)

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::train_use_case::TrainConfig;
use crate::domain::adapter_spec::AdapterSpec;
use crate::error::{FineTuneError, Result};
use crate::ml::adapter::{AdaptedModel, LoraAdapterRecord};

pub const FINAL_DIR:        &str = "final";
pub const INTERVAL_PREFIX:  &str = "checkpoint-";
pub const WEIGHTS_STEM:     &str = "adapter_model";
pub const ADAPTER_CONFIG:   &str = "adapter_config.json";
pub const CHECKPOINT_META:  &str = "checkpoint.json";
pub const TRAINING_CONFIG:  &str = "training_config.json";

type AdapterRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Periodic save during training
    Interval,
    /// End of a run that finished every epoch
    Completed,
    /// End of a run stopped by a cancellation request
    Cancelled,
}

impl CheckpointKind {
    fn dir_name(self, step: usize) -> String {
        match self {
            CheckpointKind::Interval => format!("{INTERVAL_PREFIX}{step}"),
            CheckpointKind::Completed | CheckpointKind::Cancelled => FINAL_DIR.to_string(),
        }
    }
}

/// What checkpoint.json holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointMeta {
    kind:       CheckpointKind,
    step:       usize,
    epoch:      usize,
    base_model: String,
    created_at: DateTime<Utc>,
}

/// A checkpoint on disk, described by its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub path:       PathBuf,
    pub kind:       CheckpointKind,
    pub step:       usize,
    pub epoch:      usize,
    pub base_model: String,
    pub created_at: DateTime<Utc>,
    pub spec:       AdapterSpec,
}

/// Adapter weights read back from a checkpoint, ready to be
/// re-attached to a freshly loaded base model.
pub struct AdapterWeights<B: Backend> {
    pub checkpoint: Checkpoint,
    pub record:     LoraAdapterRecord<B>,
}

impl<B: Backend> std::fmt::Debug for AdapterWeights<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterWeights")
            .field("checkpoint", &self.checkpoint)
            .finish_non_exhaustive()
    }
}

/// Where the loop currently is when a save is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavePoint {
    pub step:  usize,
    pub epoch: usize,
}

pub struct CheckpointStore {
    dir:       PathBuf,
    retention: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), retention: 2 }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    // ─── Save ────────────────────────────────────────────────────────────────

    /// Persist the adapter of `model` as a checkpoint of the given kind.
    ///
    /// Interval checkpoints go to checkpoint-{step}/, completed and
    /// cancelled runs to final/. An existing checkpoint with the same
    /// name is replaced only after the new one is fully written.
    pub fn save<B: Backend>(
        &self,
        model: &AdaptedModel<B>,
        kind:  CheckpointKind,
        at:    SavePoint,
    ) -> Result<Checkpoint> {
        fs::create_dir_all(&self.dir).map_err(|e| FineTuneError::checkpoint_io(&self.dir, e))?;

        let name        = kind.dir_name(at.step);
        let destination = self.dir.join(&name);
        let staging     = self.dir.join(format!(".staging-{name}"));

        remove_path(&staging)?;

        let meta = CheckpointMeta {
            kind,
            step:       at.step,
            epoch:      at.epoch,
            base_model: model.base_model_name().to_string(),
            created_at: Utc::now(),
        };

        if let Err(e) = write_checkpoint(&staging, model, &meta) {
            // Best effort; the write error is what the caller needs
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                tracing::warn!("Could not remove '{}': {}", staging.display(), cleanup);
            }
            return Err(e);
        }

        self.swap_into_place(&staging, &destination, &name)?;

        tracing::info!(
            "Saved {:?} checkpoint '{}' (step {}, epoch {})",
            kind,
            destination.display(),
            at.step,
            at.epoch
        );

        Ok(Checkpoint {
            path:       destination,
            kind,
            step:       meta.step,
            epoch:      meta.epoch,
            base_model: meta.base_model,
            created_at: meta.created_at,
            spec:       model.spec().clone(),
        })
    }

    fn swap_into_place(&self, staging: &Path, destination: &Path, name: &str) -> Result<()> {
        if !destination.exists() {
            return fs::rename(staging, destination)
                .map_err(|e| FineTuneError::checkpoint_io(destination, e));
        }

        // Move the old checkpoint aside, promote the new one, then drop the old
        let retired = self.dir.join(format!(".retired-{name}"));
        remove_path(&retired)?;
        fs::rename(destination, &retired).map_err(|e| FineTuneError::checkpoint_io(destination, e))?;

        if let Err(e) = fs::rename(staging, destination) {
            // Put the previous checkpoint back before reporting
            if let Err(restore) = fs::rename(&retired, destination) {
                tracing::error!(
                    "Could not restore '{}' from '{}': {}",
                    destination.display(),
                    retired.display(),
                    restore
                );
            }
            return Err(FineTuneError::checkpoint_io(destination, e));
        }

        if let Err(e) = fs::remove_dir_all(&retired) {
            tracing::warn!("Could not remove replaced checkpoint '{}': {}", retired.display(), e);
        }
        Ok(())
    }

    /// Write the run configuration next to the checkpoints.
    pub fn save_config(&self, cfg: &TrainConfig) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| FineTuneError::checkpoint_io(&self.dir, e))?;
        let path = self.dir.join(TRAINING_CONFIG);
        let json = serde_json::to_string_pretty(cfg).map_err(|e| FineTuneError::checkpoint_io(&path, e))?;
        fs::write(&path, json).map_err(|e| FineTuneError::checkpoint_io(&path, e))?;

        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }

    // ─── Retention ───────────────────────────────────────────────────────────

    /// Delete the oldest interval checkpoints beyond the retention limit.
    /// Returns what was removed, oldest first.
    pub fn enforce_retention(&self) -> Result<Vec<Checkpoint>> {
        let all = self.list()?;
        let final_is_newest = all.last().is_some_and(|c| c.kind != CheckpointKind::Interval);
        let intervals: Vec<Checkpoint> = all
            .into_iter()
            .filter(|c| c.kind == CheckpointKind::Interval)
            .collect();

        let keep = match (self.retention, final_is_newest) {
            (0, true)  => 0,
            (0, false) => 1,
            (n, _)     => n,
        };

        let excess = intervals.len().saturating_sub(keep);
        let evicted: Vec<Checkpoint> = intervals.into_iter().take(excess).collect();
        for ckpt in &evicted {
            fs::remove_dir_all(&ckpt.path).map_err(|e| FineTuneError::checkpoint_io(&ckpt.path, e))?;
            tracing::info!("Evicted checkpoint '{}'", ckpt.path.display());
        }
        Ok(evicted)
    }

    // ─── Query / Load ────────────────────────────────────────────────────────

    /// Every complete checkpoint in the output directory, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|e| FineTuneError::checkpoint_io(&self.dir, e))?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FineTuneError::checkpoint_io(&self.dir, e))?;
            let path  = entry.path();
            let name  = entry.file_name().to_string_lossy().into_owned();

            let is_checkpoint = name == FINAL_DIR || name.starts_with(INTERVAL_PREFIX);
            if is_checkpoint && path.join(CHECKPOINT_META).is_file() {
                found.push(read_checkpoint(&path)?);
            }
        }

        found.sort_by_key(|c| (c.created_at, c.step, c.kind != CheckpointKind::Interval));
        Ok(found)
    }

    /// Read the checkpoint metadata and adapter weights stored at `path`.
    pub fn load<B: Backend>(path: &Path, device: &B::Device) -> Result<AdapterWeights<B>> {
        let checkpoint = read_checkpoint(path)?;
        let weights = path.join(WEIGHTS_STEM);
        let record: LoraAdapterRecord<B> = AdapterRecorder::default()
            .load(weights.clone(), device)
            .map_err(|e| FineTuneError::checkpoint_io(&weights, e))?;

        tracing::info!(
            "Loaded adapter from '{}' (step {}, base '{}')",
            path.display(),
            checkpoint.step,
            checkpoint.base_model
        );
        Ok(AdapterWeights { checkpoint, record })
    }

    /// Load the most useful checkpoint under this store.
    ///
    /// The store directory may itself be a checkpoint. Otherwise the
    /// newest checkpoint wins; final/ beats an interval checkpoint
    /// written at the same moment and step.
    pub fn load_latest<B: Backend>(&self, device: &B::Device) -> Result<AdapterWeights<B>> {
        if self.dir.join(CHECKPOINT_META).is_file() {
            return Self::load(&self.dir, device);
        }

        let all = self.list()?;
        let chosen = all
            .last()
            .ok_or_else(|| FineTuneError::CheckpointNotFound { path: self.dir.clone() })?;

        Self::load(&chosen.path, device)
    }
}

fn write_checkpoint<B: Backend>(dir: &Path, model: &AdaptedModel<B>, meta: &CheckpointMeta) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| FineTuneError::checkpoint_io(dir, e))?;

    let weights = dir.join(WEIGHTS_STEM);
    AdapterRecorder::default()
        .record(model.adapter().clone().into_record(), weights.clone())
        .map_err(|e| FineTuneError::checkpoint_io(&weights, e))?;

    write_json(&dir.join(ADAPTER_CONFIG), model.spec())?;
    write_json(&dir.join(CHECKPOINT_META), meta)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| FineTuneError::checkpoint_io(path, e))?;
    fs::write(path, json).map_err(|e| FineTuneError::checkpoint_io(path, e))
}

fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let meta_path = path.join(CHECKPOINT_META);
    if !meta_path.is_file() {
        return Err(FineTuneError::CheckpointNotFound { path: path.to_path_buf() });
    }

    let meta: CheckpointMeta = read_json(&meta_path)?;
    let spec: AdapterSpec    = read_json(&path.join(ADAPTER_CONFIG))?;

    Ok(Checkpoint {
        path:       path.to_path_buf(),
        kind:       meta.kind,
        step:       meta.step,
        epoch:      meta.epoch,
        base_model: meta.base_model,
        created_at: meta.created_at,
        spec,
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| FineTuneError::checkpoint_io(path, e))?;
    serde_json::from_str(&text).map_err(|e| FineTuneError::checkpoint_io(path, e))
}

/// Remove a leftover file or directory, if any.
fn remove_path(path: &Path) -> Result<()> {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        return Ok(());
    };
    removed.map_err(|e| FineTuneError::checkpoint_io(path, e))
}
