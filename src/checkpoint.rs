//! # Model Checkpointing
//!
//! One checkpoint per saved epoch, side by side in a model directory:
//!
//! ```text
//! model_dir/
//! ├── epoch-10.safetensors  # parameters
//! ├── epoch-10.opt.json     # optimizer and scheduler snapshot
//! └── epoch-10.json         # model config and metadata
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hyperseg::checkpoint::{save_checkpoint, load_checkpoint};
//!
//! save_checkpoint("models/split1", 10, &varmap, &model_cfg, &snapshot, Some(0.42))?;
//! let (model, varmap, metadata) = load_checkpoint("models/split1", 10, &ctx)?;
//! ```

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::SegmenterConfig;
use crate::model::SegmentationTransformer;
use crate::training::PlateauScheduler;
use crate::{ExecContext, SegError, SegResult};

/// Metadata stored with checkpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub config: SegmenterConfig,
    pub epoch: usize,
    /// Mean epoch loss when saved
    pub loss: Option<f64>,
    pub timestamp: String,
    pub version: String,
}

impl CheckpointMetadata {
    pub fn new(config: SegmenterConfig, epoch: usize) -> Self {
        Self {
            config,
            epoch,
            loss: None,
            timestamp: chrono::Local::now().to_rfc3339(),
            version: crate::VERSION.to_string(),
        }
    }

    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = Some(loss);
        self
    }
}

/// Everything needed to resume the optimiser schedule.
///
/// AdamW moment buffers are not exposed by the optimiser, so a resumed run
/// restarts them from zero at the saved learning rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSnapshot {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// Optimiser steps taken so far
    pub step: usize,
    pub scheduler: PlateauScheduler,
}

pub fn weights_path(dir: impl AsRef<Path>, epoch: usize) -> PathBuf {
    dir.as_ref().join(format!("epoch-{}.safetensors", epoch))
}

pub fn optimizer_path(dir: impl AsRef<Path>, epoch: usize) -> PathBuf {
    dir.as_ref().join(format!("epoch-{}.opt.json", epoch))
}

pub fn metadata_path(dir: impl AsRef<Path>, epoch: usize) -> PathBuf {
    dir.as_ref().join(format!("epoch-{}.json", epoch))
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> SegResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| SegError::SerializationError(e.to_string()))?;
    fs::write(path, json).map_err(|e| SegError::Io(format!("Failed to write {}: {}", path.display(), e)))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> SegResult<T> {
    let text = fs::read_to_string(path)
        .map_err(|e| SegError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&text).map_err(|e| SegError::SerializationError(e.to_string()))
}

/// Save parameters, optimizer snapshot and metadata for `epoch`
pub fn save_checkpoint(
    dir: impl AsRef<Path>,
    epoch: usize,
    varmap: &VarMap,
    config: &SegmenterConfig,
    optimizer: &OptimizerSnapshot,
    loss: Option<f64>,
) -> SegResult<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .map_err(|e| SegError::Io(format!("Failed to create checkpoint dir: {}", e)))?;

    let mut metadata = CheckpointMetadata::new(config.clone(), epoch);
    if let Some(l) = loss {
        metadata = metadata.with_loss(l);
    }
    write_json(&metadata, &metadata_path(dir, epoch))?;
    write_json(optimizer, &optimizer_path(dir, epoch))?;

    varmap
        .save(weights_path(dir, epoch))
        .map_err(|e| SegError::SerializationError(format!("Failed to save model: {}", e)))?;

    log::info!("Saved epoch {} checkpoint to {:?}", epoch, dir);
    Ok(())
}

/// Rebuild the model recorded for `epoch` and load its weights
pub fn load_checkpoint(
    dir: impl AsRef<Path>,
    epoch: usize,
    ctx: &ExecContext,
) -> SegResult<(SegmentationTransformer, VarMap, CheckpointMetadata)> {
    let dir = dir.as_ref();
    let metadata: CheckpointMetadata = read_json(&metadata_path(dir, epoch))?;

    let weights = weights_path(dir, epoch);
    if !weights.exists() {
        return Err(SegError::Io(format!("missing weights {}", weights.display())));
    }

    // Building the model registers every variable; loading then overwrites them.
    let mut varmap = VarMap::new();
    let model = SegmentationTransformer::new(metadata.config.clone(), ctx, ctx.var_builder(&varmap))?;
    varmap
        .load(&weights)
        .map_err(|e| SegError::SerializationError(format!("Failed to load model: {}", e)))?;

    log::info!("Loaded epoch {} checkpoint from {:?}", epoch, dir);
    Ok((model, varmap, metadata))
}

pub fn load_optimizer_snapshot(dir: impl AsRef<Path>, epoch: usize) -> SegResult<OptimizerSnapshot> {
    read_json(&optimizer_path(dir, epoch))
}

pub fn checkpoint_exists(dir: impl AsRef<Path>, epoch: usize) -> bool {
    let dir = dir.as_ref();
    metadata_path(dir, epoch).exists() && weights_path(dir, epoch).exists()
}

/// Epochs with a complete checkpoint, ascending
pub fn list_checkpoints(dir: impl AsRef<Path>) -> SegResult<Vec<usize>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut epochs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(epoch) = name
            .strip_prefix("epoch-")
            .and_then(|rest| rest.strip_suffix(".safetensors"))
            .and_then(|n| n.parse::<usize>().ok())
        {
            if checkpoint_exists(dir, epoch) {
                epochs.push(epoch);
            }
        }
    }
    epochs.sort_unstable();
    Ok(epochs)
}
