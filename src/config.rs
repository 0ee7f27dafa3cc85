//! Model, loss and training configuration
//!
//! Every struct here round-trips through JSON so a run can be reproduced from
//! the `epoch-N.json` file written next to its checkpoint.

use crate::attention::WindowKind;
use crate::{SegError, SegResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Read a JSON file into any config type
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> SegResult<T> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| SegError::Io(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&text).map_err(|e| SegError::SerializationError(e.to_string()))
}

/// Write any config type as pretty JSON
pub fn save_json<T: Serialize>(value: &T, path: impl AsRef<Path>) -> SegResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| SegError::SerializationError(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Encoder/decoder cascade shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Refinement stages after the encoder
    pub num_decoders: usize,
    /// Attention blocks per stage; block i uses dilation 2^i
    pub num_layers: usize,
    /// Query/key channel reduction
    pub r1: usize,
    /// Value channel reduction
    pub r2: usize,
    /// Working feature width
    pub num_f_maps: usize,
    /// Channels of the raw per-frame features
    pub input_dim: usize,
    /// Hyperbolic embedding width
    pub output_dim: usize,
    pub num_classes: usize,
    /// Probability of zeroing a whole input channel during training
    pub channel_masking_rate: f64,
    pub window: WindowKind,
    pub num_heads: usize,
    /// Poincaré ball curvature
    pub curvature: f64,
    pub head_dropout: f32,
    /// Decoder `s` mixes attention with weight exp(-alpha_decay * s)
    pub alpha_decay: f64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            num_decoders: 3,
            num_layers: 10,
            r1: 2,
            r2: 2,
            num_f_maps: 64,
            input_dim: 2048,
            output_dim: 64,
            num_classes: 48,
            channel_masking_rate: 0.3,
            window: WindowKind::Sliding,
            num_heads: 1,
            curvature: 1.0,
            head_dropout: crate::hyperbolic::HEAD_DROPOUT,
            alpha_decay: 3.0,
        }
    }
}

impl SegmenterConfig {
    /// I3D features (2048 channels) with the default cascade
    pub fn breakfast(num_classes: usize) -> Self {
        Self {
            num_classes,
            ..Default::default()
        }
    }

    /// Small cascade for tests and smoke runs
    pub fn tiny(input_dim: usize, num_classes: usize) -> Self {
        Self {
            num_decoders: 1,
            num_layers: 3,
            num_f_maps: 8,
            input_dim,
            output_dim: 4,
            num_classes,
            ..Default::default()
        }
    }

    /// Attention mixing weight of decoder `index`
    pub fn decoder_alpha(&self, index: usize) -> f64 {
        decoder_alpha(index, self.alpha_decay)
    }

    pub fn validate(&self) -> SegResult<()> {
        if self.num_layers == 0 {
            return Err(SegError::InvalidParameter("num_layers must be at least 1".into()));
        }
        if self.num_classes == 0 || self.input_dim == 0 || self.output_dim == 0 {
            return Err(SegError::InvalidParameter(
                "input_dim, output_dim and num_classes must be non-zero".into(),
            ));
        }
        if self.r1 == 0 || self.r2 == 0 || self.num_f_maps / self.r1.max(self.r2) == 0 {
            return Err(SegError::InvalidParameter(format!(
                "reductions r1={} r2={} do not fit {} feature maps",
                self.r1, self.r2, self.num_f_maps
            )));
        }
        if !(self.curvature > 0.0) {
            return Err(SegError::InvalidParameter(format!(
                "curvature must be positive, got {}",
                self.curvature
            )));
        }
        Ok(())
    }
}

/// exp(-decay * index)
pub fn decoder_alpha(index: usize, decay: f64) -> f64 {
    (-decay * index as f64).exp()
}

/// What to do with a segment too short to yield a parent/child pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SingleFramePolicy {
    /// Leave it out of the norm-ordering and tree terms, with a warning
    #[default]
    Skip,
    /// Fail with `NumericalDegeneracy`
    Error,
}

impl fmt::Display for SingleFramePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SingleFramePolicy::Skip => f.write_str("skip"),
            SingleFramePolicy::Error => f.write_str("error"),
        }
    }
}

impl FromStr for SingleFramePolicy {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(SingleFramePolicy::Skip),
            "error" => Ok(SingleFramePolicy::Error),
            other => Err(SegError::UnknownVariant {
                kind: "single frame policy",
                value: other.to_string(),
            }),
        }
    }
}

/// Weights and margins of the hierarchical embedding objective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchicalLossConfig {
    /// Added inside `relu(|child| - |parent| + margin)` of the norm-ordering score
    pub norm_margin: f64,
    /// Curvature used by the tree (distance) term
    pub curvature: f64,
    /// Weight of the tree term in the total; 0 reports it without training on it
    pub tree_weight: f64,
    /// Parent/child pairs per distance matrix in the tree term
    pub tree_batch: usize,
    pub single_frame_policy: SingleFramePolicy,
}

impl Default for HierarchicalLossConfig {
    fn default() -> Self {
        Self {
            norm_margin: 0.01,
            curvature: 1.0,
            tree_weight: 0.0,
            tree_batch: 4,
            single_frame_policy: SingleFramePolicy::Skip,
        }
    }
}

/// Optimiser, schedule and bookkeeping for a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Learning rate multiplier on a plateau
    pub plateau_factor: f64,
    /// Epochs without improvement before reducing
    pub plateau_patience: usize,
    /// Save every N epochs
    pub checkpoint_every: usize,
    pub sample_rate: usize,
    pub seed: u64,
    pub loss: HierarchicalLossConfig,
    /// Weight of the per-stage classification loss
    pub supervision_weight: f64,
    /// Weight of the temporal smoothing term inside the classification loss
    pub smoothing_weight: f64,
    /// TensorBoard run directory; None disables event files
    pub log_dir: Option<String>,
    /// Log per-segment norm profiles every N epochs (0 disables)
    pub norm_profile_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 120,
            batch_size: 1,
            learning_rate: 5e-4,
            weight_decay: 1e-5,
            plateau_factor: 0.5,
            plateau_patience: 3,
            checkpoint_every: 10,
            sample_rate: 1,
            seed: 19980125,
            loss: HierarchicalLossConfig::default(),
            supervision_weight: 1.0,
            smoothing_weight: 0.15,
            log_dir: None,
            norm_profile_every: 3,
        }
    }
}

impl TrainingConfig {
    /// A couple of epochs, no event files
    pub fn quick() -> Self {
        Self {
            num_epochs: 2,
            checkpoint_every: 1,
            ..Default::default()
        }
    }
}
