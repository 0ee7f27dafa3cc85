//! # hyperseg
//!
//! Temporal action segmentation with windowed attention and a Poincaré-ball
//! hierarchy objective.
//!
//! ## Features
//! - Normal, block and sliding-window attention over padded (B, C, L) sequences
//! - Dilated attention blocks stacked into an encoder and a decoder chain
//! - Hyperbolic projection head (Möbius linear layers in the Poincaré ball)
//! - Segment-aware contrastive, center, norm-ordering and tree losses
//! - GPU acceleration via candle-core
//!
//! ## Architecture
//!
//! ```text
//! features (B, 2048, L)
//!     │
//!     ▼
//! Encoder ── 10 × [dilated conv → instance norm → attention(2^i) → 1×1 → residual]
//!     │ logits, features
//!     ▼
//! Decoder × 3 ── softmax(logits) in, cross-attention to previous features
//!     │ logits per stage
//!     ▼
//! HyperbolicHead ── expmap0 → HypLinear → GELU → HypLinear → GELU → HypLinear
//!     │
//!     ▼
//! embeddings (B, L, 64) inside the ball ──► HierarchicalLoss
//! ```

// Core modules
pub mod attention;
pub mod context;
pub mod error;
pub mod hyperbolic;
pub mod layers;
pub mod mask;
pub mod model;
pub mod norm;

// Objectives
pub mod loss;

// Training infrastructure
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod metrics;
pub mod training;

// Integration tests
#[cfg(test)]
mod tests;

pub use attention::{
    scalar_dot_attention, AttentionLayer, AttentionOutput, AttentionSpec, AttentionWindow,
    MultiHeadAttention, Stage, WindowKind,
};
pub use config::{HierarchicalLossConfig, SegmenterConfig, SingleFramePolicy, TrainingConfig};
pub use context::ExecContext;
pub use data::{ActionDict, Batch, BatchSource, FeatureStore, NpyFeatureStore, SequenceBatchGenerator};
pub use error::SegError;
pub use hyperbolic::{HypLinear, HyperbolicHead, PoincareBall};
pub use layers::{AttentionBlock, AttentionBlockConfig};
pub use loss::{HierarchicalLoss, LossBreakdown, SegmentBoundaries};
pub use mask::WindowMask;
pub use model::{CascadeOutput, SegmentationTransformer};
pub use training::{PlateauScheduler, Trainer};

/// Result type for segmentation operations
pub type SegResult<T> = Result<T, SegError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        // Core types
        AttentionWindow,
        ExecContext,
        PoincareBall,
        SegmentationTransformer,
        SegmenterConfig,
        Stage,
        WindowKind,

        // Objective
        HierarchicalLoss,
        HierarchicalLossConfig,
        SegmentBoundaries,

        // Training types
        ActionDict,
        BatchSource,
        Trainer,
        TrainingConfig,

        // Result type
        SegError,
        SegResult,
    };
}
