//! Windowed attention over padded (B, C, L) sequences
//!
//! One scaled dot-product primitive with log-mask padding suppression, and
//! three ways of partitioning a sequence before calling it:
//!
//! ```text
//! normal   q[0..L]             x  k[0..L]
//! block    q[i*bl..(i+1)*bl]   x  k[i*bl..(i+1)*bl]
//! sliding  q[i*bl..(i+1)*bl]   x  k[i*bl-bl/2..(i+1)*bl+bl/2]  (window mask applied)
//! ```
//!
//! Every strategy pads the length to a multiple of the block length, marks
//! the padding invalid, truncates the result back to L and re-masks it.

use crate::layers::replicate;
use crate::mask::{frame_mask, WindowMask};
use crate::{ExecContext, SegError, SegResult};
use candle_core::{Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, Dropout, Module, VarBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Floor added to the mask before taking its log, so padded keys get log(1e-6)
pub const MASK_EPS: f64 = 1e-6;

/// Dropout applied to concatenated heads before the output projection
pub const HEAD_DROPOUT: f32 = 0.5;

/// How a sequence is partitioned before attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    /// Global attention over the whole sequence
    Normal,
    /// Non-overlapping blocks attending within themselves
    Block,
    /// Query blocks against a double-width centred key window (batch size 1)
    Sliding,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Normal => "normal",
            WindowKind::Block => "block",
            WindowKind::Sliding => "sliding",
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowKind {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" | "normal_att" => Ok(WindowKind::Normal),
            "block" | "block_att" => Ok(WindowKind::Block),
            "sliding" | "sliding_att" => Ok(WindowKind::Sliding),
            other => Err(SegError::UnknownVariant {
                kind: "window",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether values come from the layer input or from an external feature map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Self-attention: query, key and value all from the layer input
    Encoder,
    /// Cross-attention: value from the encoder features
    Decoder,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Encoder => f.write_str("encoder"),
            Stage::Decoder => f.write_str("decoder"),
        }
    }
}

impl FromStr for Stage {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "encoder" => Ok(Stage::Encoder),
            "decoder" => Ok(Stage::Decoder),
            other => Err(SegError::UnknownVariant {
                kind: "stage",
                value: other.to_string(),
            }),
        }
    }
}

/// Attended values and the weights that produced them
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// (B, C_value, L)
    pub output: Tensor,
    /// (B', L_query, L_key) where B' counts blocks for windowed strategies
    pub weights: Tensor,
}

/// Scaled dot-product attention with padding suppression.
///
/// `query` (B, C, Lq), `key` (B, C, Lk), `value` (B, Cv, Lk). `mask` must
/// broadcast to (B, Lq, Lk); a (B, 1, Lk) key-validity mask is the usual case.
/// Masked keys get `log(mask + 1e-6)` added before the softmax and the
/// weights are multiplied by the mask afterwards.
pub fn scalar_dot_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    mask: &Tensor,
) -> SegResult<AttentionOutput> {
    let (_, c_query, _) = query.dims3()?;
    let (_, c_key, _) = key.dims3()?;
    if c_query != c_key {
        return Err(SegError::ChannelMismatch {
            query: c_query,
            key: c_key,
        });
    }

    // (B, Lq, Lk)
    let energy = query.transpose(1, 2)?.contiguous()?.matmul(&key.contiguous()?)?;
    let scores = (energy / (c_query as f64).sqrt())?;
    let log_mask = (mask + MASK_EPS)?.log()?;
    let scores = scores.broadcast_add(&log_mask)?;

    let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    let weights = weights.broadcast_mul(mask)?;

    // (B, Cv, Lk) x (B, Lk, Lq) -> (B, Cv, Lq)
    let output = value
        .contiguous()?
        .matmul(&weights.transpose(1, 2)?.contiguous()?)?;

    Ok(AttentionOutput { output, weights })
}

/// (B, C, nb * bl) -> (B * nb, C, bl)
fn split_blocks(x: &Tensor, n_blocks: usize, block_len: usize) -> SegResult<Tensor> {
    let (batch, channels, _) = x.dims3()?;
    Ok(x.reshape((batch, channels, n_blocks, block_len))?
        .permute((0, 2, 1, 3))?
        .reshape((batch * n_blocks, channels, block_len))?)
}

/// (B * nb, C, bl) -> (B, C, nb * bl)
fn merge_blocks(x: &Tensor, batch: usize, n_blocks: usize, block_len: usize) -> SegResult<Tensor> {
    let (_, channels, _) = x.dims3()?;
    Ok(x.reshape((batch, n_blocks, channels, block_len))?
        .permute((0, 2, 1, 3))?
        .reshape((batch, channels, n_blocks * block_len))?)
}

/// Partitioning strategy, resolved once when a layer is built
#[derive(Debug, Clone)]
pub enum AttentionWindow {
    Normal,
    Block { block_len: usize },
    Sliding { block_len: usize, window_mask: WindowMask },
}

impl AttentionWindow {
    pub fn new(kind: WindowKind, block_len: usize, ctx: &ExecContext) -> SegResult<Self> {
        if block_len == 0 {
            return Err(SegError::InvalidParameter(
                "block length must be at least 1".to_string(),
            ));
        }
        Ok(match kind {
            WindowKind::Normal => AttentionWindow::Normal,
            WindowKind::Block => AttentionWindow::Block { block_len },
            WindowKind::Sliding => AttentionWindow::Sliding {
                block_len,
                window_mask: WindowMask::new(block_len, ctx.dtype(), ctx.device())?,
            },
        })
    }

    pub fn kind(&self) -> WindowKind {
        match self {
            AttentionWindow::Normal => WindowKind::Normal,
            AttentionWindow::Block { .. } => WindowKind::Block,
            AttentionWindow::Sliding { .. } => WindowKind::Sliding,
        }
    }

    /// Attend projected `query`/`key`/`value` under validity `mask` (B, _, L).
    ///
    /// The output always has the input length and is zero on invalid frames.
    pub fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: &Tensor,
    ) -> SegResult<AttentionOutput> {
        match self {
            AttentionWindow::Normal => Self::attend_normal(query, key, value, mask),
            AttentionWindow::Block { block_len } => {
                Self::attend_block(query, key, value, mask, *block_len)
            }
            AttentionWindow::Sliding {
                block_len,
                window_mask,
            } => Self::attend_sliding(query, key, value, mask, *block_len, window_mask),
        }
    }

    fn attend_normal(
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: &Tensor,
    ) -> SegResult<AttentionOutput> {
        let valid = frame_mask(mask)?;
        let attended = scalar_dot_attention(query, key, value, &valid)?;
        Ok(AttentionOutput {
            output: attended.output.broadcast_mul(&valid)?,
            weights: attended.weights,
        })
    }

    fn attend_block(
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: &Tensor,
        block_len: usize,
    ) -> SegResult<AttentionOutput> {
        let (batch, _, len) = query.dims3()?;
        let n_blocks = len.div_ceil(block_len);
        let pad = n_blocks * block_len - len;

        let valid = frame_mask(mask)?;
        let padded_mask = valid.pad_with_zeros(2, 0, pad)?;

        let q = split_blocks(&query.pad_with_zeros(2, 0, pad)?, n_blocks, block_len)?;
        let k = split_blocks(&key.pad_with_zeros(2, 0, pad)?, n_blocks, block_len)?;
        let v = split_blocks(&value.pad_with_zeros(2, 0, pad)?, n_blocks, block_len)?;
        let block_mask = split_blocks(&padded_mask, n_blocks, block_len)?;

        let attended = scalar_dot_attention(&q, &k, &v, &block_mask)?;
        let output = merge_blocks(&attended.output, batch, n_blocks, block_len)?
            .narrow(2, 0, len)?
            .broadcast_mul(&valid)?;

        Ok(AttentionOutput {
            output,
            weights: attended.weights,
        })
    }

    fn attend_sliding(
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: &Tensor,
        block_len: usize,
        window_mask: &WindowMask,
    ) -> SegResult<AttentionOutput> {
        let (batch, _, len) = query.dims3()?;
        // Window gathering below concatenates blocks of a single sequence.
        if batch != 1 {
            return Err(SegError::BatchSizeMismatch {
                expected: 1,
                got: batch,
            });
        }

        let n_blocks = len.div_ceil(block_len);
        let pad = n_blocks * block_len - len;
        let half = block_len / 2;
        let width = WindowMask::window_width(block_len);

        let valid = frame_mask(mask)?;
        let padded_mask = valid
            .pad_with_zeros(2, 0, pad)?
            .pad_with_zeros(2, half, half)?;

        let q = split_blocks(&query.pad_with_zeros(2, 0, pad)?, n_blocks, block_len)?;
        let k = key.pad_with_zeros(2, 0, pad)?.pad_with_zeros(2, half, half)?;
        let v = value.pad_with_zeros(2, 0, pad)?.pad_with_zeros(2, half, half)?;

        let windows = |x: &Tensor| -> SegResult<Tensor> {
            let parts = (0..n_blocks)
                .map(|i| x.narrow(2, i * block_len, width))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(Tensor::cat(&parts, 0)?)
        };
        let k = windows(&k)?;
        let v = windows(&v)?;
        // (nb, 1, width) * (1, bl, width) -> (nb, bl, width)
        let final_mask = windows(&padded_mask)?.broadcast_mul(window_mask.tensor())?;

        let attended = scalar_dot_attention(&q, &k, &v, &final_mask)?;
        let output = merge_blocks(&attended.output, batch, n_blocks, block_len)?
            .narrow(2, 0, len)?
            .broadcast_mul(&valid)?;

        Ok(AttentionOutput {
            output,
            weights: attended.weights,
        })
    }
}

/// Shape parameters of one attention layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttentionSpec {
    /// Channels of the query/key source
    pub q_dim: usize,
    pub k_dim: usize,
    /// Channels of the value source (also the output width)
    pub v_dim: usize,
    /// Reduction ratios for the query, key and value projections
    pub r1: usize,
    pub r2: usize,
    pub r3: usize,
    pub block_len: usize,
    pub stage: Stage,
    pub window: WindowKind,
}

impl AttentionSpec {
    fn reduced(dim: usize, ratio: usize, what: &str) -> SegResult<usize> {
        if ratio == 0 || dim / ratio == 0 {
            return Err(SegError::InvalidParameter(format!(
                "{} projection reduces {} channels by {} to nothing",
                what, dim, ratio
            )));
        }
        Ok(dim / ratio)
    }
}

/// Projections plus one windowed attention core
#[derive(Debug)]
pub struct AttentionLayer {
    query: Conv1d,
    key: Conv1d,
    value: Conv1d,
    output: Conv1d,
    window: AttentionWindow,
    stage: Stage,
}

impl AttentionLayer {
    pub fn new(spec: &AttentionSpec, ctx: &ExecContext, vb: VarBuilder) -> SegResult<Self> {
        let cfg = Conv1dConfig::default();
        let q_out = AttentionSpec::reduced(spec.q_dim, spec.r1, "query")?;
        let k_out = AttentionSpec::reduced(spec.k_dim, spec.r2, "key")?;
        let v_out = AttentionSpec::reduced(spec.v_dim, spec.r3, "value")?;

        let query = candle_nn::conv1d(spec.q_dim, q_out, 1, cfg, vb.pp("query"))?;
        let key = candle_nn::conv1d(spec.k_dim, k_out, 1, cfg, vb.pp("key"))?;
        let value = candle_nn::conv1d(spec.v_dim, v_out, 1, cfg, vb.pp("value"))?;
        let output = candle_nn::conv1d(v_out, spec.v_dim, 1, cfg, vb.pp("output"))?;

        let window = AttentionWindow::new(spec.window, spec.block_len, ctx)?;

        Ok(Self {
            query,
            key,
            value,
            output,
            window,
            stage: spec.stage,
        })
    }

    pub fn window(&self) -> &AttentionWindow {
        &self.window
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Attend `x` to itself (encoder) or take values from `cross` (decoder).
    ///
    /// Returns (B, v_dim, L) re-masked output with the attention weights.
    pub fn forward_with_weights(
        &self,
        x: &Tensor,
        cross: Option<&Tensor>,
        mask: &Tensor,
    ) -> SegResult<AttentionOutput> {
        let query = self.query.forward(x)?;
        let key = self.key.forward(x)?;
        let value = match self.stage {
            Stage::Encoder => self.value.forward(x)?,
            Stage::Decoder => {
                let cross = cross.ok_or(SegError::MissingCrossInput)?;
                self.value.forward(cross)?
            }
        };

        let attended = self.window.attend(&query, &key, &value, mask)?;
        let output = self
            .output
            .forward(&attended.output.relu()?)?
            .broadcast_mul(&frame_mask(mask)?)?;

        Ok(AttentionOutput {
            output,
            weights: attended.weights,
        })
    }

    pub fn forward(&self, x: &Tensor, cross: Option<&Tensor>, mask: &Tensor) -> SegResult<Tensor> {
        Ok(self.forward_with_weights(x, cross, mask)?.output)
    }
}

/// Independently initialised heads, concatenated and projected back
#[derive(Debug)]
pub struct MultiHeadAttention {
    heads: Vec<AttentionLayer>,
    output: Conv1d,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(
        spec: &AttentionSpec,
        num_heads: usize,
        ctx: &ExecContext,
        vb: VarBuilder,
    ) -> SegResult<Self> {
        if num_heads == 0 {
            return Err(SegError::InvalidParameter(
                "multi-head attention needs at least one head".to_string(),
            ));
        }
        let heads = replicate(num_heads, |i| {
            AttentionLayer::new(spec, ctx, vb.pp(format!("head_{}", i)))
        })?;
        let output = candle_nn::conv1d(
            spec.v_dim * num_heads,
            spec.v_dim,
            1,
            Conv1dConfig::default(),
            vb.pp("output"),
        )?;

        Ok(Self {
            heads,
            output,
            dropout: Dropout::new(HEAD_DROPOUT),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }

    pub fn forward(
        &self,
        x: &Tensor,
        cross: Option<&Tensor>,
        mask: &Tensor,
        train: bool,
    ) -> SegResult<Tensor> {
        let outputs = self
            .heads
            .iter()
            .map(|head| head.forward(x, cross, mask))
            .collect::<SegResult<Vec<_>>>()?;
        let stacked = Tensor::cat(&outputs, 1)?;
        let dropped = self.dropout.forward(&stacked, train)?;
        Ok(self.output.forward(&dropped)?)
    }
}

/// Attention used inside an [`AttentionBlock`](crate::layers::AttentionBlock)
#[derive(Debug)]
pub enum AttentionUnit {
    Single(AttentionLayer),
    Multi(MultiHeadAttention),
}

impl AttentionUnit {
    pub fn new(
        spec: &AttentionSpec,
        num_heads: usize,
        ctx: &ExecContext,
        vb: VarBuilder,
    ) -> SegResult<Self> {
        if num_heads <= 1 {
            Ok(AttentionUnit::Single(AttentionLayer::new(spec, ctx, vb)?))
        } else {
            Ok(AttentionUnit::Multi(MultiHeadAttention::new(
                spec, num_heads, ctx, vb,
            )?))
        }
    }

    pub fn forward(
        &self,
        x: &Tensor,
        cross: Option<&Tensor>,
        mask: &Tensor,
        train: bool,
    ) -> SegResult<Tensor> {
        match self {
            AttentionUnit::Single(layer) => layer.forward(x, cross, mask),
            AttentionUnit::Multi(heads) => heads.forward(x, cross, mask, train),
        }
    }
}
