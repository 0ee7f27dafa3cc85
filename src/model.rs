//! # Encoder/decoder cascade
//!
//! ```text
//! features ──► Encoder ──► logits_0, f_0
//!                              │
//!          softmax(logits_0)·m ▼  f_0·m
//!                          Decoder_0 ──► logits_1, f_1
//!                              │
//!                             ...
//!                              ▼
//!                          Decoder_{n-1} ──► logits_n, f_n ──► HyperbolicHead ──► embeddings
//! ```
//!
//! Every stage is a stack of [`AttentionBlock`]s with dilation 2^i. Decoders
//! cross-attend to the feature map of the stage before them.

use crate::attention::Stage;
use crate::config::SegmenterConfig;
use crate::hyperbolic::{HyperbolicHead, PoincareBall};
use crate::layers::{replicate, AttentionBlock, AttentionBlockConfig, ChannelDropout};
use crate::mask::frame_mask;
use crate::{ExecContext, SegError, SegResult};
use candle_core::Tensor;
use candle_nn::{Conv1d, Conv1dConfig, Module, VarBuilder, VarMap};

fn block_stack(
    config: &SegmenterConfig,
    stage: Stage,
    alpha: f64,
    ctx: &ExecContext,
    vb: VarBuilder,
) -> SegResult<Vec<AttentionBlock>> {
    replicate(config.num_layers, |i| {
        let block = AttentionBlockConfig {
            dilation: 1 << i,
            channels: config.num_f_maps,
            r1: config.r1,
            r2: config.r2,
            window: config.window,
            stage,
            alpha,
            num_heads: config.num_heads,
        };
        AttentionBlock::new(&block, ctx, vb.pp(format!("layer_{}", i)))
    })
}

/// Self-attending first stage over raw features
#[derive(Debug)]
pub struct Encoder {
    channel_dropout: ChannelDropout,
    conv_in: Conv1d,
    layers: Vec<AttentionBlock>,
    conv_out: Conv1d,
}

impl Encoder {
    pub fn new(config: &SegmenterConfig, ctx: &ExecContext, vb: VarBuilder) -> SegResult<Self> {
        let cfg = Conv1dConfig::default();
        Ok(Self {
            channel_dropout: ChannelDropout::new(config.channel_masking_rate)?,
            conv_in: candle_nn::conv1d(config.input_dim, config.num_f_maps, 1, cfg, vb.pp("conv_in"))?,
            layers: block_stack(config, Stage::Encoder, 1.0, ctx, vb.pp("layers"))?,
            conv_out: candle_nn::conv1d(config.num_f_maps, config.num_classes, 1, cfg, vb.pp("conv_out"))?,
        })
    }

    /// Returns (logits, features)
    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> SegResult<(Tensor, Tensor)> {
        let x = self.channel_dropout.forward(x, train)?;
        let mut feature = self.conv_in.forward(&x)?;
        for layer in &self.layers {
            feature = layer.forward(&feature, None, mask, train)?;
        }
        let logits = self.conv_out.forward(&feature)?.broadcast_mul(&frame_mask(mask)?)?;
        Ok((logits, feature))
    }
}

/// Refinement stage over the previous stage's class probabilities
#[derive(Debug)]
pub struct Decoder {
    conv_in: Conv1d,
    layers: Vec<AttentionBlock>,
    conv_out: Conv1d,
    alpha: f64,
}

impl Decoder {
    pub fn new(
        config: &SegmenterConfig,
        alpha: f64,
        ctx: &ExecContext,
        vb: VarBuilder,
    ) -> SegResult<Self> {
        let cfg = Conv1dConfig::default();
        Ok(Self {
            conv_in: candle_nn::conv1d(config.num_classes, config.num_f_maps, 1, cfg, vb.pp("conv_in"))?,
            layers: block_stack(config, Stage::Decoder, alpha, ctx, vb.pp("layers"))?,
            conv_out: candle_nn::conv1d(config.num_f_maps, config.num_classes, 1, cfg, vb.pp("conv_out"))?,
            alpha,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Returns (logits, features)
    pub fn forward(
        &self,
        probs: &Tensor,
        cross: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> SegResult<(Tensor, Tensor)> {
        let mut feature = self.conv_in.forward(probs)?;
        for layer in &self.layers {
            feature = layer.forward(&feature, Some(cross), mask, train)?;
        }
        let logits = self.conv_out.forward(&feature)?.broadcast_mul(&frame_mask(mask)?)?;
        Ok((logits, feature))
    }
}

/// Result of one cascade pass
#[derive(Debug, Clone)]
pub struct CascadeOutput {
    /// Encoder logits first, then one entry per decoder; each (B, classes, L)
    pub stage_logits: Vec<Tensor>,
    /// Final stage features (B, F, L)
    pub features: Tensor,
    /// Per-frame ball embeddings (B, L, output_dim)
    pub embeddings: Tensor,
}

impl CascadeOutput {
    /// Logits of the last refinement stage
    pub fn final_logits(&self) -> SegResult<&Tensor> {
        self.stage_logits.last().ok_or(SegError::EmptySequence)
    }

    /// Arg-max class per frame of the last stage, shape (B, L)
    pub fn predictions(&self) -> SegResult<Tensor> {
        Ok(self.final_logits()?.argmax(1)?)
    }
}

/// Encoder, decoder chain and hyperbolic head
#[derive(Debug)]
pub struct SegmentationTransformer {
    config: SegmenterConfig,
    encoder: Encoder,
    decoders: Vec<Decoder>,
    head: HyperbolicHead,
}

impl SegmentationTransformer {
    pub fn new(config: SegmenterConfig, ctx: &ExecContext, vb: VarBuilder) -> SegResult<Self> {
        config.validate()?;
        let encoder = Encoder::new(&config, ctx, vb.pp("encoder"))?;
        let decoders = replicate(config.num_decoders, |s| {
            Decoder::new(&config, config.decoder_alpha(s), ctx, vb.pp(format!("decoder_{}", s)))
        })?;
        let ball = PoincareBall::new(config.curvature)?;
        let head = HyperbolicHead::new(
            config.num_f_maps,
            config.output_dim,
            ball,
            config.head_dropout,
            vb.pp("head"),
        )?;

        Ok(Self {
            config,
            encoder,
            decoders,
            head,
        })
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    pub fn decoders(&self) -> &[Decoder] {
        &self.decoders
    }

    pub fn ball(&self) -> &PoincareBall {
        self.head.ball()
    }

    /// `x` (B, input_dim, L), `mask` (B, _, L)
    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> SegResult<CascadeOutput> {
        let (_, channels, _) = x.dims3()?;
        if channels != self.config.input_dim {
            return Err(SegError::DimensionMismatch {
                expected: self.config.input_dim,
                got: channels,
            });
        }
        let valid = frame_mask(mask)?;

        let (mut logits, mut feature) = self.encoder.forward(x, mask, train)?;
        let mut stage_logits = Vec::with_capacity(1 + self.decoders.len());
        stage_logits.push(logits.clone());

        for decoder in &self.decoders {
            let probs = candle_nn::ops::softmax(&logits, 1)?.broadcast_mul(&valid)?;
            let cross = feature.broadcast_mul(&valid)?;
            (logits, feature) = decoder.forward(&probs, &cross, mask, train)?;
            stage_logits.push(logits.clone());
        }

        let embeddings = self.head.forward(&feature, train)?;
        Ok(CascadeOutput {
            stage_logits,
            features: feature,
            embeddings,
        })
    }
}

/// Total scalar count over every variable in `varmap`
pub fn num_parameters(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}
