//! Building blocks shared by the encoder and decoders

use crate::attention::{AttentionSpec, AttentionUnit, Stage, WindowKind};
use crate::mask::frame_mask;
use crate::norm::InstanceNorm;
use crate::{ExecContext, SegError, SegResult};
use candle_core::Tensor;
use candle_nn::{Conv1d, Conv1dConfig, Dropout, Module, VarBuilder};

/// Dropout after the block's 1x1 projection
pub const BLOCK_DROPOUT: f32 = 0.5;

/// Build `count` independently initialised instances.
///
/// Each call to `build` receives its index and is expected to register its
/// parameters under a distinct prefix, so no two instances share weights.
pub fn replicate<T, F>(count: usize, mut build: F) -> SegResult<Vec<T>>
where
    F: FnMut(usize) -> SegResult<T>,
{
    let mut items = Vec::with_capacity(count);
    for i in 0..count {
        items.push(build(i)?);
    }
    Ok(items)
}

/// Dilated kernel-3 convolution with "same" padding, followed by ReLU.
///
/// The input is zero-padded by `dilation` on both sides before an unpadded
/// convolution, so sequences shorter than `2 * dilation` still backpropagate.
#[derive(Debug)]
pub struct ConvFeedForward {
    conv: Conv1d,
    dilation: usize,
}

impl ConvFeedForward {
    pub fn new(
        dilation: usize,
        in_channels: usize,
        out_channels: usize,
        vb: VarBuilder,
    ) -> SegResult<Self> {
        let cfg = Conv1dConfig {
            padding: 0,
            dilation,
            ..Default::default()
        };
        let conv = candle_nn::conv1d(in_channels, out_channels, 3, cfg, vb.pp("conv"))?;
        Ok(Self { conv, dilation })
    }

    pub fn forward(&self, x: &Tensor) -> SegResult<Tensor> {
        let padded = x.pad_with_zeros(2, self.dilation, self.dilation)?;
        Ok(self.conv.forward(&padded)?.relu()?)
    }
}

/// Zeroes whole input channels per sample during training
#[derive(Debug, Clone, Copy)]
pub struct ChannelDropout {
    rate: f64,
}

impl ChannelDropout {
    pub fn new(rate: f64) -> SegResult<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(SegError::InvalidParameter(format!(
                "channel masking rate {} outside [0, 1)",
                rate
            )));
        }
        Ok(Self { rate })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// `x` is (B, C, L); each (b, c) row survives with probability 1 - rate
    pub fn forward(&self, x: &Tensor, train: bool) -> SegResult<Tensor> {
        if !train || self.rate <= 0.0 {
            return Ok(x.clone());
        }
        let (batch, channels, _) = x.dims3()?;
        let keep = Tensor::rand(0f32, 1f32, (batch, channels, 1), x.device())?
            .ge(self.rate)?
            .to_dtype(x.dtype())?;
        let scale = (keep / (1.0 - self.rate))?;
        Ok(x.broadcast_mul(&scale)?)
    }
}

/// Parameters of one residual attention block
#[derive(Debug, Clone, Copy)]
pub struct AttentionBlockConfig {
    /// Convolution dilation, also the attention block length
    pub dilation: usize,
    pub channels: usize,
    pub r1: usize,
    pub r2: usize,
    pub window: WindowKind,
    pub stage: Stage,
    /// Weight of the attention branch
    pub alpha: f64,
    pub num_heads: usize,
}

/// Dilated feed-forward, normalised attention mixed in with weight alpha,
/// 1x1 projection, dropout, and a residual back to the block input.
#[derive(Debug)]
pub struct AttentionBlock {
    feed_forward: ConvFeedForward,
    norm: InstanceNorm,
    attention: AttentionUnit,
    conv_1x1: Conv1d,
    dropout: Dropout,
    alpha: f64,
}

impl AttentionBlock {
    pub fn new(config: &AttentionBlockConfig, ctx: &ExecContext, vb: VarBuilder) -> SegResult<Self> {
        let feed_forward = ConvFeedForward::new(
            config.dilation,
            config.channels,
            config.channels,
            vb.pp("feed_forward"),
        )?;
        let spec = AttentionSpec {
            q_dim: config.channels,
            k_dim: config.channels,
            v_dim: config.channels,
            r1: config.r1,
            r2: config.r1,
            r3: config.r2,
            block_len: config.dilation,
            stage: config.stage,
            window: config.window,
        };
        let attention = AttentionUnit::new(&spec, config.num_heads, ctx, vb.pp("attention"))?;
        let conv_1x1 = candle_nn::conv1d(
            config.channels,
            config.channels,
            1,
            Conv1dConfig::default(),
            vb.pp("conv_1x1"),
        )?;

        Ok(Self {
            feed_forward,
            norm: InstanceNorm::default(),
            attention,
            conv_1x1,
            dropout: Dropout::new(BLOCK_DROPOUT),
            alpha: config.alpha,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn forward(
        &self,
        x: &Tensor,
        cross: Option<&Tensor>,
        mask: &Tensor,
        train: bool,
    ) -> SegResult<Tensor> {
        let out = self.feed_forward.forward(x)?;
        let attended = self
            .attention
            .forward(&self.norm.forward(&out)?, cross, mask, train)?;
        let out = ((attended * self.alpha)? + out)?;
        let out = self.conv_1x1.forward(&out)?;
        let out = self.dropout.forward(&out, train)?;
        Ok((x + out)?.broadcast_mul(&frame_mask(mask)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    #[test]
    fn test_replicate_indices() {
        let items = replicate(4, |i| Ok(i * 10)).unwrap();
        assert_eq!(items, vec![0, 10, 20, 30]);

        let failing: SegResult<Vec<usize>> = replicate(3, |i| {
            if i == 1 {
                Err(SegError::InvalidParameter("boom".to_string()))
            } else {
                Ok(i)
            }
        });
        assert!(failing.is_err());
    }

    #[test]
    fn test_feed_forward_keeps_length() {
        let ctx = ExecContext::cpu();
        let varmap = VarMap::new();
        for dilation in [1, 2, 8] {
            let ff = ConvFeedForward::new(dilation, 6, 6, ctx.var_builder(&varmap).pp(format!("ff{}", dilation)))
                .unwrap();
            let x = Tensor::randn(0f32, 1.0, (1, 6, 13), ctx.device()).unwrap();
            let y = ff.forward(&x).unwrap();
            assert_eq!(y.dims(), &[1, 6, 13]);
            let min = y.flatten_all().unwrap().min(0).unwrap().to_scalar::<f32>().unwrap();
            assert!(min >= 0.0);
        }
    }

    #[test]
    fn test_feed_forward_backward_on_short_sequences() {
        let ctx = ExecContext::cpu();
        let varmap = VarMap::new();
        for (dilation, len) in [(4, 8), (4, 9), (8, 3), (512, 20)] {
            let ff = ConvFeedForward::new(dilation, 3, 3, ctx.var_builder(&varmap).pp(format!("short{}_{}", dilation, len)))
                .unwrap();
            let x = Tensor::randn(0f32, 1.0, (1, 3, len), ctx.device()).unwrap();
            let y = ff.forward(&x).unwrap();
            assert_eq!(y.dims(), &[1, 3, len]);

            let grads = y.sum_all().unwrap().backward().unwrap();
            let weight = varmap
                .data()
                .lock()
                .unwrap()
                .get(&format!("short{}_{}.conv.weight", dilation, len))
                .unwrap()
                .as_tensor()
                .clone();
            assert!(grads.get(&weight).is_some(), "dilation {} len {}", dilation, len);
        }
    }

    #[test]
    fn test_channel_dropout_eval_is_identity() {
        let device = candle_core::Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 5, 3), &device).unwrap();
        let dropout = ChannelDropout::new(0.3).unwrap();
        let y = dropout.forward(&x, false).unwrap();
        let diff = (x - y).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(diff, 0.0);
        assert!(ChannelDropout::new(1.0).is_err());
    }

    #[test]
    fn test_channel_dropout_drops_whole_channels() {
        let device = candle_core::Device::Cpu;
        let x = Tensor::ones((1, 64, 8), DType::F32, &device).unwrap();
        let y = ChannelDropout::new(0.5).unwrap().forward(&x, true).unwrap();
        let rows: Vec<Vec<f32>> = y.squeeze(0).unwrap().to_vec2().unwrap();
        for row in rows {
            let first = row[0];
            assert!(first == 0.0 || (first - 2.0).abs() < 1e-6);
            assert!(row.iter().all(|&v| v == first));
        }
    }

    #[test]
    fn test_attention_block_masks_padding() {
        let ctx = ExecContext::cpu();
        let varmap = VarMap::new();
        let config = AttentionBlockConfig {
            dilation: 2,
            channels: 8,
            r1: 2,
            r2: 2,
            window: WindowKind::Block,
            stage: Stage::Encoder,
            alpha: 1.0,
            num_heads: 1,
        };
        let block = AttentionBlock::new(&config, &ctx, ctx.var_builder(&varmap)).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 8, 9), ctx.device()).unwrap();
        let mask = crate::mask::sequence_mask(&[9, 5], 8, 9, DType::F32, ctx.device()).unwrap();
        let y = block.forward(&x, None, &mask, false).unwrap();
        assert_eq!(y.dims(), &[2, 8, 9]);

        let padded = y.get(1).unwrap().narrow(1, 5, 4).unwrap();
        let total = padded.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(total, 0.0);
    }
}
