//! Padding and window masks
//!
//! Sequences in a batch are right-padded with zeros up to the longest one.
//! A validity mask of shape (B, C, L) carries 1 on real frames and 0 on
//! padding; only its first channel is consulted. Sliding-window attention
//! additionally restricts every query to a local neighbourhood with a fixed
//! [`WindowMask`].

use crate::SegResult;
use candle_core::{DType, Device, Tensor};

/// First channel of a validity mask, shape (B, 1, L)
pub fn frame_mask(mask: &Tensor) -> SegResult<Tensor> {
    Ok(mask.narrow(1, 0, 1)?)
}

/// Build a (B, channels, max_len) validity mask from per-sample lengths
pub fn sequence_mask(
    lengths: &[usize],
    channels: usize,
    max_len: usize,
    dtype: DType,
    device: &Device,
) -> SegResult<Tensor> {
    let mut data = vec![0.0f32; lengths.len() * channels * max_len];
    for (b, &len) in lengths.iter().enumerate() {
        for c in 0..channels {
            let row = (b * channels + c) * max_len;
            for t in 0..len.min(max_len) {
                data[row + t] = 1.0;
            }
        }
    }
    let mask = Tensor::from_vec(data, (lengths.len(), channels, max_len), device)?;
    Ok(mask.to_dtype(dtype)?)
}

/// Key window pattern shared by every query of a block.
///
/// Shape (1, bl, bl + 2 * (bl / 2)). Every row is the union of the shifted
/// bands `i..i + bl` for `i` in `0..bl`, which spans the whole window: a
/// query in block `b` may attend to every key in
/// `[b * bl - bl / 2, (b + 1) * bl + bl / 2)`, limited only by the padding
/// mask. With `bl >= L` the single window holds the whole sequence.
#[derive(Debug, Clone)]
pub struct WindowMask {
    mask: Tensor,
    block_len: usize,
}

impl WindowMask {
    pub fn new(block_len: usize, dtype: DType, device: &Device) -> SegResult<Self> {
        let width = Self::window_width(block_len);
        let mut open = vec![0.0f32; width];
        for shift in 0..block_len {
            for col in open.iter_mut().skip(shift).take(block_len) {
                *col = 1.0;
            }
        }
        let data: Vec<f32> = (0..block_len).flat_map(|_| open.iter().copied()).collect();
        let mask = Tensor::from_vec(data, (1, block_len, width), device)?.to_dtype(dtype)?;
        Ok(Self { mask, block_len })
    }

    /// Key window length seen by one query block
    #[inline]
    pub fn window_width(block_len: usize) -> usize {
        block_len + 2 * (block_len / 2)
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn tensor(&self) -> &Tensor {
        &self.mask
    }
}
