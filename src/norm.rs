//! # Instance Normalization
//!
//! Normalizes every (sample, channel) row of a (B, C, L) sequence over its
//! length axis. There are no learnable parameters and no running
//! statistics, so train and eval behave the same.
//!
//! ## Formula
//! ```text
//! InstanceNorm(x)[b, c, t] = (x[b, c, t] - mean_t(x[b, c])) / sqrt(var_t(x[b, c]) + eps)
//! ```

use candle_core::{Result as CandleResult, Tensor, D};

/// Instance normalization over the last (time) axis
#[derive(Debug, Clone, Copy)]
pub struct InstanceNorm {
    eps: f64,
}

impl InstanceNorm {
    pub const DEFAULT_EPS: f64 = 1e-5;

    pub fn new(eps: f64) -> Self {
        Self { eps }
    }

    /// Forward pass over a (B, C, L) tensor
    pub fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;

        // Biased variance, as in the usual instance norm
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;

        centered.broadcast_div(&std)
    }
}

impl Default for InstanceNorm {
    fn default() -> Self {
        Self::new(Self::DEFAULT_EPS)
    }
}
