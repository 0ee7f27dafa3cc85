//! Poincaré ball geometry and the hyperbolic projection head
//!
//! The ball of curvature `c` is the open set `{x : |x| < 1/sqrt(c)}`. All
//! operations act on the last tensor axis and are written with candle
//! primitives so gradients flow through them.
//!
//! ```text
//! expmap0(u)      = tanh(sqrt(c)|u|) u / (sqrt(c)|u|)
//! logmap0(y)      = artanh(sqrt(c)|y|) y / (sqrt(c)|y|)
//! x (+) y         = ((1 + 2c<x,y> + c|y|^2) x + (1 - c|x|^2) y) / (1 + 2c<x,y> + c^2|x|^2|y|^2)
//! M (x) x         = tanh(|Mx|/|x| artanh(sqrt(c)|x|)) Mx / (|Mx| sqrt(c))
//! d(x, y)         = 2/sqrt(c) artanh(sqrt(c) |(-x) (+) y|)
//! ```

use crate::{SegError, SegResult};
use candle_core::{Tensor, D};
use candle_nn::{Dropout, Init, VarBuilder};
use serde::{Deserialize, Serialize};

/// Floor for vector norms that appear in denominators
pub const MIN_NORM: f64 = 1e-5;

/// Relative margin kept between projected points and the ball boundary
pub const BALL_EPS: f64 = 1e-3;

/// artanh arguments are clamped to (-1 + eps, 1 - eps)
const ARTANH_EPS: f64 = 1e-5;

/// Added to Möbius denominators
const MOBIUS_EPS: f64 = 1e-5;

/// Dropout inside the projection head
pub const HEAD_DROPOUT: f32 = 0.05;

/// Euclidean norm over the last axis, keeping it
pub fn norm_keepdim(x: &Tensor) -> SegResult<Tensor> {
    Ok(x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?)
}

/// Norm over the last axis with its square floored at `MIN_NORM^2`, so the
/// gradient of the square root stays finite at the origin
fn clamped_norm(x: &Tensor) -> SegResult<Tensor> {
    Ok(x
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .maximum(MIN_NORM * MIN_NORM)?
        .sqrt()?)
}

/// Inverse hyperbolic tangent with the argument clamped inside (-1, 1)
pub fn artanh(x: &Tensor) -> SegResult<Tensor> {
    let x = x.clamp(-1.0 + ARTANH_EPS, 1.0 - ARTANH_EPS)?;
    let log_plus = x.affine(1.0, 1.0)?.log()?;
    let log_minus = x.affine(-1.0, 1.0)?.log()?;
    Ok(((log_plus - log_minus)? * 0.5)?)
}

/// Poincaré ball with curvature `c`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoincareBall {
    c: f64,
}

impl PoincareBall {
    pub fn new(c: f64) -> SegResult<Self> {
        if !(c > 0.0 && c.is_finite()) {
            return Err(SegError::InvalidParameter(format!(
                "curvature must be positive, got {}",
                c
            )));
        }
        Ok(Self { c })
    }

    pub fn curvature(&self) -> f64 {
        self.c
    }

    /// Radius 1/sqrt(c) of the open ball
    pub fn radius(&self) -> f64 {
        1.0 / self.c.sqrt()
    }

    /// Largest norm a projected point may have
    pub fn max_norm(&self) -> f64 {
        (1.0 - BALL_EPS) / self.c.sqrt()
    }

    /// Pull points with norm above `max_norm` back onto that sphere
    pub fn project(&self, x: &Tensor) -> SegResult<Tensor> {
        let norm = clamped_norm(x)?;
        let max_norm = self.max_norm();
        let outside = norm.gt(max_norm)?.broadcast_as(x.shape())?;
        let projected = (x.broadcast_div(&norm)? * max_norm)?;
        Ok(outside.where_cond(&projected, x)?)
    }

    /// Exponential map at the origin
    pub fn expmap0(&self, u: &Tensor) -> SegResult<Tensor> {
        let scaled = (clamped_norm(u)? * self.c.sqrt())?;
        let factor = (scaled.tanh()? / &scaled)?;
        Ok(u.broadcast_mul(&factor)?)
    }

    /// Logarithmic map at the origin
    pub fn logmap0(&self, y: &Tensor) -> SegResult<Tensor> {
        let scaled = (clamped_norm(y)? * self.c.sqrt())?;
        let factor = (artanh(&scaled)? / &scaled)?;
        Ok(y.broadcast_mul(&factor)?)
    }

    /// Möbius addition `x (+) y`, broadcasting over leading axes
    pub fn mobius_add(&self, x: &Tensor, y: &Tensor) -> SegResult<Tensor> {
        let c = self.c;
        let x2 = x.sqr()?.sum_keepdim(D::Minus1)?;
        let y2 = y.sqr()?.sum_keepdim(D::Minus1)?;
        let xy = x.broadcast_mul(y)?.sum_keepdim(D::Minus1)?;

        let coef_x = (xy.affine(2.0 * c, 1.0)?.broadcast_add(&(&y2 * c)?))?;
        let coef_y = x2.affine(-c, 1.0)?;
        let num = x.broadcast_mul(&coef_x)?.broadcast_add(&y.broadcast_mul(&coef_y)?)?;

        let denom = xy
            .affine(2.0 * c, 1.0 + MOBIUS_EPS)?
            .broadcast_add(&(x2.broadcast_mul(&y2)? * (c * c))?)?;
        Ok(num.broadcast_div(&denom)?)
    }

    /// Möbius matrix-vector product for `x` (N, in) and `weight` (out, in)
    pub fn mobius_matvec(&self, weight: &Tensor, x: &Tensor) -> SegResult<Tensor> {
        let sqrt_c = self.c.sqrt();
        let x_norm = clamped_norm(x)?;
        let mx = x.matmul(&weight.t()?)?;
        let mx_norm = clamped_norm(&mx)?;

        let angle = (mx_norm.broadcast_div(&x_norm)? * artanh(&(&x_norm * sqrt_c)?)?)?;
        let scale = angle.tanh()?.broadcast_div(&(&mx_norm * sqrt_c)?)?;
        self.project(&mx.broadcast_mul(&scale)?)
    }

    /// Pairwise Möbius addition `(-x_i) (+) y_j`, shape (N, M, D)
    fn mobius_difference_batch(&self, x: &Tensor, y: &Tensor) -> SegResult<Tensor> {
        let c = self.c;
        let neg_x = x.neg()?;
        let xy = neg_x.matmul(&y.t()?)?; // (N, M)
        let x2 = neg_x.sqr()?.sum_keepdim(D::Minus1)?; // (N, 1)
        let y2 = y.sqr()?.sum_keepdim(D::Minus1)?.t()?; // (1, M)

        let coef_x = xy.affine(2.0 * c, 1.0)?.broadcast_add(&(&y2 * c)?)?; // (N, M)
        let coef_y = x2.affine(-c, 1.0)?; // (N, 1)
        let num = coef_x
            .unsqueeze(2)?
            .broadcast_mul(&neg_x.unsqueeze(1)?)?
            .broadcast_add(&coef_y.unsqueeze(2)?.broadcast_mul(&y.unsqueeze(0)?)?)?;

        let denom = xy
            .affine(2.0 * c, 1.0 + MOBIUS_EPS)?
            .broadcast_add(&(x2.broadcast_mul(&y2)? * (c * c))?)?;
        Ok(num.broadcast_div(&denom.unsqueeze(2)?)?)
    }

    /// Geodesic distances between every row of `x` (N, D) and `y` (M, D)
    pub fn dist_matrix(&self, x: &Tensor, y: &Tensor) -> SegResult<Tensor> {
        let sqrt_c = self.c.sqrt();
        let diff = self.mobius_difference_batch(x, y)?;
        let norm = clamped_norm(&diff)?.squeeze(D::Minus1)?;
        Ok((artanh(&(norm * sqrt_c)?)? * (2.0 / sqrt_c))?)
    }

    /// Map Euclidean vectors into the ball
    pub fn to_ball(&self, x: &Tensor) -> SegResult<Tensor> {
        self.project(&self.expmap0(x)?)
    }
}

/// Affine map in the ball: Möbius matvec followed by Möbius bias addition
#[derive(Debug)]
pub struct HypLinear {
    weight: Tensor,
    bias: Tensor,
    ball: PoincareBall,
}

impl HypLinear {
    pub fn new(in_dim: usize, out_dim: usize, ball: PoincareBall, vb: VarBuilder) -> SegResult<Self> {
        let weight = vb.get_with_hints(
            (out_dim, in_dim),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, ball })
    }

    /// `x` is (N, in_dim) inside the ball; output (N, out_dim) inside the ball
    pub fn forward(&self, x: &Tensor) -> SegResult<Tensor> {
        let mv = self.ball.mobius_matvec(&self.weight, x)?;
        let bias = self.ball.to_ball(&self.bias.unsqueeze(0)?)?;
        self.ball.project(&self.ball.mobius_add(&mv, &bias)?)
    }
}

/// Exponential map into the ball followed by three hyperbolic linear layers
#[derive(Debug)]
pub struct HyperbolicHead {
    fc1: HypLinear,
    fc2: HypLinear,
    fc3: HypLinear,
    dropout: Dropout,
    ball: PoincareBall,
    output_dim: usize,
}

impl HyperbolicHead {
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        ball: PoincareBall,
        dropout: f32,
        vb: VarBuilder,
    ) -> SegResult<Self> {
        Ok(Self {
            fc1: HypLinear::new(input_dim, input_dim, ball, vb.pp("fc1"))?,
            fc2: HypLinear::new(input_dim, input_dim, ball, vb.pp("fc2"))?,
            fc3: HypLinear::new(input_dim, output_dim, ball, vb.pp("fc3"))?,
            dropout: Dropout::new(dropout),
            ball,
            output_dim,
        })
    }

    pub fn ball(&self) -> &PoincareBall {
        &self.ball
    }

    /// (B, C, L) features to (B, L, output_dim) embeddings, one per frame
    pub fn forward(&self, features: &Tensor, train: bool) -> SegResult<Tensor> {
        let (batch, channels, len) = features.dims3()?;
        let x = features
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch * len, channels))?;

        let x = self.ball.to_ball(&x)?;
        let x = self.fc1.forward(&x)?.gelu_erf()?;
        let x = self.dropout.forward(&x, train)?;
        let x = self.fc2.forward(&x)?.gelu_erf()?;
        let x = self.dropout.forward(&x, train)?;
        let x = self.fc3.forward(&x)?;

        Ok(x.reshape((batch, len, self.output_dim))?)
    }
}
