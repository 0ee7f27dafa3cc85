//! # Hierarchical embedding objective
//!
//! Works on one sequence at a time: `embeddings` (L, D) inside the Poincaré
//! ball and the frame labels of the same sequence. Labels split the sequence
//! into segments; the objective then combines
//!
//! - a contrastive term over frames sampled from each segment,
//! - a center term pulling segment starts toward the origin,
//! - a norm-ordering term scoring every parent/child pair by
//!   `-relu(|child| - |parent| + margin)`, so a child whose norm exceeds its
//!   parent's norm minus the margin is penalised,
//! - an optional tree term over hyperbolic distances between consecutive
//!   parent/child frames.
//!
//! [`stage_supervision_loss`] is the per-stage classification loss used
//! alongside it during training.

use crate::config::{HierarchicalLossConfig, SingleFramePolicy};
use crate::hyperbolic::{norm_keepdim, PoincareBall};
use crate::mask::frame_mask;
use crate::{SegError, SegResult};
use candle_core::{DType, Tensor, D};
use rand::Rng;
use std::ops::Range;

/// Target value for padded frames
pub const IGNORE_INDEX: i64 = -100;

/// Upper clamp on the squared log-probability jump between frames
pub const SMOOTHING_CLAMP: f64 = 16.0;

/// Maximal runs of equal labels.
///
/// ```text
/// labels  0 0 0 1 1 2 2 2 2
/// ends        2   4       8
/// starts  0     3   5
/// cuts          3   5       9
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentBoundaries {
    ends: Vec<usize>,
}

impl SegmentBoundaries {
    pub fn from_labels<T: PartialEq>(labels: &[T]) -> SegResult<Self> {
        if labels.is_empty() {
            return Err(SegError::EmptySequence);
        }
        let last = labels.len() - 1;
        let mut ends: Vec<usize> = labels
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| pair[0] != pair[1])
            .map(|(i, _)| i)
            .collect();
        ends.push(last);
        Ok(Self { ends })
    }

    /// Last index of every segment
    pub fn ends(&self) -> &[usize] {
        &self.ends
    }

    /// First index of every segment
    pub fn starts(&self) -> Vec<usize> {
        std::iter::once(0)
            .chain(self.ends.iter().take(self.ends.len() - 1).map(|&e| e + 1))
            .collect()
    }

    /// Exclusive segment ends; the last one equals the sequence length
    pub fn cut_points(&self) -> Vec<usize> {
        self.ends.iter().map(|&e| e + 1).collect()
    }

    pub fn segments(&self) -> Vec<Range<usize>> {
        self.starts()
            .into_iter()
            .zip(self.cut_points())
            .map(|(s, e)| s..e)
            .collect()
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    pub fn sequence_len(&self) -> usize {
        self.ends.last().map_or(0, |&e| e + 1)
    }
}

/// Parent (earlier) and child (later) frames of every consecutive pair
/// inside one segment; empty for single-frame segments
pub fn parent_child_pairs(segment: &Range<usize>) -> (Vec<u32>, Vec<u32>) {
    let parents = (segment.start..segment.end.saturating_sub(1)).map(|i| i as u32).collect();
    let children = (segment.start + 1..segment.end).map(|i| i as u32).collect();
    (parents, children)
}

/// `-mean(diag(log_softmax(sim, -1)))` for a square similarity matrix
pub fn cross_entropy_similarity(sim: &Tensor) -> SegResult<Tensor> {
    let (rows, cols) = sim.dims2()?;
    if rows != cols {
        return Err(SegError::DimensionMismatch {
            expected: rows,
            got: cols,
        });
    }
    let log_probs = candle_nn::ops::log_softmax(sim, D::Minus1)?;
    let eye = Tensor::eye(rows, log_probs.dtype(), log_probs.device())?;
    let diag = (log_probs * eye)?.sum(D::Minus1)?;
    Ok(diag.mean_all()?.neg()?)
}

/// Cross-entropy over the scores `s[i][j] = -relu(|child_j| - |parent_i| + margin)`
/// with the matching pair on the diagonal. A pair scores 0 once
/// `|child| <= |parent| - margin`.
pub fn norm_ordering_loss(parent_norms: &Tensor, child_norms: &Tensor, margin: f64) -> SegResult<Tensor> {
    let rows = parent_norms.unsqueeze(1)?;
    let cols = child_norms.unsqueeze(0)?;
    let score = (cols.broadcast_sub(&rows)? + margin)?.relu()?.neg()?;
    cross_entropy_similarity(&score)
}

/// Contrastive loss over negated Poincaré distances from children to parents
pub fn tree_loss(parent: &Tensor, child: &Tensor, ball: &PoincareBall) -> SegResult<Tensor> {
    let dist = ball.dist_matrix(child, parent)?;
    cross_entropy_similarity(&dist.neg()?)
}

/// Negative mean norm of the segment-start embeddings
pub fn center_loss(embeddings: &Tensor, boundaries: &SegmentBoundaries) -> SegResult<Tensor> {
    let starts: Vec<u32> = boundaries.starts().into_iter().map(|i| i as u32).collect();
    let index = Tensor::new(starts.as_slice(), embeddings.device())?;
    let norms = norm_keepdim(&embeddings.index_select(&index, 0)?)?;
    Ok(norms.mean_all()?.neg()?)
}

fn scalar(t: &Tensor) -> SegResult<f32> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

fn mean_of(terms: &[Tensor]) -> SegResult<Tensor> {
    Ok(Tensor::stack(terms, 0)?.mean_all()?)
}

/// Scalar components of one hierarchical loss evaluation
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Differentiable objective
    pub total: Tensor,
    pub contrastive: f32,
    pub center: f32,
    pub norm: f32,
    pub tree: f32,
    /// Contrastive rounds and norm segments discarded as non-finite
    pub dropped_rounds: usize,
    /// Segments with no parent/child pair
    pub skipped_segments: usize,
}

impl LossBreakdown {
    /// Mean of several breakdowns (one per sequence in a batch)
    pub fn average(parts: &[LossBreakdown]) -> SegResult<Self> {
        if parts.is_empty() {
            return Err(SegError::EmptySequence);
        }
        let n = parts.len() as f32;
        let totals: Vec<Tensor> = parts.iter().map(|p| p.total.clone()).collect();
        Ok(Self {
            total: mean_of(&totals)?,
            contrastive: parts.iter().map(|p| p.contrastive).sum::<f32>() / n,
            center: parts.iter().map(|p| p.center).sum::<f32>() / n,
            norm: parts.iter().map(|p| p.norm).sum::<f32>() / n,
            tree: parts.iter().map(|p| p.tree).sum::<f32>() / n,
            dropped_rounds: parts.iter().map(|p| p.dropped_rounds).sum(),
            skipped_segments: parts.iter().map(|p| p.skipped_segments).sum(),
        })
    }
}

/// Contrastive + center + norm-ordering (+ weighted tree) objective
#[derive(Debug, Clone)]
pub struct HierarchicalLoss {
    config: HierarchicalLossConfig,
    ball: PoincareBall,
}

impl HierarchicalLoss {
    pub fn new(config: HierarchicalLossConfig) -> SegResult<Self> {
        let ball = PoincareBall::new(config.curvature)?;
        if config.tree_batch == 0 {
            return Err(SegError::InvalidParameter("tree_batch must be at least 1".into()));
        }
        Ok(Self { config, ball })
    }

    pub fn config(&self) -> &HierarchicalLossConfig {
        &self.config
    }

    /// Sampling rounds: every segment contributes one frame pair per round,
    /// `ceil(L / segments)` rounds in total. Non-finite rounds are dropped.
    pub fn contrastive<R: Rng + ?Sized>(
        &self,
        embeddings: &Tensor,
        boundaries: &SegmentBoundaries,
        rng: &mut R,
    ) -> SegResult<(Tensor, usize)> {
        let segments = boundaries.segments();
        let rounds = boundaries.sequence_len().div_ceil(segments.len());
        let device = embeddings.device();

        let mut kept = Vec::with_capacity(rounds);
        let mut dropped = 0;
        for round in 0..rounds {
            let first: Vec<u32> = segments.iter().map(|s| rng.gen_range(s.clone()) as u32).collect();
            let second: Vec<u32> = segments.iter().map(|s| rng.gen_range(s.clone()) as u32).collect();
            let a = embeddings.index_select(&Tensor::new(first.as_slice(), device)?, 0)?;
            let b = embeddings.index_select(&Tensor::new(second.as_slice(), device)?, 0)?;
            let loss = cross_entropy_similarity(&a.matmul(&b.t()?)?)?;
            if scalar(&loss)?.is_finite() {
                kept.push(loss);
            } else {
                log::warn!("contrastive round {} is not finite, dropping it", round);
                dropped += 1;
            }
        }
        if kept.is_empty() {
            return Err(SegError::NumericalDegeneracy(
                "every contrastive sampling round was non-finite".into(),
            ));
        }
        Ok((mean_of(&kept)?, dropped))
    }

    /// Evaluate on one sequence: `embeddings` (L, D), `labels` of length L
    pub fn compute<T: PartialEq, R: Rng + ?Sized>(
        &self,
        embeddings: &Tensor,
        labels: &[T],
        rng: &mut R,
    ) -> SegResult<LossBreakdown> {
        let (len, _) = embeddings.dims2()?;
        if len != labels.len() {
            return Err(SegError::DimensionMismatch {
                expected: len,
                got: labels.len(),
            });
        }
        let boundaries = SegmentBoundaries::from_labels(labels)?;
        let device = embeddings.device();

        let (contrastive, mut dropped) = self.contrastive(embeddings, &boundaries, rng)?;
        let center = center_loss(embeddings, &boundaries)?;

        let mut norm_terms = Vec::new();
        let mut tree_parents = Vec::new();
        let mut tree_children = Vec::new();
        let mut skipped = 0;
        for (i, segment) in boundaries.segments().iter().enumerate() {
            let (parents, children) = parent_child_pairs(segment);
            if parents.is_empty() {
                match self.config.single_frame_policy {
                    SingleFramePolicy::Skip => {
                        log::warn!("segment {} at frame {} has a single frame, skipping", i, segment.start);
                        skipped += 1;
                        continue;
                    }
                    SingleFramePolicy::Error => {
                        return Err(SegError::NumericalDegeneracy(format!(
                            "segment {} at frame {} has a single frame",
                            i, segment.start
                        )));
                    }
                }
            }
            let parent = embeddings.index_select(&Tensor::new(parents.as_slice(), device)?, 0)?;
            let child = embeddings.index_select(&Tensor::new(children.as_slice(), device)?, 0)?;
            let loss = norm_ordering_loss(
                &norm_keepdim(&parent)?.squeeze(1)?,
                &norm_keepdim(&child)?.squeeze(1)?,
                self.config.norm_margin,
            )?;
            if scalar(&loss)?.is_finite() {
                norm_terms.push(loss);
            } else {
                log::warn!("norm ordering for segment {} is not finite, dropping it", i);
                dropped += 1;
            }
            tree_parents.extend(parents);
            tree_children.extend(children);
        }

        let norm = if norm_terms.is_empty() {
            Tensor::zeros((), embeddings.dtype(), device)?
        } else {
            mean_of(&norm_terms)?
        };
        let tree = self.tree_term(embeddings, &tree_parents, &tree_children)?;

        let mut total = ((&contrastive + &center)? + &norm)?;
        if self.config.tree_weight > 0.0 {
            total = (total + (&tree * self.config.tree_weight)?)?;
        }

        Ok(LossBreakdown {
            contrastive: scalar(&contrastive)?,
            center: scalar(&center)?,
            norm: scalar(&norm)?,
            tree: scalar(&tree)?,
            total,
            dropped_rounds: dropped,
            skipped_segments: skipped,
        })
    }

    fn tree_term(&self, embeddings: &Tensor, parents: &[u32], children: &[u32]) -> SegResult<Tensor> {
        let device = embeddings.device();
        let mut terms = Vec::new();
        for (p, c) in parents
            .chunks(self.config.tree_batch)
            .zip(children.chunks(self.config.tree_batch))
        {
            let parent = embeddings.index_select(&Tensor::new(p, device)?, 0)?;
            let child = embeddings.index_select(&Tensor::new(c, device)?, 0)?;
            let loss = tree_loss(&parent, &child, &self.ball)?;
            if scalar(&loss)?.is_finite() {
                terms.push(loss);
            }
        }
        if terms.is_empty() {
            return Ok(Tensor::zeros((), embeddings.dtype(), device)?);
        }
        mean_of(&terms)
    }

    /// Average over a batch: `embeddings` (B, L, D), `targets` (B, L) with
    /// padding marked by [`IGNORE_INDEX`]
    pub fn compute_batch<R: Rng + ?Sized>(
        &self,
        embeddings: &Tensor,
        targets: &Tensor,
        rng: &mut R,
    ) -> SegResult<LossBreakdown> {
        let (batch, len, _) = embeddings.dims3()?;
        let labels: Vec<Vec<i64>> = targets.to_dtype(DType::I64)?.to_vec2()?;
        if labels.len() != batch {
            return Err(SegError::BatchSizeMismatch {
                expected: batch,
                got: labels.len(),
            });
        }
        let mut parts = Vec::with_capacity(batch);
        for (b, row) in labels.iter().enumerate() {
            let valid = row.iter().take(len).take_while(|&&t| t != IGNORE_INDEX).count();
            if valid == 0 {
                continue;
            }
            let sequence = embeddings.get(b)?.narrow(0, 0, valid)?;
            parts.push(self.compute(&sequence, &row[..valid], rng)?);
        }
        LossBreakdown::average(&parts)
    }
}

/// Sum over stages of frame cross-entropy plus a truncated temporal
/// smoothing term.
///
/// `stage_logits` each (B, classes, L); `targets` (B, L) with padded frames
/// set to [`IGNORE_INDEX`]; `mask` (B, _, L).
pub fn stage_supervision_loss(
    stage_logits: &[Tensor],
    targets: &Tensor,
    mask: &Tensor,
    smoothing_weight: f64,
) -> SegResult<Tensor> {
    let targets = targets.to_dtype(DType::I64)?.flatten_all()?;
    let valid = targets.ge(0f64)?;
    let safe_targets = valid.where_cond(&targets, &targets.zeros_like()?)?;
    let frame_valid = frame_mask(mask)?;

    let mut total: Option<Tensor> = None;
    for logits in stage_logits {
        let (batch, classes, len) = logits.dims3()?;
        let valid_f = valid.to_dtype(logits.dtype())?;
        let count = scalar(&valid_f.sum_all()?)?;
        if count == 0.0 {
            continue;
        }

        let flat = logits.transpose(1, 2)?.contiguous()?.reshape((batch * len, classes))?;
        let log_probs = candle_nn::ops::log_softmax(&flat, D::Minus1)?;
        let picked = log_probs.gather(&safe_targets.unsqueeze(1)?, 1)?.squeeze(1)?;
        let mut loss = ((picked * &valid_f)?.sum_all()? / count as f64)?.neg()?;

        if smoothing_weight > 0.0 && len > 1 {
            let log_probs = candle_nn::ops::log_softmax(logits, 1)?;
            let next = log_probs.narrow(2, 1, len - 1)?;
            let prev = log_probs.narrow(2, 0, len - 1)?.detach();
            let jump = (next - prev)?.sqr()?.clamp(0.0, SMOOTHING_CLAMP)?;
            let weight = frame_valid.narrow(2, 1, len - 1)?.to_dtype(jump.dtype())?;
            let smooth = jump.broadcast_mul(&weight)?.mean_all()?;
            loss = (loss + (smooth * smoothing_weight)?)?;
        }

        total = Some(match total {
            Some(t) => (t + loss)?,
            None => loss,
        });
    }

    match total {
        Some(t) => Ok(t),
        None => Err(SegError::EmptySequence),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ball_points(n: usize, d: usize) -> Tensor {
        let ball = PoincareBall::new(1.0).unwrap();
        let x = Tensor::randn(0f32, 1.0, (n, d), &Device::Cpu).unwrap();
        ball.to_ball(&x).unwrap()
    }

    #[test]
    fn test_boundaries() {
        let b = SegmentBoundaries::from_labels(&[0, 0, 0, 1, 1, 2, 2, 2, 2]).unwrap();
        assert_eq!(b.ends(), &[2, 4, 8]);
        assert_eq!(b.starts(), vec![0, 3, 5]);
        assert_eq!(b.cut_points(), vec![3, 5, 9]);
        assert_eq!(b.segments(), vec![0..3, 3..5, 5..9]);
        assert_eq!(b.len(), 3);
        assert_eq!(b.sequence_len(), 9);
    }

    #[test]
    fn test_boundaries_wraparound_and_single() {
        // same label at both ends still closes the last segment at L - 1
        let b = SegmentBoundaries::from_labels(&[4, 1, 4]).unwrap();
        assert_eq!(b.ends(), &[0, 1, 2]);

        let one = SegmentBoundaries::from_labels(&[7]).unwrap();
        assert_eq!(one.segments(), vec![0..1]);

        let empty: [i64; 0] = [];
        assert!(matches!(
            SegmentBoundaries::from_labels(&empty),
            Err(SegError::EmptySequence)
        ));
    }

    #[test]
    fn test_parent_child_pairs() {
        let (p, c) = parent_child_pairs(&(3..6));
        assert_eq!(p, vec![3, 4]);
        assert_eq!(c, vec![4, 5]);
        let (p, c) = parent_child_pairs(&(2..3));
        assert!(p.is_empty() && c.is_empty());
    }

    #[test]
    fn test_cross_entropy_similarity() {
        let device = Device::Cpu;
        // uniform rows: -log(1/n)
        let sim = Tensor::zeros((4, 4), DType::F32, &device).unwrap();
        let loss = cross_entropy_similarity(&sim).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);

        // strongly diagonal: near zero
        let eye = (Tensor::eye(3, DType::F32, &device).unwrap() * 50.0).unwrap();
        let loss = cross_entropy_similarity(&eye).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss < 1e-4);

        let rect = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        assert!(cross_entropy_similarity(&rect).is_err());
    }

    #[test]
    fn test_norm_ordering_hand_computed() {
        let device = Device::Cpu;
        // scores: row 0 (parent .5) = [0, 0]; row 1 (parent .2) = [-.1, -.2]
        let parents = Tensor::new(&[0.5f32, 0.2], &device).unwrap();
        let children = Tensor::new(&[0.3f32, 0.4], &device).unwrap();
        let loss = norm_ordering_loss(&parents, &children, 0.0).unwrap().to_scalar::<f32>().unwrap();
        let row0 = 2f32.ln();
        let row1 = 0.2 + ((-0.1f32).exp() + (-0.2f32).exp()).ln();
        let expected = (row0 + row1) / 2.0;
        assert!((loss - expected).abs() < 1e-4, "got {} expected {}", loss, expected);
        assert!((loss - 0.71877).abs() < 1e-3);
    }

    #[test]
    fn test_norm_ordering_margin_and_direction() {
        let device = Device::Cpu;
        let parents = Tensor::new(&[0.6f32, 0.7, 0.8], &device).unwrap();
        // every child at least `margin` below every parent: all scores 0, uniform rows
        let inside = Tensor::new(&[0.1f32, 0.2, 0.3], &device).unwrap();
        let flat = norm_ordering_loss(&parents, &inside, 0.01).unwrap().to_scalar::<f32>().unwrap();
        assert!((flat - 3f32.ln()).abs() < 1e-5);

        // a single pair is its own softmax row, whatever its score
        let p = Tensor::new(&[0.3f32], &device).unwrap();
        let c = Tensor::new(&[0.3f32], &device).unwrap();
        let single = norm_ordering_loss(&p, &c, 0.01).unwrap().to_scalar::<f32>().unwrap();
        assert!(single.abs() < 1e-6);

        let parents = Tensor::new(&[0.3f32, 0.1], &device).unwrap();
        let children = Tensor::new(&[0.35f32, 0.05], &device).unwrap();
        // row 0: [-.06, 0]; row 1: [-.26, 0]
        let loss = norm_ordering_loss(&parents, &children, 0.01).unwrap().to_scalar::<f32>().unwrap();
        let row0 = 0.06 + (((-0.06f32).exp()) + 1.0).ln();
        let row1 = (((-0.26f32).exp()) + 1.0).ln();
        assert!((loss - (row0 + row1) / 2.0).abs() < 1e-4, "got {}", loss);
    }

    #[test]
    fn test_tree_loss_finite() {
        let ball = PoincareBall::new(1.0).unwrap();
        let parent = ball_points(4, 3);
        let child = ball_points(4, 3);
        let loss = tree_loss(&parent, &child, &ball).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
    }

    #[test]
    fn test_compute_breakdown() {
        let loss = HierarchicalLoss::new(HierarchicalLossConfig::default()).unwrap();
        let emb = ball_points(9, 4);
        let labels = [0, 0, 0, 1, 1, 2, 2, 2, 2];
        let mut rng = StdRng::seed_from_u64(7);
        let out = loss.compute(&emb, &labels, &mut rng).unwrap();
        let total = out.total.to_scalar::<f32>().unwrap();
        assert!(total.is_finite());
        assert!(out.center <= 0.0);
        assert_eq!(out.skipped_segments, 0);
        assert_eq!(out.dropped_rounds, 0);
        let expected = out.contrastive + out.center + out.norm;
        assert!((total - expected).abs() < 1e-4);
    }

    #[test]
    fn test_single_frame_policy() {
        let emb = ball_points(5, 3);
        let labels = [0, 0, 1, 2, 2];
        let mut rng = StdRng::seed_from_u64(1);

        let skip = HierarchicalLoss::new(HierarchicalLossConfig::default()).unwrap();
        let out = skip.compute(&emb, &labels, &mut rng).unwrap();
        assert_eq!(out.skipped_segments, 1);

        let strict = HierarchicalLoss::new(HierarchicalLossConfig {
            single_frame_policy: SingleFramePolicy::Error,
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            strict.compute(&emb, &labels, &mut rng),
            Err(SegError::NumericalDegeneracy(_))
        ));
    }

    #[test]
    fn test_tree_weight_joins_total() {
        let emb = ball_points(6, 3);
        let labels = [0, 0, 0, 1, 1, 1];
        let weighted = HierarchicalLoss::new(HierarchicalLossConfig {
            tree_weight: 2.0,
            ..Default::default()
        })
        .unwrap();
        let out = weighted.compute(&emb, &labels, &mut StdRng::seed_from_u64(3)).unwrap();
        let total = out.total.to_scalar::<f32>().unwrap();
        let expected = out.contrastive + out.center + out.norm + 2.0 * out.tree;
        assert!((total - expected).abs() < 1e-3);
    }

    #[test]
    fn test_compute_batch_ignores_padding() {
        let device = Device::Cpu;
        let loss = HierarchicalLoss::new(HierarchicalLossConfig::default()).unwrap();
        let emb = ball_points(12, 4).reshape((2, 6, 4)).unwrap();
        let targets = Tensor::new(&[[0i64, 0, 1, 1, 1, 2], [3, 3, 3, 4, -100, -100]], &device).unwrap();
        let out = loss
            .compute_batch(&emb, &targets, &mut StdRng::seed_from_u64(5))
            .unwrap();
        assert!(out.total.to_scalar::<f32>().unwrap().is_finite());
        assert_eq!(out.skipped_segments, 2);
    }

    #[test]
    fn test_stage_supervision_ignores_padding() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (1, 3, 5), &device).unwrap();
        let mask = crate::mask::sequence_mask(&[3], 3, 5, DType::F32, &device).unwrap();
        let targets = Tensor::new(&[[0i64, 2, 1, -100, -100]], &device).unwrap();

        let ce_only = stage_supervision_loss(&[logits.clone()], &targets, &mask, 0.0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let lp: Vec<Vec<f32>> = candle_nn::ops::log_softmax(&logits.squeeze(0).unwrap(), 0)
            .unwrap()
            .to_vec2()
            .unwrap();
        let expected = -(lp[0][0] + lp[2][1] + lp[1][2]) / 3.0;
        assert!((ce_only - expected).abs() < 1e-5);

        let two_stages = stage_supervision_loss(&[logits.clone(), logits], &targets, &mask, 0.15)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(two_stages >= 2.0 * ce_only - 1e-5);
    }
}
