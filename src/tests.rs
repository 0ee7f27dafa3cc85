//! Cross-module tests for the segmentation pipeline
//!
//! Window equivalences, block reassembly, ball invariants and an end-to-end
//! forward/loss pass on synthetic data.

use crate::attention::{AttentionLayer, AttentionSpec, AttentionWindow, Stage, WindowKind};
use crate::config::{HierarchicalLossConfig, SegmenterConfig};
use crate::context::ExecContext;
use crate::error::SegError;
use crate::loss::{HierarchicalLoss, SegmentBoundaries};
use crate::mask::sequence_mask;
use candle_core::{DType, Device, Tensor, D};

fn ones_mask(batch: usize, len: usize) -> Tensor {
    sequence_mask(&vec![len; batch], 1, len, DType::F32, &Device::Cpu).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// (1, channels, len) tensor whose every channel holds the frame index
fn position_values(channels: usize, len: usize) -> Tensor {
    let data: Vec<f32> = (0..channels).flat_map(|_| (0..len).map(|t| t as f32)).collect();
    Tensor::from_vec(data, (1, channels, len), &Device::Cpu).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════
// WINDOW STRATEGY TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod window_tests {
    use super::*;

    fn qkv(len: usize) -> (Tensor, Tensor, Tensor) {
        let device = Device::Cpu;
        (
            Tensor::randn(0f32, 1., (1, 4, len), &device).unwrap(),
            Tensor::randn(0f32, 1., (1, 4, len), &device).unwrap(),
            Tensor::randn(0f32, 1., (1, 6, len), &device).unwrap(),
        )
    }

    #[test]
    fn test_block_matches_normal_for_long_blocks() {
        let ctx = ExecContext::cpu();
        let len = 6;
        let (q, k, v) = qkv(len);
        let mask = ones_mask(1, len);

        let normal = AttentionWindow::new(WindowKind::Normal, 1, &ctx).unwrap();
        let reference = normal.attend(&q, &k, &v, &mask).unwrap().output;
        for block_len in [len, len + 3] {
            let block = AttentionWindow::new(WindowKind::Block, block_len, &ctx).unwrap();
            let out = block.attend(&q, &k, &v, &mask).unwrap().output;
            assert!(max_abs_diff(&out, &reference) < 1e-4, "block_len {}", block_len);
        }
    }

    #[test]
    fn test_sliding_matches_normal_for_long_blocks() {
        let ctx = ExecContext::cpu();
        let len = 6;
        let (q, k, v) = qkv(len);
        let mask = ones_mask(1, len);

        let normal = AttentionWindow::new(WindowKind::Normal, 1, &ctx).unwrap();
        let reference = normal.attend(&q, &k, &v, &mask).unwrap().output;
        for block_len in [len, len + 2, 2 * len] {
            let sliding = AttentionWindow::new(WindowKind::Sliding, block_len, &ctx).unwrap();
            let out = sliding.attend(&q, &k, &v, &mask).unwrap().output;
            assert!(max_abs_diff(&out, &reference) < 1e-4, "block_len {}", block_len);
        }
    }

    #[test]
    fn test_masked_keys_receive_no_weight() {
        let ctx = ExecContext::cpu();
        let len = 7;
        let (q, k, v) = qkv(len);
        let mask = sequence_mask(&[5], 1, len, DType::F32, &Device::Cpu).unwrap();

        let normal = AttentionWindow::new(WindowKind::Normal, 1, &ctx).unwrap();
        let attended = normal.attend(&q, &k, &v, &mask).unwrap();
        let tail = attended.weights.narrow(D::Minus1, 5, 2).unwrap();
        assert!(tail.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() < 1e-6);

        // rows over valid keys still normalise
        let rows: Vec<f32> = attended
            .weights
            .narrow(D::Minus1, 0, 5)
            .unwrap()
            .sum(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(rows.iter().all(|r| (r - 1.0).abs() < 1e-4));

        // padded output frames are zero
        let padded = attended.output.narrow(2, 5, 2).unwrap();
        assert_eq!(padded.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    /// Total weight that windowed attention puts on keys outside `0..valid`;
    /// key `j` of block `b` sits at `b * block_len - offset + j`
    fn weight_on_invalid_keys(weights: &Tensor, block_len: usize, offset: usize, valid: usize) -> f32 {
        let blocks: Vec<Vec<Vec<f32>>> = weights.to_vec3().unwrap();
        let mut leaked = 0.0;
        for (b, rows) in blocks.iter().enumerate() {
            for row in rows {
                for (j, w) in row.iter().enumerate() {
                    let pos = (b * block_len + j) as isize - offset as isize;
                    if pos < 0 || pos >= valid as isize {
                        leaked += w.abs();
                    }
                }
            }
        }
        leaked
    }

    #[test]
    fn test_block_masks_padding_inside_last_block() {
        let ctx = ExecContext::cpu();
        let (len, valid, block_len) = (7, 5, 4);
        let (q, k, v) = qkv(len);
        let mask = sequence_mask(&[valid], 1, len, DType::F32, &Device::Cpu).unwrap();

        let block = AttentionWindow::new(WindowKind::Block, block_len, &ctx).unwrap();
        let attended = block.attend(&q, &k, &v, &mask).unwrap();
        assert_eq!(attended.weights.dims(), &[2, block_len, block_len]);
        assert!(weight_on_invalid_keys(&attended.weights, block_len, 0, valid) < 1e-6);

        let padded = attended.output.narrow(2, valid, len - valid).unwrap();
        assert_eq!(padded.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_sliding_masks_padding_inside_key_window() {
        let ctx = ExecContext::cpu();
        let (len, valid, block_len) = (10, 7, 4);
        let (q, k, v) = qkv(len);
        let mask = sequence_mask(&[valid], 1, len, DType::F32, &Device::Cpu).unwrap();

        let sliding = AttentionWindow::new(WindowKind::Sliding, block_len, &ctx).unwrap();
        let attended = sliding.attend(&q, &k, &v, &mask).unwrap();
        let width = crate::mask::WindowMask::window_width(block_len);
        assert_eq!(attended.weights.dims(), &[3, block_len, width]);
        assert!(weight_on_invalid_keys(&attended.weights, block_len, block_len / 2, valid) < 1e-6);

        let padded = attended.output.narrow(2, valid, len - valid).unwrap();
        assert_eq!(padded.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_output_keeps_input_length() {
        let ctx = ExecContext::cpu();
        let block_len = 4;
        for len in [1, block_len - 1, block_len, block_len + 1, 3 * block_len] {
            let (q, k, v) = qkv(len);
            let mask = ones_mask(1, len);
            for kind in [WindowKind::Normal, WindowKind::Block, WindowKind::Sliding] {
                let window = AttentionWindow::new(kind, block_len, &ctx).unwrap();
                let out = window.attend(&q, &k, &v, &mask).unwrap().output;
                assert_eq!(out.dims(), &[1, 6, len], "{:?} with L = {}", kind, len);
            }
        }
    }

    /// (1, len, len) one-hot position codes scaled so attention is near identity
    fn one_hot_positions(len: usize) -> Tensor {
        let data: Vec<f32> = (0..len)
            .flat_map(|c| (0..len).map(move |t| if c == t { 10.0 } else { 0.0 }))
            .collect();
        Tensor::from_vec(data, (1, len, len), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_reassembly_keeps_frame_order() {
        // bl divides L; each query only matches its own key, so output[i] == i
        let ctx = ExecContext::cpu();
        let (len, block_len) = (8, 4);
        let codes = one_hot_positions(len);
        let values = position_values(2, len);
        let mask = ones_mask(1, len);

        for kind in [WindowKind::Block, WindowKind::Sliding] {
            let window = AttentionWindow::new(kind, block_len, &ctx).unwrap();
            let out = window.attend(&codes, &codes, &values, &mask).unwrap().output;
            assert_eq!(out.dims(), &[1, 2, len]);
            let rows: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
            for row in rows {
                for (i, got) in row.iter().enumerate() {
                    assert!((got - i as f32).abs() < 1e-3, "{:?}: {:?}", kind, row);
                }
            }
        }
    }

    #[test]
    fn test_block_uniform_weights_average_each_block() {
        // equal queries and keys give uniform weights, so each frame
        // receives the mean position of its own block
        let ctx = ExecContext::cpu();
        let len = 7;
        let zeros = Tensor::zeros((1, 2, len), DType::F32, &Device::Cpu).unwrap();
        let values = position_values(3, len);
        let mask = ones_mask(1, len);

        let block = AttentionWindow::new(WindowKind::Block, 3, &ctx).unwrap();
        let out = block.attend(&zeros, &zeros, &values, &mask).unwrap().output;
        let row: Vec<f32> = out.get(0).unwrap().get(1).unwrap().to_vec1().unwrap();
        let expected = [1.0, 1.0, 1.0, 4.0, 4.0, 4.0, 6.0];
        for (got, want) in row.iter().zip(expected) {
            assert!((got - want).abs() < 1e-3, "{:?}", row);
        }
    }

    #[test]
    fn test_sliding_window_neighbourhood() {
        // block length 4: queries of block b see [4b - 2, 4b + 6) within the sequence
        let ctx = ExecContext::cpu();
        let len = 10;
        let block_len = 4;
        let zeros = Tensor::zeros((1, 2, len), DType::F32, &Device::Cpu).unwrap();
        let values = position_values(1, len);
        let mask = ones_mask(1, len);

        let sliding = AttentionWindow::new(WindowKind::Sliding, block_len, &ctx).unwrap();
        let out = sliding.attend(&zeros, &zeros, &values, &mask).unwrap().output;
        let row: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        for (q, got) in row.iter().enumerate() {
            let start = (q / block_len) * block_len;
            let lo = start.saturating_sub(block_len / 2);
            let hi = (start + block_len + block_len / 2).min(len);
            let want = (lo..hi).sum::<usize>() as f32 / (hi - lo) as f32;
            assert!((got - want).abs() < 1e-3, "q = {}: {} vs {}", q, got, want);
        }
    }

    #[test]
    fn test_sliding_layer_shapes() {
        let ctx = ExecContext::cpu();
        let varmap = candle_nn::VarMap::new();
        let spec = AttentionSpec {
            q_dim: 8,
            k_dim: 8,
            v_dim: 8,
            r1: 2,
            r2: 2,
            r3: 2,
            block_len: 4,
            stage: Stage::Encoder,
            window: WindowKind::Sliding,
        };
        let layer = AttentionLayer::new(&spec, &ctx, ctx.var_builder(&varmap)).unwrap();

        let x = Tensor::randn(0f32, 1., (1, 8, 10), &Device::Cpu).unwrap();
        let out = layer.forward(&x, None, &ones_mask(1, 10)).unwrap();
        assert_eq!(out.dims(), &[1, 8, 10]);

        let x2 = Tensor::randn(0f32, 1., (2, 8, 10), &Device::Cpu).unwrap();
        let err = layer.forward(&x2, None, &ones_mask(2, 10)).unwrap_err();
        assert!(matches!(err, SegError::BatchSizeMismatch { expected: 1, got: 2 }));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HYPERBOLIC PIPELINE TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use crate::data::{BatchSource, LoaderOptions, SequenceBatchGenerator};
    use crate::model::SegmentationTransformer;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_boundaries_of_three_segments() {
        let labels = [0, 0, 0, 1, 1, 2, 2, 2, 2];
        let boundaries = SegmentBoundaries::from_labels(&labels).unwrap();
        assert_eq!(boundaries.ends(), &[2, 4, 8]);
        assert_eq!(boundaries.starts(), vec![0, 3, 5]);
    }

    #[test]
    fn test_embeddings_stay_inside_ball() {
        let ctx = ExecContext::cpu();
        for curvature in [0.5, 1.0, 2.0] {
            let mut config = SegmenterConfig::tiny(6, 3);
            config.curvature = curvature;
            let varmap = candle_nn::VarMap::new();
            let model = SegmentationTransformer::new(config, &ctx, ctx.var_builder(&varmap)).unwrap();

            // large inputs push the tangent vectors far out
            let x = (Tensor::randn(0f32, 1., (1, 6, 12), &Device::Cpu).unwrap() * 50.0).unwrap();
            let out = model.forward(&x, &ones_mask(1, 12), false).unwrap();
            let norms: Vec<f32> = out
                .embeddings
                .sqr()
                .unwrap()
                .sum(D::Minus1)
                .unwrap()
                .sqrt()
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            let radius = 1.0 / curvature.sqrt() as f32;
            assert!(norms.iter().all(|n| n.is_finite() && *n < radius), "c = {}", curvature);
        }
    }

    #[test]
    fn test_forward_and_loss_on_synthetic_batch() {
        let ctx = ExecContext::cpu();
        let options = LoaderOptions {
            sample_rate: 1,
            batch_size: 1,
            shuffle: false,
            seed: 5,
        };
        let mut gen = SequenceBatchGenerator::synthetic(2, 6, 3, 16, options, ctx.clone()).unwrap();
        let varmap = candle_nn::VarMap::new();
        let model = SegmentationTransformer::new(SegmenterConfig::tiny(6, 3), &ctx, ctx.var_builder(&varmap)).unwrap();
        let loss_fn = HierarchicalLoss::new(HierarchicalLossConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(5);

        while gen.has_next() {
            let batch = gen.next_batch(1, false).unwrap();
            let out = model.forward(&batch.input, &batch.mask, true).unwrap();
            assert_eq!(out.stage_logits.len(), 2);

            let breakdown = loss_fn.compute_batch(&out.embeddings, &batch.target, &mut rng).unwrap();
            let total = breakdown.total.to_scalar::<f32>().unwrap();
            assert!(total.is_finite());

            let grads = breakdown.total.backward().unwrap();
            let head_weight = varmap
                .data()
                .lock()
                .unwrap()
                .get("head.fc3.weight")
                .unwrap()
                .as_tensor()
                .clone();
            assert!(grads.get(&head_weight).is_some());
        }
    }
}
