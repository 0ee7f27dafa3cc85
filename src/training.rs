//! Training loop and inference for the segmentation cascade
//!
//! - Plateau learning-rate schedule on the epoch loss
//! - AdamW steps on per-stage supervision plus the hierarchical objective
//! - Periodic checkpoints, TensorBoard scalars and norm profiles
//! - Frame accuracy and prediction files

use crate::checkpoint::{self, OptimizerSnapshot};
use crate::config::{SegmenterConfig, TrainingConfig};
use crate::data::{ActionDict, Batch, BatchSource, FeatureStore};
use crate::loss::{stage_supervision_loss, HierarchicalLoss, LossBreakdown, IGNORE_INDEX};
use crate::metrics::{segment_norm_profile, EpochSummary, MetricsLogger, PROFILE_CLIP};
use crate::model::{num_parameters, SegmentationTransformer};
use crate::{ExecContext, SegError, SegResult};
use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// First line of every prediction file
pub const PREDICTION_HEADER: &str = "### Frame level recognition: ###";

// ═══════════════════════════════════════════════════════════════════════════
// LEARNING RATE SCHEDULER
// ═══════════════════════════════════════════════════════════════════════════

/// Multiply the learning rate by `factor` once the monitored loss has not
/// improved (relative threshold) for more than `patience` epochs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauScheduler {
    lr: f64,
    factor: f64,
    patience: usize,
    threshold: f64,
    best: Option<f64>,
    num_bad_epochs: usize,
}

impl PlateauScheduler {
    pub fn new(lr: f64, factor: f64, patience: usize) -> Self {
        Self {
            lr,
            factor,
            patience,
            threshold: 1e-4,
            best: None,
            num_bad_epochs: 0,
        }
    }

    pub fn get_lr(&self) -> f64 {
        self.lr
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Record one epoch's loss; returns true when the rate was reduced
    pub fn step(&mut self, metric: f64) -> bool {
        let improved = match self.best {
            None => true,
            Some(best) => metric < best * (1.0 - self.threshold),
        };
        if improved {
            self.best = Some(metric);
            self.num_bad_epochs = 0;
            return false;
        }
        self.num_bad_epochs += 1;
        if self.num_bad_epochs > self.patience {
            self.lr *= self.factor;
            self.num_bad_epochs = 0;
            log::info!("Reducing learning rate to {:.3e}", self.lr);
            return true;
        }
        false
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ACCURACY
// ═══════════════════════════════════════════════════════════════════════════

/// (correct, counted) frames; targets equal to [`IGNORE_INDEX`] are skipped.
///
/// `predictions` and `targets` are (B, L).
pub fn frame_accuracy(predictions: &Tensor, targets: &Tensor) -> SegResult<(usize, usize)> {
    let preds: Vec<Vec<i64>> = predictions.to_dtype(DType::I64)?.to_vec2()?;
    let targets: Vec<Vec<i64>> = targets.to_dtype(DType::I64)?.to_vec2()?;
    let mut correct = 0;
    let mut total = 0;
    for (p_row, t_row) in preds.iter().zip(&targets) {
        for (p, t) in p_row.iter().zip(t_row) {
            if *t == IGNORE_INDEX {
                continue;
            }
            total += 1;
            if p == t {
                correct += 1;
            }
        }
    }
    Ok((correct, total))
}

// ═══════════════════════════════════════════════════════════════════════════
// TRAINER
// ═══════════════════════════════════════════════════════════════════════════

/// Losses of one optimisation step
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub total: f64,
    pub supervision: f64,
    pub breakdown: LossBreakdown,
    /// Detached (B, L, D) embeddings of the batch
    pub embeddings: Tensor,
}

pub struct Trainer {
    model: SegmentationTransformer,
    varmap: VarMap,
    optimizer: AdamW,
    scheduler: PlateauScheduler,
    loss_fn: HierarchicalLoss,
    config: TrainingConfig,
    metrics: MetricsLogger,
    rng: StdRng,
    ctx: ExecContext,
    global_step: usize,
    epoch: usize,
}

impl Trainer {
    pub fn new(
        model_config: SegmenterConfig,
        training_config: TrainingConfig,
        ctx: ExecContext,
    ) -> SegResult<Self> {
        let varmap = VarMap::new();
        let model = SegmentationTransformer::new(model_config, &ctx, ctx.var_builder(&varmap))?;
        log::info!("Model size: {} parameters", num_parameters(&varmap));
        Self::assemble(model, varmap, training_config, ctx)
    }

    /// Continue from a saved epoch: weights, learning rate and schedule
    pub fn from_checkpoint(
        dir: impl AsRef<Path>,
        epoch: usize,
        training_config: TrainingConfig,
        ctx: ExecContext,
    ) -> SegResult<Self> {
        let dir = dir.as_ref();
        let (model, varmap, _) = checkpoint::load_checkpoint(dir, epoch, &ctx)?;
        let snapshot = checkpoint::load_optimizer_snapshot(dir, epoch)?;
        let mut trainer = Self::assemble(model, varmap, training_config, ctx)?;
        trainer.optimizer.set_learning_rate(snapshot.learning_rate);
        trainer.scheduler = snapshot.scheduler;
        trainer.global_step = snapshot.step;
        trainer.epoch = epoch;
        Ok(trainer)
    }

    fn assemble(
        model: SegmentationTransformer,
        varmap: VarMap,
        config: TrainingConfig,
        ctx: ExecContext,
    ) -> SegResult<Self> {
        if config.batch_size == 0 || config.sample_rate == 0 {
            return Err(SegError::InvalidParameter(
                "batch size and sample rate must be at least 1".into(),
            ));
        }
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        let scheduler = PlateauScheduler::new(
            config.learning_rate,
            config.plateau_factor,
            config.plateau_patience,
        );
        let metrics = match &config.log_dir {
            Some(dir) => MetricsLogger::new(dir)?,
            None => MetricsLogger::disabled(),
        };

        Ok(Self {
            model,
            varmap,
            optimizer,
            scheduler,
            loss_fn: HierarchicalLoss::new(config.loss.clone())?,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            metrics,
            ctx,
            global_step: 0,
            epoch: 0,
        })
    }

    pub fn model(&self) -> &SegmentationTransformer {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn scheduler(&self) -> &PlateauScheduler {
        &self.scheduler
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn optimizer_snapshot(&self) -> OptimizerSnapshot {
        let params = self.optimizer.params();
        OptimizerSnapshot {
            learning_rate: self.optimizer.learning_rate(),
            weight_decay: params.weight_decay,
            beta1: params.beta1,
            beta2: params.beta2,
            eps: params.eps,
            step: self.global_step,
            scheduler: self.scheduler.clone(),
        }
    }

    /// Forward, combined loss, backward and one AdamW update
    pub fn train_step(&mut self, batch: &Batch) -> SegResult<StepOutput> {
        let out = self.model.forward(&batch.input, &batch.mask, true)?;
        let breakdown = self
            .loss_fn
            .compute_batch(&out.embeddings, &batch.target, &mut self.rng)?;

        let mut total = breakdown.total.clone();
        let mut supervision = 0.0;
        if self.config.supervision_weight > 0.0 {
            let stage_loss = stage_supervision_loss(
                &out.stage_logits,
                &batch.target,
                &batch.mask,
                self.config.smoothing_weight,
            )?;
            supervision = stage_loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            total = (total + (stage_loss * self.config.supervision_weight)?)?;
        }

        let value = total.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        if !value.is_finite() {
            return Err(SegError::NonFiniteLoss {
                epoch: self.epoch,
                batch: self.global_step,
            });
        }

        self.optimizer.backward_step(&total)?;
        self.global_step += 1;

        Ok(StepOutput {
            total: value,
            supervision,
            breakdown,
            embeddings: out.embeddings.detach(),
        })
    }

    /// Run one epoch over `batch_gen`
    pub fn train_epoch(&mut self, batch_gen: &mut dyn BatchSource) -> SegResult<EpochSummary> {
        let start = Instant::now();
        let profile_epoch = self.config.norm_profile_every > 0
            && (self.epoch + 1) % self.config.norm_profile_every == 0;
        let augment = self.config.sample_rate > 1;

        batch_gen.reset();
        let mut summary = EpochSummary::default();
        let mut batch_idx = 0;
        while batch_gen.has_next() {
            let batch = batch_gen.next_batch(self.config.batch_size, augment)?;
            let step = self.train_step(&batch).map_err(|e| match e {
                SegError::NonFiniteLoss { epoch, .. } => SegError::NonFiniteLoss {
                    epoch,
                    batch: batch_idx,
                },
                other => other,
            })?;
            log::debug!(
                "epoch {} batch {}: loss {:.4} (supervision {:.4})",
                self.epoch + 1,
                batch_idx,
                step.total,
                step.supervision
            );
            summary.record(step.total, step.supervision, &step.breakdown);

            if profile_epoch {
                self.log_profile(&batch, &step.embeddings)?;
            }
            batch_idx += 1;
        }

        let mean = summary.mean();
        log::info!(
            "[epoch {}]: epoch loss = {:.6}, lr = {:.3e} ({:.1}s)",
            self.epoch + 1,
            mean.loss,
            self.optimizer.learning_rate(),
            start.elapsed().as_secs_f64()
        );
        if mean.dropped_rounds > 0 || mean.skipped_segments > 0 {
            log::warn!(
                "epoch {}: {} non-finite terms dropped, {} single-frame segments skipped",
                self.epoch + 1,
                mean.dropped_rounds,
                mean.skipped_segments
            );
        }
        Ok(mean)
    }

    fn log_profile(&mut self, batch: &Batch, embeddings: &Tensor) -> SegResult<()> {
        let targets: Vec<Vec<i64>> = batch.target.to_dtype(DType::I64)?.to_vec2()?;
        for (b, (id, &len)) in batch.ids.iter().zip(&batch.lengths).enumerate() {
            let sequence = embeddings.get(b)?.narrow(0, 0, len)?;
            let profile = segment_norm_profile(&sequence, &targets[b][..len], PROFILE_CLIP)?;
            self.metrics.log_norm_profile(id, &profile, self.epoch + 1)?;
        }
        Ok(())
    }

    /// Full schedule: epochs, plateau steps, checkpoints every
    /// `checkpoint_every` epochs into `save_dir`, optional test accuracy
    pub fn train(
        &mut self,
        batch_gen: &mut dyn BatchSource,
        mut test_gen: Option<&mut dyn BatchSource>,
        save_dir: Option<&Path>,
    ) -> SegResult<Vec<EpochSummary>> {
        let mut history = Vec::with_capacity(self.config.num_epochs);
        let first = self.epoch;
        for _ in first..self.config.num_epochs {
            let summary = self.train_epoch(batch_gen)?;
            let epoch = self.epoch + 1;

            if self.scheduler.step(summary.loss) {
                self.optimizer.set_learning_rate(self.scheduler.get_lr());
            }
            self.metrics.log_epoch(epoch, summary.loss)?;
            self.metrics.log_breakdown(&summary, epoch)?;
            self.metrics
                .log_scalar("train/learning_rate", self.optimizer.learning_rate(), epoch)?;

            if let Some(dir) = save_dir {
                if self.config.checkpoint_every > 0 && epoch % self.config.checkpoint_every == 0 {
                    checkpoint::save_checkpoint(
                        dir,
                        epoch,
                        &self.varmap,
                        self.model.config(),
                        &self.optimizer_snapshot(),
                        Some(summary.loss),
                    )?;
                }
            }

            if let Some(gen) = test_gen.as_deref_mut() {
                let acc = self.evaluate(gen)?;
                log::info!("[epoch {}]: test acc = {:.4}", epoch, acc);
                self.metrics.log_scalar("test/accuracy", acc, epoch)?;
            }

            self.metrics.flush()?;
            self.epoch = epoch;
            history.push(summary);
        }
        Ok(history)
    }

    /// Frame accuracy of the final stage over every batch of `batch_gen`
    pub fn evaluate(&self, batch_gen: &mut dyn BatchSource) -> SegResult<f64> {
        batch_gen.reset();
        let mut correct = 0;
        let mut total = 0;
        while batch_gen.has_next() {
            let batch = batch_gen.next_batch(self.config.batch_size, false)?;
            let out = self.model.forward(&batch.input, &batch.mask, false)?;
            let (c, t) = frame_accuracy(&out.predictions()?, &batch.target)?;
            correct += c;
            total += t;
        }
        batch_gen.reset();
        if total == 0 {
            return Err(SegError::EmptySequence);
        }
        Ok(correct as f64 / total as f64)
    }

    /// Write prediction files with the current weights
    pub fn predict_current(
        &self,
        results_dir: impl AsRef<Path>,
        store: &dyn FeatureStore,
        batch_gen: &dyn BatchSource,
        actions: &ActionDict,
        sample_rate: usize,
    ) -> SegResult<Vec<PathBuf>> {
        write_predictions(&self.model, &self.ctx, results_dir, store, batch_gen.videos(), actions, sample_rate)
    }

    /// Load the `epoch` checkpoint from `model_dir` and write prediction files
    #[allow(clippy::too_many_arguments)]
    pub fn predict(
        &self,
        model_dir: impl AsRef<Path>,
        results_dir: impl AsRef<Path>,
        store: &dyn FeatureStore,
        batch_gen: &dyn BatchSource,
        epoch: usize,
        actions: &ActionDict,
        sample_rate: usize,
    ) -> SegResult<Vec<PathBuf>> {
        predict(model_dir, results_dir, store, batch_gen, epoch, actions, sample_rate, &self.ctx)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// INFERENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Final-stage class names of one video, each repeated `sample_rate` times
pub fn recognize(
    model: &SegmentationTransformer,
    ctx: &ExecContext,
    features: &ndarray::Array2<f32>,
    actions: &ActionDict,
    sample_rate: usize,
) -> SegResult<Vec<String>> {
    let (channels, len) = features.dim();
    if len == 0 {
        return Err(SegError::EmptySequence);
    }
    let data: Vec<f32> = features.iter().copied().collect();
    let input = Tensor::from_vec(data, (1, channels, len), ctx.device())?.to_dtype(ctx.dtype())?;
    let mask = Tensor::ones((1, model.config().num_classes, len), ctx.dtype(), ctx.device())?;

    let out = model.forward(&input, &mask, false)?;
    let ids: Vec<u32> = out.predictions()?.squeeze(0)?.to_dtype(DType::U32)?.to_vec1()?;

    let mut names = Vec::with_capacity(ids.len() * sample_rate);
    for id in ids {
        let name = actions.name(id as usize).ok_or_else(|| SegError::UnknownVariant {
            kind: "action id",
            value: id.to_string(),
        })?;
        names.extend(std::iter::repeat(name.to_string()).take(sample_rate));
    }
    Ok(names)
}

fn write_predictions(
    model: &SegmentationTransformer,
    ctx: &ExecContext,
    results_dir: impl AsRef<Path>,
    store: &dyn FeatureStore,
    videos: &[String],
    actions: &ActionDict,
    sample_rate: usize,
) -> SegResult<Vec<PathBuf>> {
    let results_dir = results_dir.as_ref();
    fs::create_dir_all(results_dir)?;

    let mut written = Vec::with_capacity(videos.len());
    for stem in videos {
        let features = store.load(stem, sample_rate)?;
        let recognition = recognize(model, ctx, &features, actions, sample_rate)?;
        let path = results_dir.join(stem);
        fs::write(&path, format!("{}\n{}", PREDICTION_HEADER, recognition.join(" ")))?;
        written.push(path);
    }
    log::info!("Wrote {} prediction files to {:?}", written.len(), results_dir);
    Ok(written)
}

/// Load the `epoch` checkpoint and write one prediction file per video
#[allow(clippy::too_many_arguments)]
pub fn predict(
    model_dir: impl AsRef<Path>,
    results_dir: impl AsRef<Path>,
    store: &dyn FeatureStore,
    batch_gen: &dyn BatchSource,
    epoch: usize,
    actions: &ActionDict,
    sample_rate: usize,
    ctx: &ExecContext,
) -> SegResult<Vec<PathBuf>> {
    if sample_rate == 0 {
        return Err(SegError::InvalidParameter("sample rate must be at least 1".into()));
    }
    let (model, _varmap, _) = checkpoint::load_checkpoint(model_dir, epoch, ctx)?;
    write_predictions(&model, ctx, results_dir, store, batch_gen.videos(), actions, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::WindowKind;
    use crate::data::{LoaderOptions, SequenceBatchGenerator};

    #[test]
    fn test_plateau_scheduler() {
        let mut sched = PlateauScheduler::new(1.0, 0.5, 2);
        assert!(!sched.step(10.0));
        assert!(!sched.step(9.0));
        assert!(!sched.step(9.5));
        assert!(!sched.step(9.5));
        assert!(sched.step(9.5));
        assert_eq!(sched.get_lr(), 0.5);
        // tiny improvements below the relative threshold do not count
        assert!(!sched.step(8.99999));
        assert_eq!(sched.best(), Some(9.0));
    }

    #[test]
    fn test_frame_accuracy_skips_padding() {
        let device = candle_core::Device::Cpu;
        let preds = Tensor::new(&[[1u32, 2, 2, 0]], &device).unwrap();
        let targets = Tensor::new(&[[1i64, 2, 0, -100]], &device).unwrap();
        assert_eq!(frame_accuracy(&preds, &targets).unwrap(), (2, 3));
    }

    fn options() -> LoaderOptions {
        LoaderOptions {
            sample_rate: 1,
            batch_size: 1,
            shuffle: true,
            seed: 11,
        }
    }

    #[test]
    fn test_train_step_updates_parameters() {
        let ctx = ExecContext::cpu();
        let mut trainer = Trainer::new(SegmenterConfig::tiny(6, 3), TrainingConfig::quick(), ctx.clone()).unwrap();
        let mut gen = SequenceBatchGenerator::synthetic(2, 6, 3, 10, options(), ctx).unwrap();

        let key = "decoder_0.conv_out.weight";
        let before = trainer.varmap().data().lock().unwrap().get(key).unwrap().as_tensor().copy().unwrap();
        let batch = gen.next_batch(1, false).unwrap();
        let out = trainer.train_step(&batch).unwrap();
        assert!(out.total.is_finite());
        assert_eq!(trainer.global_step(), 1);

        let after = trainer.varmap().data().lock().unwrap().get(key).unwrap().as_tensor().copy().unwrap();
        let diff = (before - after).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn test_train_step_with_dilation_beyond_sequence_length() {
        // dilation reaches 32 while the sequences have at most 12 frames
        let ctx = ExecContext::cpu();
        let model_cfg = SegmenterConfig {
            num_layers: 6,
            ..SegmenterConfig::tiny(6, 3)
        };
        let mut trainer = Trainer::new(model_cfg, TrainingConfig::quick(), ctx.clone()).unwrap();
        let mut gen = SequenceBatchGenerator::synthetic(2, 6, 3, 12, options(), ctx).unwrap();

        let summary = trainer.train_epoch(&mut gen).unwrap();
        assert_eq!(summary.batches, 2);
        assert!(summary.loss.is_finite());
        assert_eq!(trainer.global_step(), 2);
    }

    #[test]
    fn test_train_evaluate_and_predict() {
        let ctx = ExecContext::cpu();
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("models");
        let results_dir = dir.path().join("results");

        let model_cfg = SegmenterConfig {
            window: WindowKind::Sliding,
            ..SegmenterConfig::tiny(6, 3)
        };
        let mut trainer = Trainer::new(model_cfg, TrainingConfig::quick(), ctx.clone()).unwrap();
        let mut train_gen = SequenceBatchGenerator::synthetic(2, 6, 3, 12, options(), ctx.clone()).unwrap();
        let mut test_gen = SequenceBatchGenerator::synthetic(1, 6, 3, 12, options(), ctx.clone()).unwrap();

        let history = trainer
            .train(&mut train_gen, Some(&mut test_gen), Some(&model_dir))
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|s| s.loss.is_finite() && s.batches == 2));
        assert_eq!(checkpoint::list_checkpoints(&model_dir).unwrap(), vec![1, 2]);

        let acc = trainer.evaluate(&mut test_gen).unwrap();
        assert!((0.0..=1.0).contains(&acc));

        let actions = ActionDict::from_names(["SIL", "cut", "pour"]);
        let files = trainer
            .predict(&model_dir, &results_dir, test_gen.store(), &test_gen, 2, &actions, 2)
            .unwrap();
        assert_eq!(files.len(), 1);

        let text = fs::read_to_string(&files[0]).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(PREDICTION_HEADER));
        let names: Vec<&str> = lines.next().unwrap().split(' ').collect();
        let stem = &test_gen.videos()[0];
        let frames = test_gen.store().load(stem, 2).unwrap().ncols();
        assert_eq!(names.len(), frames * 2);
        assert!(names.chunks(2).all(|pair| pair[0] == pair[1]));
    }
}
