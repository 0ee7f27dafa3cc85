//! # Training Metrics and Logging
//!
//! TensorBoard scalars through `tensorboard-rs`, a plain-text epoch log, and
//! per-segment norm profiles of the hyperbolic embeddings.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hyperseg::metrics::MetricsLogger;
//!
//! let mut logger = MetricsLogger::new("./logs")?;
//! logger.log_scalar("train/loss", 1.5, 3)?;
//! logger.log_epoch(3, 1.5)?;
//! logger.flush()?;
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tensorboard_rs::summary_writer::SummaryWriter;

use crate::loss::{LossBreakdown, SegmentBoundaries};
use crate::hyperbolic::norm_keepdim;
use crate::SegResult;
use candle_core::{DType, Tensor};

/// Points kept per segment in a norm profile
pub const PROFILE_CLIP: usize = 16;

/// Metrics logger with TensorBoard support and a text epoch log
pub struct MetricsLogger {
    writer: Option<SummaryWriter>,
    epoch_log: Option<File>,
    log_dir: PathBuf,
    enabled: bool,
}

impl MetricsLogger {
    /// Create a timestamped run directory under `log_dir`
    pub fn new(log_dir: impl AsRef<Path>) -> SegResult<Self> {
        let log_dir = log_dir.as_ref();
        let now = chrono::Local::now();
        let run_dir = log_dir.join(format!("run_{}", now.format("%Y%m%d-%H%M%S")));
        fs::create_dir_all(&run_dir)?;

        let writer = SummaryWriter::new(&run_dir);
        let mut epoch_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("log.txt"))?;
        writeln!(epoch_log, "{}", now.format("%Y-%m-%d %H:%M:%S"))?;

        log::info!("Tensorboard logs: {:?}", run_dir);
        log::info!("View with: tensorboard --logdir {:?}", log_dir);

        Ok(Self {
            writer: Some(writer),
            epoch_log: Some(epoch_log),
            log_dir: run_dir,
            enabled: true,
        })
    }

    /// Logger that records nothing
    pub fn disabled() -> Self {
        Self {
            writer: None,
            epoch_log: None,
            log_dir: PathBuf::new(),
            enabled: false,
        }
    }

    pub fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> SegResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(ref mut writer) = self.writer {
            writer.add_scalar(tag, value as f32, step);
        }
        Ok(())
    }

    pub fn log_scalars(&mut self, values: &[(&str, f64)], step: usize) -> SegResult<()> {
        for (tag, value) in values {
            self.log_scalar(tag, *value, step)?;
        }
        Ok(())
    }

    /// Append `[epoch N]: epoch loss = X` to log.txt
    pub fn log_epoch(&mut self, epoch: usize, loss: f64) -> SegResult<()> {
        if let Some(ref mut file) = self.epoch_log {
            writeln!(file, "[epoch {}]: epoch loss = {}", epoch, loss)?;
        }
        Ok(())
    }

    /// Component losses averaged over an epoch
    pub fn log_breakdown(&mut self, summary: &EpochSummary, epoch: usize) -> SegResult<()> {
        self.log_scalars(
            &[
                ("train/loss", summary.loss),
                ("train/supervision", summary.supervision),
                ("train/contrastive", summary.contrastive),
                ("train/center", summary.center),
                ("train/norm", summary.norm),
                ("train/tree", summary.tree),
            ],
            epoch,
        )
    }

    /// First and last norm of every segment's profile
    pub fn log_norm_profile(&mut self, video: &str, profile: &[Vec<f32>], epoch: usize) -> SegResult<()> {
        for (i, norms) in profile.iter().enumerate() {
            if let (Some(first), Some(last)) = (norms.first(), norms.last()) {
                self.log_scalar(&format!("norms/{}/segment_{}/start", video, i), *first as f64, epoch)?;
                self.log_scalar(&format!("norms/{}/segment_{}/end", video, i), *last as f64, epoch)?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> SegResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(ref mut writer) = self.writer {
            writer.flush();
        }
        if let Some(ref mut file) = self.epoch_log {
            file.flush()?;
        }
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for MetricsLogger {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.flush();
        }
    }
}

/// Embedding norms of each segment, evenly subsampled to at most `clip` points.
///
/// `embeddings` is (L, D), `labels` has length L.
pub fn segment_norm_profile<T: PartialEq>(
    embeddings: &Tensor,
    labels: &[T],
    clip: usize,
) -> SegResult<Vec<Vec<f32>>> {
    let boundaries = SegmentBoundaries::from_labels(labels)?;
    let norms: Vec<f32> = norm_keepdim(embeddings)?
        .squeeze(1)?
        .to_dtype(DType::F32)?
        .to_vec1()?;

    Ok(boundaries
        .segments()
        .into_iter()
        .map(|segment| {
            let values = &norms[segment];
            let step = values.len().div_ceil(clip.max(1)).max(1);
            values.iter().step_by(step).copied().collect()
        })
        .collect())
}

/// Running sums of the per-batch losses within one epoch
#[derive(Debug, Default, Clone)]
pub struct EpochSummary {
    pub loss: f64,
    pub supervision: f64,
    pub contrastive: f64,
    pub center: f64,
    pub norm: f64,
    pub tree: f64,
    pub dropped_rounds: usize,
    pub skipped_segments: usize,
    pub batches: usize,
}

impl EpochSummary {
    pub fn record(&mut self, total: f64, supervision: f64, breakdown: &LossBreakdown) {
        self.loss += total;
        self.supervision += supervision;
        self.contrastive += breakdown.contrastive as f64;
        self.center += breakdown.center as f64;
        self.norm += breakdown.norm as f64;
        self.tree += breakdown.tree as f64;
        self.dropped_rounds += breakdown.dropped_rounds;
        self.skipped_segments += breakdown.skipped_segments;
        self.batches += 1;
    }

    /// Per-batch means; counters stay as totals
    pub fn mean(&self) -> Self {
        let n = self.batches.max(1) as f64;
        Self {
            loss: self.loss / n,
            supervision: self.supervision / n,
            contrastive: self.contrastive / n,
            center: self.center / n,
            norm: self.norm / n,
            tree: self.tree / n,
            ..self.clone()
        }
    }
}
