//! # Video feature batches
//!
//! Layout on disk follows the usual action-segmentation benchmarks:
//!
//! ```text
//! <root>/features/<stem>.npy        (C, T) float32 per-frame features
//! <root>/groundTruth/<stem>.txt     one action name per frame
//! <root>/mapping.txt                "<id> <name>" per line
//! <root>/splits/train.split1.bundle one "<stem>.txt" per line
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let actions = ActionDict::from_file("data/breakfast/mapping.txt")?;
//! let store = NpyFeatureStore::new("data/breakfast/features");
//! let mut gen = SequenceBatchGenerator::from_split(
//!     "data/breakfast/splits/train.split1.bundle",
//!     "data/breakfast/groundTruth",
//!     Box::new(store),
//!     &actions,
//!     LoaderOptions::default(),
//!     ctx,
//! )?;
//! while gen.has_next() {
//!     let batch = gen.next_batch(1, true)?;
//! }
//! ```

use crate::loss::IGNORE_INDEX;
use crate::{ExecContext, SegError, SegResult};
use candle_core::Tensor;
use ndarray::{s, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Padded mini-batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// (B, C, L) features, zero past each sequence end
    pub input: Tensor,
    /// (B, L) class ids, [`IGNORE_INDEX`] on padding
    pub target: Tensor,
    /// (B, num_classes, L) validity mask
    pub mask: Tensor,
    /// Video stems in batch order
    pub ids: Vec<String>,
    /// Valid length of every sequence
    pub lengths: Vec<usize>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }
}

/// Source of padded batches, consumed once per epoch
pub trait BatchSource {
    /// Next `batch_size` sequences; `augment` draws a random temporal offset
    fn next_batch(&mut self, batch_size: usize, augment: bool) -> SegResult<Batch>;
    fn has_next(&self) -> bool;
    /// Rewind, reshuffling if enabled
    fn reset(&mut self);
    /// Number of batches per epoch
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Stems of every video, in split order
    fn videos(&self) -> &[String];
}

/// Per-video feature arrays addressed by file stem
pub trait FeatureStore {
    /// Full-rate (C, T) features
    fn load_raw(&self, stem: &str) -> SegResult<Array2<f32>>;

    /// Features subsampled as `[:, ::sample_rate]`
    fn load(&self, stem: &str, sample_rate: usize) -> SegResult<Array2<f32>> {
        subsample(&self.load_raw(stem)?, 0, sample_rate)
    }
}

/// Columns `offset, offset + rate, ...` of a (C, T) array
pub fn subsample(features: &Array2<f32>, offset: usize, rate: usize) -> SegResult<Array2<f32>> {
    if rate == 0 {
        return Err(SegError::InvalidParameter("sample rate must be at least 1".into()));
    }
    let offset = offset.min(features.ncols());
    Ok(features.slice(s![.., offset..;rate]).to_owned())
}

/// `<root>/<stem>.npy`
#[derive(Debug, Clone)]
pub struct NpyFeatureStore {
    root: PathBuf,
}

impl NpyFeatureStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, stem: &str) -> PathBuf {
        self.root.join(format!("{}.npy", stem))
    }
}

impl FeatureStore for NpyFeatureStore {
    fn load_raw(&self, stem: &str) -> SegResult<Array2<f32>> {
        let path = self.path_for(stem);
        if !path.exists() {
            return Err(SegError::Io(format!("missing feature file {}", path.display())));
        }
        ndarray_npy::read_npy(&path).map_err(|e| SegError::Npy(format!("{}: {}", path.display(), e)))
    }
}

/// Features held in memory, used for synthetic data
#[derive(Debug, Clone, Default)]
pub struct InMemoryFeatureStore {
    features: HashMap<String, Array2<f32>>,
}

impl InMemoryFeatureStore {
    pub fn insert(&mut self, stem: impl Into<String>, features: Array2<f32>) {
        self.features.insert(stem.into(), features);
    }
}

impl FeatureStore for InMemoryFeatureStore {
    fn load_raw(&self, stem: &str) -> SegResult<Array2<f32>> {
        self.features
            .get(stem)
            .cloned()
            .ok_or_else(|| SegError::Io(format!("no features for {}", stem)))
    }
}

/// Bidirectional action name <-> class id mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionDict {
    names: Vec<String>,
    ids: HashMap<String, usize>,
}

impl ActionDict {
    /// Parse `"<id> <name>"` lines; ids must cover 0..n
    pub fn parse(text: &str) -> SegResult<Self> {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(id), Some(name)) = (parts.next(), parts.next()) else {
                return Err(SegError::SerializationError(format!(
                    "mapping line {}: expected '<id> <name>'",
                    lineno + 1
                )));
            };
            let id: usize = id.parse().map_err(|_| {
                SegError::SerializationError(format!("mapping line {}: bad id '{}'", lineno + 1, id))
            })?;
            entries.push((id, name.to_string()));
        }
        entries.sort_by_key(|(id, _)| *id);

        let mut dict = Self::default();
        for (expected, (id, name)) in entries.into_iter().enumerate() {
            if id != expected {
                return Err(SegError::SerializationError(format!(
                    "mapping ids are not contiguous: expected {}, found {}",
                    expected, id
                )));
            }
            dict.ids.insert(name.clone(), id);
            dict.names.push(name);
        }
        Ok(dict)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SegResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| SegError::Io(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Names in id order
    pub fn from_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        let mut dict = Self::default();
        for (id, name) in names.into_iter().enumerate() {
            let name = name.into();
            dict.ids.insert(name.clone(), id);
            dict.names.push(name);
        }
        dict
    }

    pub fn id(&self, name: &str) -> SegResult<usize> {
        self.ids.get(name).copied().ok_or_else(|| SegError::UnknownVariant {
            kind: "action",
            value: name.to_string(),
        })
    }

    pub fn name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Strip a trailing `.txt` (or any extension) from a split entry
pub fn video_stem(entry: &str) -> &str {
    entry.rsplit_once('.').map_or(entry, |(stem, _)| stem)
}

/// Batching knobs
#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    pub sample_rate: usize,
    /// Batches per epoch are counted with this size
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            sample_rate: 1,
            batch_size: 1,
            shuffle: true,
            seed: 19980125,
        }
    }
}

/// Split-driven loader pairing features with per-frame labels
pub struct SequenceBatchGenerator {
    videos: Vec<String>,
    labels: HashMap<String, Vec<usize>>,
    store: Box<dyn FeatureStore>,
    num_classes: usize,
    options: LoaderOptions,
    order: Vec<usize>,
    position: usize,
    rng: StdRng,
    ctx: ExecContext,
}

impl SequenceBatchGenerator {
    pub fn new(
        videos: Vec<String>,
        labels: HashMap<String, Vec<usize>>,
        store: Box<dyn FeatureStore>,
        num_classes: usize,
        options: LoaderOptions,
        ctx: ExecContext,
    ) -> SegResult<Self> {
        if options.sample_rate == 0 || options.batch_size == 0 {
            return Err(SegError::InvalidParameter(
                "sample rate and batch size must be at least 1".into(),
            ));
        }
        for video in &videos {
            if !labels.contains_key(video) {
                return Err(SegError::Io(format!("no ground truth for {}", video)));
            }
        }
        let mut gen = Self {
            order: (0..videos.len()).collect(),
            videos,
            labels,
            store,
            num_classes,
            options,
            position: 0,
            rng: StdRng::seed_from_u64(options.seed),
            ctx,
        };
        gen.reset();
        Ok(gen)
    }

    /// Read the split file and every referenced ground-truth file
    pub fn from_split(
        split_file: impl AsRef<Path>,
        gt_dir: impl AsRef<Path>,
        store: Box<dyn FeatureStore>,
        actions: &ActionDict,
        options: LoaderOptions,
        ctx: ExecContext,
    ) -> SegResult<Self> {
        let split_file = split_file.as_ref();
        let split = fs::read_to_string(split_file)
            .map_err(|e| SegError::Io(format!("{}: {}", split_file.display(), e)))?;

        let mut videos = Vec::new();
        let mut labels = HashMap::new();
        for entry in split.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let stem = video_stem(entry).to_string();
            let gt_path = gt_dir.as_ref().join(format!("{}.txt", stem));
            let content = fs::read_to_string(&gt_path)
                .map_err(|e| SegError::Io(format!("{}: {}", gt_path.display(), e)))?;
            let classes = content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|name| actions.id(name))
                .collect::<SegResult<Vec<_>>>()?;
            labels.insert(stem.clone(), classes);
            videos.push(stem);
        }
        log::info!("Loaded {} videos from {}", videos.len(), split_file.display());

        Self::new(videos, labels, store, actions.len(), options, ctx)
    }

    /// Random features whose mean shifts with the class, labelled in runs
    pub fn synthetic(
        num_videos: usize,
        input_dim: usize,
        num_classes: usize,
        max_len: usize,
        options: LoaderOptions,
        ctx: ExecContext,
    ) -> SegResult<Self> {
        if num_classes == 0 || max_len < 2 {
            return Err(SegError::InvalidParameter(
                "synthetic data needs a class and at least two frames".into(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(1));
        let mut store = InMemoryFeatureStore::default();
        let mut labels = HashMap::new();
        let mut videos = Vec::with_capacity(num_videos);

        for v in 0..num_videos {
            let stem = format!("synthetic_{:03}", v);
            let len = rng.gen_range(max_len / 2 + 1..=max_len);
            let mut classes = Vec::with_capacity(len);
            while classes.len() < len {
                let class = rng.gen_range(0..num_classes);
                let run = rng.gen_range(2..=(len / 2).max(2));
                classes.extend(std::iter::repeat(class).take(run.min(len - classes.len())));
            }
            let features = Array2::from_shape_fn((input_dim, len), |(c, t)| {
                let centre = if c % num_classes == classes[t] { 1.0 } else { 0.0 };
                centre + rng.gen_range(-0.1f32..0.1)
            });
            store.insert(stem.clone(), features);
            labels.insert(stem.clone(), classes);
            videos.push(stem);
        }

        Self::new(videos, labels, Box::new(store), num_classes, options, ctx)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Full-rate labels of one video
    pub fn labels(&self, stem: &str) -> Option<&[usize]> {
        self.labels.get(stem).map(Vec::as_slice)
    }

    pub fn store(&self) -> &dyn FeatureStore {
        self.store.as_ref()
    }

    fn build_batch(&mut self, indices: &[usize], augment: bool) -> SegResult<Batch> {
        let rate = self.options.sample_rate;
        let mut inputs = Vec::with_capacity(indices.len());
        let mut targets = Vec::with_capacity(indices.len());
        let mut ids = Vec::with_capacity(indices.len());

        for &idx in indices {
            let stem = &self.videos[idx];
            let raw = self.store.load_raw(stem)?;
            let labels = self
                .labels
                .get(stem)
                .ok_or_else(|| SegError::Io(format!("no ground truth for {}", stem)))?;
            let frames = raw.ncols().min(labels.len());
            let offset = if augment && rate > 1 {
                self.rng.gen_range(0..rate)
            } else {
                0
            };

            let features = subsample(&raw.slice(s![.., ..frames]).to_owned(), offset, rate)?;
            let target: Vec<i64> = labels[..frames]
                .iter()
                .skip(offset)
                .step_by(rate)
                .map(|&c| c as i64)
                .collect();
            inputs.push(features);
            targets.push(target);
            ids.push(stem.clone());
        }

        let channels = inputs.first().map_or(0, |f| f.nrows());
        let lengths: Vec<usize> = targets.iter().map(Vec::len).collect();
        let max_len = lengths.iter().copied().max().unwrap_or(0);
        if max_len == 0 {
            return Err(SegError::EmptySequence);
        }
        let batch = ids.len();

        let mut input = vec![0f32; batch * channels * max_len];
        let mut target = vec![IGNORE_INDEX; batch * max_len];
        for (b, (features, labels)) in inputs.iter().zip(&targets).enumerate() {
            if features.nrows() != channels {
                return Err(SegError::DimensionMismatch {
                    expected: channels,
                    got: features.nrows(),
                });
            }
            for ((c, t), &v) in features.indexed_iter() {
                input[(b * channels + c) * max_len + t] = v;
            }
            target[b * max_len..b * max_len + labels.len()].copy_from_slice(labels);
        }

        let device = self.ctx.device();
        Ok(Batch {
            input: Tensor::from_vec(input, (batch, channels, max_len), device)?
                .to_dtype(self.ctx.dtype())?,
            target: Tensor::from_vec(target, (batch, max_len), device)?,
            mask: crate::mask::sequence_mask(&lengths, self.num_classes, max_len, self.ctx.dtype(), device)?,
            ids,
            lengths,
        })
    }
}

impl BatchSource for SequenceBatchGenerator {
    fn next_batch(&mut self, batch_size: usize, augment: bool) -> SegResult<Batch> {
        if !self.has_next() {
            return Err(SegError::EmptySequence);
        }
        let end = (self.position + batch_size.max(1)).min(self.order.len());
        let indices = self.order[self.position..end].to_vec();
        self.position = end;
        self.build_batch(&indices, augment)
    }

    fn has_next(&self) -> bool {
        self.position < self.order.len()
    }

    fn reset(&mut self) {
        self.position = 0;
        if self.options.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    fn len(&self) -> usize {
        self.videos.len().div_ceil(self.options.batch_size)
    }

    fn videos(&self) -> &[String] {
        &self.videos
    }
}
