//! # Segmentation Training CLI
//!
//! ## Usage
//!
//! ```bash
//! # Breakfast split 1, features subsampled by 1
//! hyperseg_train --data data/breakfast --split 1 --epochs 120
//!
//! # Override the model from JSON and log to TensorBoard
//! hyperseg_train --data data/breakfast --model-config tiny.json --log-dir logs
//!
//! # Smoke run on generated data
//! hyperseg_train --synthetic --epochs 2
//! ```

use clap::Parser;
use std::path::PathBuf;

use hyperseg::config::{load_json, SegmenterConfig, TrainingConfig};
use hyperseg::data::{ActionDict, LoaderOptions, NpyFeatureStore, SequenceBatchGenerator};
use hyperseg::{BatchSource, ExecContext, Trainer};

/// Train the segmentation cascade
#[derive(Parser, Debug)]
#[command(name = "hyperseg_train")]
#[command(about = "Train a temporal action segmentation model with a hyperbolic hierarchy loss")]
#[command(version)]
struct Args {
    /// Dataset root containing features/, groundTruth/, splits/ and mapping.txt
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Split number
    #[arg(short, long, default_value = "1")]
    split: usize,

    /// Where checkpoints are written
    #[arg(long, default_value = "models")]
    model_dir: PathBuf,

    #[arg(short, long)]
    epochs: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Temporal subsampling of features and labels
    #[arg(long, default_value = "1")]
    sample_rate: usize,

    /// Model config JSON (defaults to the Breakfast preset)
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// Training config JSON
    #[arg(long)]
    train_config: Option<PathBuf>,

    /// Tensorboard log directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long, default_value = "19980125")]
    seed: u64,

    /// Use generated sequences (ignores --data)
    #[arg(long)]
    synthetic: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ctx = ExecContext::best_available();

    let mut train_cfg: TrainingConfig = match &args.train_config {
        Some(path) => load_json(path)?,
        None => TrainingConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        train_cfg.num_epochs = epochs;
    }
    if let Some(lr) = args.learning_rate {
        train_cfg.learning_rate = lr;
    }
    if let Some(dir) = &args.log_dir {
        train_cfg.log_dir = Some(dir.display().to_string());
    }
    train_cfg.sample_rate = args.sample_rate;
    train_cfg.seed = args.seed;

    let options = LoaderOptions {
        sample_rate: args.sample_rate,
        batch_size: train_cfg.batch_size,
        shuffle: true,
        seed: args.seed,
    };

    let (mut train_gen, model_cfg) = if args.synthetic || args.data.is_none() {
        log::info!("Generating synthetic sequences...");
        let model_cfg = match &args.model_config {
            Some(path) => load_json(path)?,
            None => SegmenterConfig::tiny(16, 4),
        };
        let gen = SequenceBatchGenerator::synthetic(
            8,
            model_cfg.input_dim,
            model_cfg.num_classes,
            64,
            options,
            ctx.clone(),
        )?;
        (gen, model_cfg)
    } else {
        let root = args.data.clone().unwrap_or_default();
        let actions = ActionDict::from_file(root.join("mapping.txt"))?;
        let model_cfg = match &args.model_config {
            Some(path) => load_json(path)?,
            None => SegmenterConfig::breakfast(actions.len()),
        };
        let gen = SequenceBatchGenerator::from_split(
            root.join("splits").join(format!("train.split{}.bundle", args.split)),
            root.join("groundTruth"),
            Box::new(NpyFeatureStore::new(root.join("features"))),
            &actions,
            options,
            ctx.clone(),
        )?;
        (gen, model_cfg)
    };
    log::info!("{} training videos, {} batches per epoch", train_gen.videos().len(), train_gen.len());

    let mut trainer = Trainer::new(model_cfg, train_cfg, ctx)?;
    let model_dir = args.model_dir.join(format!("split_{}", args.split));
    let history = trainer.train(&mut train_gen, None, Some(&model_dir))?;

    if let Some(last) = history.last() {
        log::info!("Finished: final epoch loss {:.6}", last.loss);
    }
    Ok(())
}
