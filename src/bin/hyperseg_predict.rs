//! # Segmentation Prediction CLI
//!
//! Writes one recognition file per test video.
//!
//! ## Usage
//!
//! ```bash
//! hyperseg_predict --data data/breakfast --split 1 --epoch 120 --results results/split_1
//! ```

use clap::Parser;
use std::path::PathBuf;

use hyperseg::data::{ActionDict, LoaderOptions, NpyFeatureStore, SequenceBatchGenerator};
use hyperseg::training::predict;
use hyperseg::ExecContext;

#[derive(Parser, Debug)]
#[command(name = "hyperseg_predict")]
#[command(about = "Frame-level action recognition with a trained checkpoint")]
#[command(version)]
struct Args {
    /// Dataset root containing features/, groundTruth/, splits/ and mapping.txt
    #[arg(short, long)]
    data: PathBuf,

    #[arg(short, long, default_value = "1")]
    split: usize,

    /// Directory holding epoch-N checkpoints
    #[arg(long, default_value = "models")]
    model_dir: PathBuf,

    /// Checkpoint epoch to load
    #[arg(short, long, default_value = "120")]
    epoch: usize,

    #[arg(short, long, default_value = "results")]
    results: PathBuf,

    #[arg(long, default_value = "1")]
    sample_rate: usize,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ctx = ExecContext::best_available();

    let actions = ActionDict::from_file(args.data.join("mapping.txt"))?;
    let store = NpyFeatureStore::new(args.data.join("features"));
    let test_gen = SequenceBatchGenerator::from_split(
        args.data.join("splits").join(format!("test.split{}.bundle", args.split)),
        args.data.join("groundTruth"),
        Box::new(store.clone()),
        &actions,
        LoaderOptions {
            sample_rate: args.sample_rate,
            shuffle: false,
            ..Default::default()
        },
        ctx.clone(),
    )?;

    let model_dir = args.model_dir.join(format!("split_{}", args.split));
    let files = predict(
        &model_dir,
        args.results.join(format!("split_{}", args.split)),
        &store,
        &test_gen,
        args.epoch,
        &actions,
        args.sample_rate,
        &ctx,
    )?;
    log::info!("Predicted {} videos", files.len());
    Ok(())
}
