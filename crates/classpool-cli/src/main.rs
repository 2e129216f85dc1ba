//! classpool - train a graph pooling classifier from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Build (or reuse) the cached datasets under ./data/ and train for 200 epochs
//! classpool train
//!
//! # Smaller run on CPU with per-epoch shuffling
//! classpool train --root ./toy --num-classes 2 --epochs 20 --shuffle --seed 7 --cpu
//!
//! # Inspect both splits
//! classpool stats --root ./data/
//! ```
//!
//! Logs go to stderr and are controlled by `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use classpool_data::{
    DatasetCache, DatasetConfig, GraphDataset, MismatchPolicy, Split, DEFAULT_NUM_CLASSES,
};
use classpool_nn::{TrainConfig, Trainer};
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "classpool")]
#[command(about = "Graph pooling classifier over class neighbourhoods", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train and evaluate the classifier
    Train {
        /// Dataset root holding the raw files and the processed/ cache
        #[arg(long, default_value = "./data/")]
        root: PathBuf,

        /// Number of epochs
        #[arg(long, default_value = "200")]
        epochs: usize,

        /// Adam learning rate
        #[arg(long, default_value = "0.0005")]
        lr: f64,

        /// Graphs per batch
        #[arg(long, default_value = "32")]
        batch_size: usize,

        /// Fraction of nodes kept by each pooling stage
        #[arg(long, default_value = "0.8")]
        ratio: f64,

        /// Number of classes in the edge file
        #[arg(long, default_value_t = DEFAULT_NUM_CLASSES)]
        num_classes: usize,

        /// Shuffle the training split every epoch
        #[arg(long)]
        shuffle: bool,

        /// Shuffle seed
        #[arg(long)]
        seed: Option<u64>,

        /// Fail when the edge file disagrees with --num-classes
        #[arg(long)]
        strict: bool,

        /// Force CPU even when CUDA is available
        #[arg(long)]
        cpu: bool,
    },

    /// Show statistics about both splits
    Stats {
        /// Dataset root
        #[arg(long, default_value = "./data/")]
        root: PathBuf,

        /// Number of classes in the edge file
        #[arg(long, default_value_t = DEFAULT_NUM_CLASSES)]
        num_classes: usize,

        /// Fail when the edge file disagrees with --num-classes
        #[arg(long)]
        strict: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            root,
            epochs,
            lr,
            batch_size,
            ratio,
            num_classes,
            shuffle,
            seed,
            strict,
            cpu,
        } => {
            let config = TrainConfig::default()
                .with_epochs(epochs)
                .with_learning_rate(lr)
                .with_batch_size(batch_size)
                .with_ratio(ratio)
                .with_shuffle(shuffle, seed);
            cmd_train(&root, num_classes, strict, cpu, config)
        }
        Commands::Stats {
            root,
            num_classes,
            strict,
        } => cmd_stats(&root, num_classes, strict),
    }
}

fn dataset_cache(root: &Path, num_classes: usize, strict: bool) -> DatasetCache {
    let policy = if strict {
        MismatchPolicy::Fail
    } else {
        MismatchPolicy::Empty
    };
    DatasetCache::new(
        DatasetConfig::new(root)
            .with_num_classes(num_classes)
            .with_mismatch_policy(policy),
    )
}

fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    Device::cuda_if_available(0).context("Failed to initialize compute device")
}

fn device_name(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

fn cmd_train(
    root: &Path,
    num_classes: usize,
    strict: bool,
    cpu: bool,
    config: TrainConfig,
) -> Result<()> {
    let device = select_device(cpu)?;
    println!("device: {}", device_name(&device));

    let cache = dataset_cache(root, num_classes, strict);
    let mut trainer = Trainer::new(config, device);

    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Loading datasets from {}...", root.display()));
    trainer
        .load(&cache)
        .with_context(|| format!("Failed to prepare datasets under {}", root.display()))?;
    pb.finish_with_message(format!("Loaded in {:.2?}", start.elapsed()));

    let start = Instant::now();
    let reports = trainer
        .run(|report| println!("{report}"))
        .context("Training failed")?;

    if let Some(last) = reports.last() {
        info!(
            epochs = reports.len(),
            test_accuracy = last.test_accuracy,
            elapsed = ?start.elapsed(),
            "training finished"
        );
    }
    Ok(())
}

fn print_split(split: Split, dataset: &GraphDataset) {
    println!("[{split}]");
    println!("Samples:  {}", dataset.len());
    println!("Nodes:    {}", dataset.num_nodes());
    println!("Edges:    {}", dataset.num_edges());
    println!("Features: {}", dataset.num_features());
    println!("Classes:  {}", dataset.num_classes());
}

fn cmd_stats(root: &Path, num_classes: usize, strict: bool) -> Result<()> {
    let cache = dataset_cache(root, num_classes, strict);

    println!("Dataset Statistics");
    println!("==================");
    for split in Split::ALL {
        let dataset = cache
            .load(split)
            .with_context(|| format!("Failed to load {split} split from {}", root.display()))?;
        print_split(split, &dataset);
    }
    Ok(())
}
