//! Training loop for the pooling classifier.
//!
//! The trainer is a small state machine:
//!
//! ```text
//! Idle ─load()─▶ Loading ─▶ Training(1) ─▶ Evaluating(1) ─▶ Training(2) ─▶ ... ─▶ Done
//! ```
//!
//! `load` reads both splits through a [`DatasetCache`], checks that they agree
//! on class count and feature width, and builds the network and an Adam
//! optimizer. Each `run_epoch` call performs one optimization pass over the
//! training split followed by accuracy evaluation on both splits.
//!
//! # Example
//!
//! ```rust,no_run
//! use candle_core::Device;
//! use classpool_data::{DatasetCache, DatasetConfig};
//! use classpool_nn::training::{TrainConfig, Trainer};
//!
//! let cache = DatasetCache::new(DatasetConfig::new("./data/"));
//! let mut trainer = Trainer::new(TrainConfig::default(), Device::Cpu);
//! trainer.load(&cache)?;
//! trainer.run(|r| {
//!     println!("{} {:.5} {:.5} {:.5}", r.epoch, r.loss, r.train_accuracy, r.test_accuracy)
//! })?;
//! # Ok::<(), classpool_nn::Error>(())
//! ```

use crate::error::{Error, Result};
use crate::model::{PoolNet, PoolNetConfig};
use candle_core::{DType, Device, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use classpool_data::{DatasetCache, GraphDataset, GraphLoader, LoaderConfig, Split};
use std::fmt;
use tracing::{debug, info};

/// Training configuration.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Number of epochs (default: 200).
    pub epochs: usize,
    /// Adam learning rate (default: 0.0005).
    pub learning_rate: f64,
    /// Graphs per batch (default: 32).
    pub batch_size: usize,
    /// Pooling keep ratio (default: 0.8).
    pub ratio: f64,
    /// Convolution width (default: 128).
    pub hidden: usize,
    /// Head dropout (default: 0.5).
    pub dropout: f32,
    /// Shuffle the training split every epoch (default: false).
    pub shuffle: bool,
    /// Shuffle seed (default: None).
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 200,
            learning_rate: 0.0005,
            batch_size: 32,
            ratio: 0.8,
            hidden: 128,
            dropout: 0.5,
            shuffle: false,
            seed: None,
        }
    }
}

impl TrainConfig {
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = ratio;
        self
    }

    pub fn with_hidden(mut self, hidden: usize) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool, seed: Option<u64>) -> Self {
        self.shuffle = shuffle;
        self.seed = seed;
        self
    }

    fn loader_config(&self, epoch: usize, shuffle: bool) -> LoaderConfig {
        let config = LoaderConfig::default()
            .with_batch_size(self.batch_size)
            .with_shuffle(shuffle);
        match self.seed {
            Some(seed) => config.with_seed(seed.wrapping_add(epoch as u64)),
            None => config,
        }
    }
}

/// Where the trainer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loading,
    /// Optimizing; `epoch` is 1-based.
    Training { epoch: usize },
    Evaluating { epoch: usize },
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Loading => write!(f, "loading"),
            Phase::Training { epoch } => write!(f, "training (epoch {epoch})"),
            Phase::Evaluating { epoch } => write!(f, "evaluating (epoch {epoch})"),
            Phase::Done => write!(f, "done"),
        }
    }
}

/// Metrics of one finished epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    /// Mean training loss per graph.
    pub loss: f64,
    pub train_accuracy: f64,
    pub test_accuracy: f64,
}

impl fmt::Display for EpochReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Epoch: {:03}, Loss: {:.5}, Train Acc: {:.5}, Test Acc: {:.5}",
            self.epoch, self.loss, self.train_accuracy, self.test_accuracy
        )
    }
}

/// Check that both splits are usable and agree on model dimensions.
///
/// Returns `(num_features, num_classes)`.
pub fn check_splits(train: &GraphDataset, test: &GraphDataset) -> Result<(usize, usize)> {
    if train.is_empty() {
        return Err(Error::EmptySplit(Split::Train));
    }
    if test.is_empty() {
        return Err(Error::EmptySplit(Split::Test));
    }
    if train.num_classes() != test.num_classes() {
        return Err(Error::DimensionMismatch {
            what: "num_classes",
            train: train.num_classes(),
            test: test.num_classes(),
        });
    }
    if train.num_features() != test.num_features() {
        return Err(Error::DimensionMismatch {
            what: "num_features",
            train: train.num_features(),
            test: test.num_features(),
        });
    }
    Ok((train.num_features(), train.num_classes()))
}

struct Session {
    train: GraphDataset,
    test: GraphDataset,
    varmap: VarMap,
    model: PoolNet,
    optimizer: AdamW,
}

/// Drives loading, optimization and evaluation.
pub struct Trainer {
    config: TrainConfig,
    device: Device,
    phase: Phase,
    session: Option<Session>,
}

impl Trainer {
    pub fn new(config: TrainConfig, device: Device) -> Self {
        Self {
            config,
            device,
            phase: Phase::Idle,
            session: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> Option<&PoolNet> {
        self.session.as_ref().map(|s| &s.model)
    }

    /// Trainable parameters, once loaded.
    pub fn varmap(&self) -> Option<&VarMap> {
        self.session.as_ref().map(|s| &s.varmap)
    }

    pub fn dataset(&self, split: Split) -> Option<&GraphDataset> {
        self.session.as_ref().map(|s| match split {
            Split::Train => &s.train,
            Split::Test => &s.test,
        })
    }

    /// Load both splits and build the network.
    ///
    /// On failure the trainer returns to `Idle` so loading can be retried.
    pub fn load(&mut self, cache: &DatasetCache) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(Error::Training(format!("cannot load while {}", self.phase)));
        }
        self.phase = Phase::Loading;

        let session = match self.open_session(cache) {
            Ok(session) => session,
            Err(e) => {
                self.phase = Phase::Idle;
                return Err(e);
            }
        };
        self.session = Some(session);
        self.phase = if self.config.epochs == 0 {
            Phase::Done
        } else {
            Phase::Training { epoch: 1 }
        };
        Ok(())
    }

    fn open_session(&self, cache: &DatasetCache) -> Result<Session> {
        let train = cache.load(Split::Train)?;
        let test = cache.load(Split::Test)?;
        let (num_features, num_classes) = check_splits(&train, &test)?;
        info!(
            train = train.len(),
            test = test.len(),
            num_features,
            num_classes,
            "datasets ready"
        );

        let config = PoolNetConfig::new(num_features, num_classes)
            .with_hidden(self.config.hidden)
            .with_ratio(self.config.ratio)
            .with_dropout(self.config.dropout);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let model = PoolNet::new(&config, vb)?;
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: self.config.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        Ok(Session {
            train,
            test,
            varmap,
            model,
            optimizer,
        })
    }

    /// Train for one epoch, then evaluate both splits.
    pub fn run_epoch(&mut self) -> Result<EpochReport> {
        let epoch = match self.phase {
            Phase::Training { epoch } => epoch,
            other => return Err(Error::Training(format!("cannot train while {other}"))),
        };
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Training("datasets not loaded".into()))?;

        let loss = session.train_pass(&self.config, epoch, &self.device)?;

        self.phase = Phase::Evaluating { epoch };
        let train_accuracy = session.accuracy(Split::Train, &self.config, &self.device)?;
        let test_accuracy = session.accuracy(Split::Test, &self.config, &self.device)?;

        self.phase = if epoch >= self.config.epochs {
            Phase::Done
        } else {
            Phase::Training { epoch: epoch + 1 }
        };

        let report = EpochReport {
            epoch,
            loss,
            train_accuracy,
            test_accuracy,
        };
        debug!(epoch, loss, train_accuracy, test_accuracy, "epoch finished");
        Ok(report)
    }

    /// Run all remaining epochs, reporting each one.
    pub fn run(&mut self, mut on_epoch: impl FnMut(&EpochReport)) -> Result<Vec<EpochReport>> {
        let mut reports = Vec::new();
        while self.phase != Phase::Done {
            let report = self.run_epoch()?;
            on_epoch(&report);
            reports.push(report);
        }
        Ok(reports)
    }
}

impl Session {
    fn train_pass(&mut self, config: &TrainConfig, epoch: usize, device: &Device) -> Result<f64> {
        let mut loader = GraphLoader::new(
            &self.train,
            config.loader_config(epoch, config.shuffle),
            device.clone(),
        );
        let mut total = 0.0;
        for batch in loader.iter() {
            let batch = batch?;
            let log_probs = self.model.forward_batch(&batch, true)?;
            let loss = candle_nn::loss::nll(&log_probs, &batch.y)?;
            self.optimizer.backward_step(&loss)?;
            total += batch.num_graphs as f64 * f64::from(loss.to_scalar::<f32>()?);
        }
        Ok(total / self.train.len() as f64)
    }

    fn accuracy(&self, split: Split, config: &TrainConfig, device: &Device) -> Result<f64> {
        let dataset = match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        };
        let mut loader = GraphLoader::new(dataset, config.loader_config(0, false), device.clone());
        let mut correct = 0.0;
        for batch in loader.iter() {
            let batch = batch?;
            let pred = self
                .model
                .forward_batch(&batch, false)?
                .argmax(D::Minus1)?;
            correct += f64::from(
                pred.eq(&batch.y)?
                    .to_dtype(DType::F32)?
                    .sum_all()?
                    .to_scalar::<f32>()?,
            );
        }
        Ok(correct / dataset.len() as f64)
    }
}
