//! In-memory graph dataset and its on-disk cache.
//!
//! Each split is built once from its raw files and persisted as a single
//! safetensors artifact under `<root>/processed/`. Later loads read the
//! artifact and never touch the raw files again; deleting the artifact is the
//! only way to force a rebuild.
//!
//! # Artifact layout
//!
//! | Tensor        | DType | Shape        | Present when |
//! |---------------|-------|--------------|--------------|
//! | `meta`        | u32   | `[2]`        | always: `[num_samples, num_features]` |
//! | `x`           | f32   | `[N, F]`     | `num_samples > 0` |
//! | `node_ids`    | i64   | `[N]`        | `num_samples > 0` |
//! | `y`           | u32   | `[S]`        | `num_samples > 0` |
//! | `node_slices` | i64   | `[S + 1]`    | `num_samples > 0` |
//! | `edge_index`  | i64   | `[2, E]`     | `E > 0` |
//! | `edge_slices` | i64   | `[S + 1]`    | `E > 0` |

use crate::error::{Error, Result};
use crate::record::read_raw;
use crate::sample::{build_samples, EdgeIndex, GraphSample};
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Number of classes in the reference dataset.
pub const DEFAULT_NUM_CLASSES: usize = 15;

/// Dataset partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Train, Split::Test];

    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An ordered collection of samples with uniform feature width.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDataset {
    samples: Vec<GraphSample>,
    num_features: usize,
    num_classes: usize,
}

impl GraphDataset {
    /// Wrap samples, checking that every sample has the same feature width.
    pub fn new(samples: Vec<GraphSample>) -> Result<Self> {
        let num_features = samples.first().map_or(0, GraphSample::num_features);
        for (index, sample) in samples.iter().enumerate() {
            if sample.num_features() != num_features {
                return Err(Error::InvalidSample {
                    index,
                    reason: format!(
                        "has {} features, dataset has {}",
                        sample.num_features(),
                        num_features
                    ),
                });
            }
        }
        let num_classes = samples
            .iter()
            .map(|s| s.label() as usize + 1)
            .max()
            .unwrap_or(0);
        Ok(Self {
            samples,
            num_features,
            num_classes,
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[GraphSample] {
        &self.samples
    }

    pub fn get(&self, index: usize) -> Option<&GraphSample> {
        self.samples.get(index)
    }

    /// Feature width shared by all samples (0 when empty).
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// One past the largest label present (0 when empty).
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_nodes(&self) -> usize {
        self.samples.iter().map(GraphSample::num_nodes).sum()
    }

    pub fn num_edges(&self) -> usize {
        self.samples.iter().map(GraphSample::num_edges).sum()
    }

    /// Write the dataset as a safetensors artifact.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tensors = self.to_tensors()?;
        candle_core::safetensors::save(&tensors, path).map_err(|source| Error::Cache {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read a dataset written by [`GraphDataset::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let cache_err = |source: candle_core::Error| Error::Cache {
            path: path.to_path_buf(),
            source,
        };
        let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(cache_err)?;
        Self::from_tensors(&tensors).map_err(|e| match e {
            Error::Tensor(source) => cache_err(source),
            other => other,
        })
    }

    fn to_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        let meta = vec![self.len() as u32, self.num_features as u32];
        tensors.insert("meta".to_string(), Tensor::from_vec(meta, 2, &device)?);
        if self.is_empty() {
            return Ok(tensors);
        }

        let num_nodes = self.num_nodes();
        let num_edges = self.num_edges();
        let mut x = Vec::with_capacity(num_nodes * self.num_features);
        let mut node_ids = Vec::with_capacity(num_nodes);
        let mut y = Vec::with_capacity(self.len());
        let mut node_slices = vec![0i64];
        let mut sources = Vec::with_capacity(num_edges);
        let mut targets = Vec::with_capacity(num_edges);
        let mut edge_slices = vec![0i64];

        for sample in &self.samples {
            x.extend_from_slice(sample.features());
            node_ids.extend_from_slice(sample.node_ids());
            y.push(sample.label());
            node_slices.push(node_ids.len() as i64);
            sources.extend_from_slice(&sample.edge_index().sources);
            targets.extend_from_slice(&sample.edge_index().targets);
            edge_slices.push(sources.len() as i64);
        }

        let slices_len = node_slices.len();
        tensors.insert(
            "x".to_string(),
            Tensor::from_vec(x, (num_nodes, self.num_features), &device)?,
        );
        tensors.insert(
            "node_ids".to_string(),
            Tensor::from_vec(node_ids, num_nodes, &device)?,
        );
        tensors.insert("y".to_string(), Tensor::from_vec(y, self.len(), &device)?);
        tensors.insert(
            "node_slices".to_string(),
            Tensor::from_vec(node_slices, slices_len, &device)?,
        );
        if num_edges > 0 {
            sources.extend(targets);
            tensors.insert(
                "edge_index".to_string(),
                Tensor::from_vec(sources, (2, num_edges), &device)?,
            );
            tensors.insert(
                "edge_slices".to_string(),
                Tensor::from_vec(edge_slices, slices_len, &device)?,
            );
        }
        Ok(tensors)
    }

    fn from_tensors(tensors: &HashMap<String, Tensor>) -> Result<Self> {
        let get = |name: &str| {
            tensors.get(name).ok_or_else(|| {
                Error::Tensor(candle_core::Error::Msg(format!("missing tensor `{name}`")))
            })
        };

        let meta = get("meta")?.to_vec1::<u32>()?;
        let (num_samples, num_features) = match meta.as_slice() {
            [s, f] => (*s as usize, *f as usize),
            _ => {
                return Err(Error::Tensor(candle_core::Error::Msg(
                    "malformed `meta` tensor".into(),
                )))
            }
        };
        if num_samples == 0 {
            return Ok(Self::empty());
        }

        let x = get("x")?.flatten_all()?.to_vec1::<f32>()?;
        let node_ids = get("node_ids")?.to_vec1::<i64>()?;
        let y = get("y")?.to_vec1::<u32>()?;
        let node_slices = get("node_slices")?.to_vec1::<i64>()?;
        let (edges, edge_slices) = match tensors.get("edge_index") {
            Some(edge_index) => (
                edge_index.to_vec2::<i64>()?,
                get("edge_slices")?.to_vec1::<i64>()?,
            ),
            None => (vec![Vec::new(), Vec::new()], vec![0i64; num_samples + 1]),
        };

        if y.len() != num_samples
            || node_slices.len() != num_samples + 1
            || edge_slices.len() != num_samples + 1
        {
            return Err(Error::Tensor(candle_core::Error::Msg(format!(
                "slice tensors do not describe {num_samples} samples"
            ))));
        }
        if edges.len() != 2 {
            return Err(Error::Tensor(candle_core::Error::Msg(
                "malformed `edge_index` tensor".into(),
            )));
        }
        if x.len() != node_ids.len() * num_features {
            return Err(Error::Tensor(candle_core::Error::Msg(format!(
                "`x` holds {} values, expected {} nodes of width {num_features}",
                x.len(),
                node_ids.len()
            ))));
        }
        let node_slices = checked_offsets(&node_slices, node_ids.len(), "node_slices")?;
        let edge_slices = checked_offsets(&edge_slices, edges[0].len(), "edge_slices")?;

        let mut samples = Vec::with_capacity(num_samples);
        for (index, label) in y.into_iter().enumerate() {
            let (n0, n1) = (node_slices[index], node_slices[index + 1]);
            let (e0, e1) = (edge_slices[index], edge_slices[index + 1]);
            let sample = GraphSample::new(
                node_ids[n0..n1].to_vec(),
                x[n0 * num_features..n1 * num_features].to_vec(),
                label,
                EdgeIndex::new(edges[0][e0..e1].to_vec(), edges[1][e0..e1].to_vec()),
            )
            .map_err(|e| match e {
                Error::InvalidSample { reason, .. } => Error::InvalidSample { index, reason },
                other => other,
            })?;
            samples.push(sample);
        }
        Self::new(samples)
    }
}

/// Slice offsets must start at 0, never decrease and end at `end`.
fn checked_offsets(offsets: &[i64], end: usize, name: &str) -> Result<Vec<usize>> {
    let valid = offsets.first() == Some(&0)
        && offsets.last() == Some(&(end as i64))
        && offsets.windows(2).all(|w| w[0] <= w[1]);
    if !valid {
        return Err(Error::Tensor(candle_core::Error::Msg(format!(
            "`{name}` is not a valid offset table for {end} entries"
        ))));
    }
    Ok(offsets.iter().map(|&o| o as usize).collect())
}

/// What to do when the edge file's class count is wrong.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MismatchPolicy {
    /// Log a warning and persist an empty split.
    #[default]
    Empty,
    /// Return [`Error::FormatMismatch`].
    Fail,
}

/// Dataset cache configuration.
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    /// Directory holding the raw files and the `processed/` cache (default: `./data/`).
    pub root: PathBuf,
    /// Expected number of class entries in the edge file (default: 15).
    pub num_classes: usize,
    /// Handling of a class-count mismatch (default: [`MismatchPolicy::Empty`]).
    pub on_mismatch: MismatchPolicy,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/"),
            num_classes: DEFAULT_NUM_CLASSES,
            on_mismatch: MismatchPolicy::Empty,
        }
    }
}

impl DatasetConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    pub fn with_mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.on_mismatch = policy;
        self
    }
}

type PreFilter = Box<dyn Fn(&GraphSample) -> bool>;
type PreTransform = Box<dyn Fn(GraphSample) -> GraphSample>;

/// Builds splits from raw files on first use and reloads them from disk after.
pub struct DatasetCache {
    config: DatasetConfig,
    pre_filter: Option<PreFilter>,
    pre_transform: Option<PreTransform>,
}

impl DatasetCache {
    pub fn new(config: DatasetConfig) -> Self {
        Self {
            config,
            pre_filter: None,
            pre_transform: None,
        }
    }

    /// Drop samples for which `filter` returns false before they are cached.
    pub fn with_pre_filter(mut self, filter: impl Fn(&GraphSample) -> bool + 'static) -> Self {
        self.pre_filter = Some(Box::new(filter));
        self
    }

    /// Rewrite every sample before it is cached.
    pub fn with_pre_transform(
        mut self,
        transform: impl Fn(GraphSample) -> GraphSample + 'static,
    ) -> Self {
        self.pre_transform = Some(Box::new(transform));
        self
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.config.root.join("processed")
    }

    /// Location of the cached artifact for `split`.
    pub fn processed_path(&self, split: Split) -> PathBuf {
        self.processed_dir()
            .join(format!("{}.safetensors", split.name()))
    }

    /// Node file and edge file for `split`.
    pub fn raw_paths(&self, split: Split) -> (PathBuf, PathBuf) {
        let root = &self.config.root;
        (
            root.join(format!("sub_{}_gcn_dataset.txt", split.name())),
            root.join(format!("sub_{}_edges.txt", split.name())),
        )
    }

    /// Whether `split` will be served from the cache.
    pub fn is_cached(&self, split: Split) -> bool {
        self.processed_path(split).is_file()
    }

    /// Load `split`, building and caching it from the raw files if needed.
    pub fn load(&self, split: Split) -> Result<GraphDataset> {
        let path = self.processed_path(split);
        if path.is_file() {
            let dataset = GraphDataset::load(&path)?;
            info!(
                split = %split,
                path = %path.display(),
                samples = dataset.len(),
                "loaded cached split"
            );
            return Ok(dataset);
        }

        info!(split = %split, root = %self.config.root.display(), "processing raw files");
        let dataset = self.process(split)?;

        std::fs::create_dir_all(self.processed_dir()).map_err(|source| Error::Io {
            path: self.processed_dir(),
            source,
        })?;
        dataset.save(&path)?;
        info!(
            split = %split,
            path = %path.display(),
            samples = dataset.len(),
            "wrote cached split"
        );
        Ok(dataset)
    }

    fn process(&self, split: Split) -> Result<GraphDataset> {
        let (node_path, edge_path) = self.raw_paths(split);
        let (records, edges) = match read_raw(&node_path, &edge_path, self.config.num_classes) {
            Ok(raw) => raw,
            Err(Error::FormatMismatch { expected, found })
                if self.config.on_mismatch == MismatchPolicy::Empty =>
            {
                warn!(
                    split = %split,
                    expected,
                    found,
                    "edge file class count mismatch, split will be empty"
                );
                return Ok(GraphDataset::empty());
            }
            Err(e) => return Err(e),
        };

        let mut samples = build_samples(&records, &edges)?;
        if let Some(filter) = &self.pre_filter {
            samples.retain(|s| filter(s));
        }
        if let Some(transform) = &self.pre_transform {
            samples = samples.into_iter().map(transform).collect();
        }
        GraphDataset::new(samples)
    }
}
