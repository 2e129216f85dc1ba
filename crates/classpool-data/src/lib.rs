//! Dataset construction for class-graph classification.
//!
//! `classpool-data` turns two raw JSON files per split into a cached,
//! batchable graph dataset:
//!
//! - [`record`]: node records and per-class neighbour lists
//! - [`sample`]: one [`GraphSample`] per node record
//! - [`dataset`]: [`GraphDataset`] and the on-disk [`DatasetCache`]
//! - [`loader`]: [`GraphLoader`] producing disjoint-union [`Batch`]es
//!
//! # Example
//!
//! ```rust,no_run
//! use classpool_data::{DatasetCache, DatasetConfig, GraphLoader, LoaderConfig, Split};
//! use candle_core::Device;
//!
//! let cache = DatasetCache::new(DatasetConfig::new("./data/"));
//! let train = cache.load(Split::Train)?;
//!
//! let mut loader = GraphLoader::new(&train, LoaderConfig::default(), Device::Cpu);
//! for batch in loader.iter() {
//!     let batch = batch?;
//!     println!("{} graphs, {} nodes", batch.num_graphs, batch.num_nodes);
//! }
//! # Ok::<(), classpool_data::Error>(())
//! ```

pub mod dataset;
mod error;
pub mod loader;
pub mod record;
pub mod sample;

pub use dataset::{
    DatasetCache, DatasetConfig, GraphDataset, MismatchPolicy, Split, DEFAULT_NUM_CLASSES,
};
pub use error::{Error, Result};
pub use loader::{Batch, BatchIter, GraphLoader, LoaderConfig};
pub use record::{read_class_edges, read_node_records, read_raw, ClassEdgeList, NodeRecord};
pub use sample::{build_sample, build_samples, EdgeIndex, GraphSample};
