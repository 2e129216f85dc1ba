//! Graph convolution and top-k pooling on candle.
//!
//! - [`conv`]: [`GraphConv`] message passing with sum aggregation
//! - [`pool`]: [`TopKPooling`] and per-graph max/mean readouts
//! - [`model`]: [`PoolNet`], three conv/pool stages and an MLP head
//! - [`training`]: the [`Trainer`] state machine
//!
//! Edge tensors are `(2, E)` u32 row indices, messages flow from row 0 to
//! row 1, and a `batch` vector assigns every node row to its graph.

pub mod conv;
mod error;
pub mod model;
pub mod pool;
pub mod training;

pub use conv::GraphConv;
pub use error::{Error, Result};
pub use model::{PoolNet, PoolNetConfig};
pub use pool::{global_max_pool, global_mean_pool, TopKPooling};
pub use training::{check_splits, EpochReport, Phase, TrainConfig, Trainer};
