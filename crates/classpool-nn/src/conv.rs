//! Message-passing graph convolution.
//!
//! [`GraphConv`] follows the higher-order GNN rule of Morris et al.:
//!
//! ```text
//! h_i' = W_rel * SUM_{j -> i} h_j  +  W_root * h_i
//! ```
//!
//! Messages flow from `edge_index[0]` (source) to `edge_index[1]` (target).
//!
//! # Reference
//!
//! Morris et al., "Weisfeiler and Leman Go Neural: Higher-order Graph Neural
//! Networks", AAAI 2019.

use candle_core::{Result, Tensor};
use candle_nn::{linear, linear_no_bias, Linear, Module, VarBuilder};

/// Graph convolution with sum aggregation and a separate root transform.
pub struct GraphConv {
    /// Applied to aggregated neighbour features (with bias).
    lin_rel: Linear,
    /// Applied to the node's own features (no bias).
    lin_root: Linear,
    in_features: usize,
    out_features: usize,
}

impl GraphConv {
    /// Create a new layer.
    ///
    /// # Arguments
    /// - `in_features`: Input feature dimension
    /// - `out_features`: Output feature dimension
    /// - `vb`: Variable builder for parameter initialization
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let lin_rel = linear(in_features, out_features, vb.pp("lin_rel"))?;
        let lin_root = linear_no_bias(in_features, out_features, vb.pp("lin_root"))?;
        Ok(Self {
            lin_rel,
            lin_root,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `x`: Node features (N x in_features)
    /// - `edge_index`: Edge list as (2 x E) u32 tensor of [src; dst] row indices
    ///
    /// # Returns
    /// - Node embeddings (N x out_features)
    pub fn forward(&self, x: &Tensor, edge_index: &Tensor) -> Result<Tensor> {
        let aggregated = aggregate_sum(x, edge_index)?;
        self.lin_rel.forward(&aggregated)? + self.lin_root.forward(x)?
    }
}

/// Sum of incoming neighbour features per node.
///
/// Nodes without incoming edges receive zeros; an empty edge list yields an
/// all-zero tensor shaped like `x`.
pub fn aggregate_sum(x: &Tensor, edge_index: &Tensor) -> Result<Tensor> {
    if edge_index.dim(1)? == 0 {
        return x.zeros_like();
    }
    let src = edge_index.get(0)?;
    let dst = edge_index.get(1)?;
    let messages = x.index_select(&src, 0)?;
    x.zeros_like()?.index_add(&dst, &messages, 0)
}
