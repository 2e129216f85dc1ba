//! Graph sample construction.
//!
//! Every node record becomes one classification sample: the node's feature
//! row, its 0-based label, and edges from the node to the other members of its
//! class.

use crate::error::{Error, Result};
use crate::record::{ClassEdgeList, NodeRecord};
use candle_core::{Device, Tensor};

/// Edge list in node-ID space, stored as parallel source/target vectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeIndex {
    pub sources: Vec<i64>,
    pub targets: Vec<i64>,
}

impl EdgeIndex {
    pub fn new(sources: Vec<i64>, targets: Vec<i64>) -> Self {
        debug_assert_eq!(sources.len(), targets.len());
        Self { sources, targets }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Iterate `(source, target)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.sources.iter().copied().zip(self.targets.iter().copied())
    }

    /// The `[sources, targets]` rows, as a 2 x E matrix.
    pub fn to_rows(&self) -> [Vec<i64>; 2] {
        [self.sources.clone(), self.targets.clone()]
    }
}

/// One graph to classify.
///
/// Row `i` of the feature matrix belongs to node `node_ids[i]`; edges refer to
/// node IDs. Samples built from node records always hold a single node, so
/// their edges point at nodes outside the sample.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSample {
    node_ids: Vec<i64>,
    features: Vec<f32>,
    label: u32,
    edge_index: EdgeIndex,
}

impl GraphSample {
    /// Assemble a sample, checking that `features` holds one equal-width row per node.
    pub fn new(
        node_ids: Vec<i64>,
        features: Vec<f32>,
        label: u32,
        edge_index: EdgeIndex,
    ) -> Result<Self> {
        if node_ids.is_empty() {
            return Err(Error::InvalidSample {
                index: 0,
                reason: "sample has no nodes".into(),
            });
        }
        if features.len() % node_ids.len() != 0 {
            return Err(Error::InvalidSample {
                index: 0,
                reason: format!(
                    "{} feature values do not split into {} rows",
                    features.len(),
                    node_ids.len()
                ),
            });
        }
        Ok(Self {
            node_ids,
            features,
            label,
            edge_index,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.node_ids.len()
    }

    pub fn num_features(&self) -> usize {
        self.features.len() / self.node_ids.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edge_index.len()
    }

    pub fn node_ids(&self) -> &[i64] {
        &self.node_ids
    }

    /// Row-major `num_nodes x num_features` feature values.
    pub fn features(&self) -> &[f32] {
        &self.features
    }

    /// 0-based class label.
    pub fn label(&self) -> u32 {
        self.label
    }

    pub fn edge_index(&self) -> &EdgeIndex {
        &self.edge_index
    }

    /// Feature matrix as a `(num_nodes, num_features)` tensor.
    pub fn x(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.features,
            (self.num_nodes(), self.num_features()),
            device,
        )?)
    }

    /// Replace the label; used by pre-transform hooks.
    pub fn with_label(mut self, label: u32) -> Self {
        self.label = label;
        self
    }
}

/// Build the sample for one node record.
///
/// The label is shifted to 0-based and the class's neighbour list becomes the
/// edge set, minus the node itself.
pub fn build_sample(record: &NodeRecord, edges: &ClassEdgeList) -> Result<GraphSample> {
    let num_classes = edges.num_classes();
    let label = record.label - 1;
    if label < 0 || label as usize >= num_classes {
        return Err(Error::LabelOutOfRange {
            node_id: record.node_id,
            label: record.label,
            num_classes,
        });
    }

    let (sources, targets): (Vec<i64>, Vec<i64>) = edges
        .neighbours(label as usize)
        .iter()
        .filter(|&&neighbour| neighbour != record.node_id)
        .map(|&neighbour| (record.node_id, neighbour))
        .unzip();

    GraphSample::new(
        vec![record.node_id],
        record.features.clone(),
        label as u32,
        EdgeIndex::new(sources, targets),
    )
}

/// Build one sample per record, preserving order.
pub fn build_samples(records: &[NodeRecord], edges: &ClassEdgeList) -> Result<Vec<GraphSample>> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            build_sample(record, edges).map_err(|e| match e {
                Error::InvalidSample { reason, .. } => Error::InvalidSample { index, reason },
                other => other,
            })
        })
        .collect()
}
