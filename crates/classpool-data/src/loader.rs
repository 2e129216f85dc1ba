//! Mini-batching of variable-size graphs.
//!
//! A [`Batch`] is the disjoint union of its samples: node rows are stacked,
//! edges are rewritten to row indices and shifted by the number of nodes in
//! the samples before them, and `batch[i]` names the sample node `i` came
//! from.
//!
//! ```text
//! sample 0: nodes a b     edges a->b       batch = [0, 0, 1, 2, 2, 2]
//! sample 1: node  c                        edges = [[0, 3, 4],
//! sample 2: nodes d e f   edges d->e, e->f            [1, 4, 5]]
//! ```
//!
//! Edges whose endpoints are not nodes of their own sample cannot be
//! materialized and are dropped.

use crate::dataset::GraphDataset;
use crate::error::Result;
use crate::sample::GraphSample;
use candle_core::{Device, Tensor};
use rand::prelude::*;
use rand_xorshift::XorShiftRng;
use std::collections::HashMap;
use tracing::trace;

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Samples per batch (default: 32).
    pub batch_size: usize,
    /// Reorder samples on every traversal (default: false).
    pub shuffle: bool,
    /// Seed for shuffling; `None` draws one from the OS.
    pub seed: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            seed: None,
        }
    }
}

impl LoaderConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// A disjoint union of graphs ready for the network.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Node features, `(num_nodes, num_features)` f32.
    pub x: Tensor,
    /// Edges as row indices into `x`, `(2, num_edges)` u32.
    pub edge_index: Tensor,
    /// Owning graph of each node, `(num_nodes,)` u32, non-decreasing.
    pub batch: Tensor,
    /// Graph labels, `(num_graphs,)` u32.
    pub y: Tensor,
    pub num_graphs: usize,
    pub num_nodes: usize,
    pub num_edges: usize,
    /// Sample edges left out because an endpoint lies outside the sample.
    pub dropped_edges: usize,
}

impl Batch {
    /// Collate samples in the given order.
    pub fn collate(samples: &[&GraphSample], device: &Device) -> Result<Self> {
        let num_features = samples.first().map_or(0, |s| s.num_features());
        let num_nodes: usize = samples.iter().map(|s| s.num_nodes()).sum();

        let mut x = Vec::with_capacity(num_nodes * num_features);
        let mut batch = Vec::with_capacity(num_nodes);
        let mut y = Vec::with_capacity(samples.len());
        let mut sources = Vec::new();
        let mut targets = Vec::new();
        let mut dropped_edges = 0;
        let mut offset = 0u32;

        for (graph, sample) in samples.iter().enumerate() {
            x.extend_from_slice(sample.features());
            batch.extend(std::iter::repeat(graph as u32).take(sample.num_nodes()));
            y.push(sample.label());

            let rows: HashMap<i64, u32> = sample
                .node_ids()
                .iter()
                .enumerate()
                .map(|(row, &id)| (id, row as u32))
                .collect();
            for (s, t) in sample.edge_index().pairs() {
                match (rows.get(&s), rows.get(&t)) {
                    (Some(&s), Some(&t)) => {
                        sources.push(offset + s);
                        targets.push(offset + t);
                    }
                    _ => dropped_edges += 1,
                }
            }
            offset += sample.num_nodes() as u32;
        }

        if dropped_edges > 0 {
            trace!(dropped_edges, "edges reach outside their sample");
        }

        let num_edges = sources.len();
        sources.extend(targets);
        Ok(Self {
            x: Tensor::from_vec(x, (num_nodes, num_features), device)?,
            edge_index: Tensor::from_vec(sources, (2, num_edges), device)?,
            batch: Tensor::from_vec(batch, num_nodes, device)?,
            y: Tensor::from_vec(y, samples.len(), device)?,
            num_graphs: samples.len(),
            num_nodes,
            num_edges,
            dropped_edges,
        })
    }
}

/// Restartable batch source over a dataset.
pub struct GraphLoader<'a> {
    dataset: &'a GraphDataset,
    config: LoaderConfig,
    device: Device,
    indices: Vec<usize>,
    rng: XorShiftRng,
}

impl<'a> GraphLoader<'a> {
    pub fn new(dataset: &'a GraphDataset, config: LoaderConfig, device: Device) -> Self {
        let seed = config.seed.unwrap_or_else(|| thread_rng().gen());
        Self {
            dataset,
            indices: (0..dataset.len()).collect(),
            rng: XorShiftRng::seed_from_u64(seed),
            config,
            device,
        }
    }

    pub fn dataset(&self) -> &GraphDataset {
        self.dataset
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Batches per traversal; the last one may be short.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.config.batch_size.max(1))
    }

    /// Start a new traversal from the beginning of the dataset.
    pub fn iter(&mut self) -> BatchIter<'_> {
        if self.config.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
        BatchIter {
            samples: self.dataset.samples(),
            indices: &self.indices,
            batch_size: self.config.batch_size.max(1),
            device: &self.device,
            position: 0,
        }
    }
}

/// One traversal of a [`GraphLoader`].
pub struct BatchIter<'a> {
    samples: &'a [GraphSample],
    indices: &'a [usize],
    batch_size: usize,
    device: &'a Device,
    position: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let chunk: Vec<&GraphSample> = self.indices[self.position..end]
            .iter()
            .map(|&i| &self.samples[i])
            .collect();
        self.position = end;
        Some(Batch::collate(&chunk, self.device))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.indices.len().saturating_sub(self.position);
        let n = remaining.div_ceil(self.batch_size);
        (n, Some(n))
    }
}

impl ExactSizeIterator for BatchIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::EdgeIndex;

    fn single(id: i64, label: u32, neighbours: &[i64]) -> GraphSample {
        let targets: Vec<i64> = neighbours.to_vec();
        GraphSample::new(
            vec![id],
            vec![id as f32, 0.0],
            label,
            EdgeIndex::new(vec![id; targets.len()], targets),
        )
        .unwrap()
    }

    fn dataset(n: usize) -> GraphDataset {
        GraphDataset::new((0..n).map(|i| single(i as i64, (i % 3) as u32, &[])).collect())
            .unwrap()
    }

    #[test]
    fn last_batch_is_short() {
        let ds = dataset(70);
        let mut loader = GraphLoader::new(&ds, LoaderConfig::default(), Device::Cpu);
        assert_eq!(loader.num_batches(), 3);

        let sizes: Vec<usize> = loader.iter().map(|b| b.unwrap().num_graphs).collect();
        assert_eq!(sizes, vec![32, 32, 6]);
    }

    #[test]
    fn traversal_preserves_order_and_restarts() {
        let ds = dataset(10);
        let mut loader = GraphLoader::new(
            &ds,
            LoaderConfig::default().with_batch_size(4),
            Device::Cpu,
        );

        for _ in 0..2 {
            let mut labels = Vec::new();
            let mut first_features = Vec::new();
            for batch in loader.iter() {
                let batch = batch.unwrap();
                labels.extend(batch.y.to_vec1::<u32>().unwrap());
                first_features.extend(
                    batch
                        .x
                        .to_vec2::<f32>()
                        .unwrap()
                        .into_iter()
                        .map(|row| row[0]),
                );
            }
            let expected: Vec<u32> = ds.samples().iter().map(|s| s.label()).collect();
            assert_eq!(labels, expected);
            assert_eq!(first_features, (0..10).map(|i| i as f32).collect::<Vec<_>>());
        }
    }

    #[test]
    fn seeded_shuffle_is_a_permutation() {
        let ds = dataset(50);
        let config = LoaderConfig::default()
            .with_batch_size(8)
            .with_shuffle(true)
            .with_seed(7);

        fn order(loader: &mut GraphLoader<'_>) -> Vec<u32> {
            loader
                .iter()
                .flat_map(|b| {
                    let x = b.unwrap().x.to_vec2::<f32>().unwrap();
                    x.into_iter().map(|row| row[0] as u32).collect::<Vec<_>>()
                })
                .collect()
        }

        let mut a = GraphLoader::new(&ds, config.clone(), Device::Cpu);
        let mut b = GraphLoader::new(&ds, config, Device::Cpu);
        let first = order(&mut a);
        assert_eq!(first, order(&mut b));

        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<u32>>());
    }

    #[test]
    fn edges_are_offset_by_prior_nodes() {
        let a = GraphSample::new(
            vec![10, 11],
            vec![0.0; 4],
            0,
            EdgeIndex::new(vec![10], vec![11]),
        )
        .unwrap();
        let b = GraphSample::new(vec![5], vec![0.0; 2], 1, EdgeIndex::default()).unwrap();
        let c = GraphSample::new(
            vec![7, 8, 9],
            vec![0.0; 6],
            2,
            EdgeIndex::new(vec![7, 8], vec![8, 9]),
        )
        .unwrap();

        let batch = Batch::collate(&[&a, &b, &c], &Device::Cpu).unwrap();
        assert_eq!(batch.num_nodes, 6);
        assert_eq!(batch.num_graphs, 3);
        assert_eq!(batch.batch.to_vec1::<u32>().unwrap(), vec![0, 0, 1, 2, 2, 2]);
        assert_eq!(
            batch.edge_index.to_vec2::<u32>().unwrap(),
            vec![vec![0, 3, 4], vec![1, 4, 5]]
        );
        assert_eq!(batch.dropped_edges, 0);
    }

    #[test]
    fn edges_to_absent_nodes_are_dropped() {
        let a = single(1, 0, &[2, 3]);
        let b = single(2, 0, &[1, 3]);
        let batch = Batch::collate(&[&a, &b], &Device::Cpu).unwrap();

        assert_eq!(batch.num_edges, 0);
        assert_eq!(batch.dropped_edges, 4);
        assert_eq!(batch.edge_index.dims(), &[2, 0]);
    }

    #[test]
    fn empty_dataset_yields_no_batches() {
        let ds = GraphDataset::empty();
        let mut loader = GraphLoader::new(&ds, LoaderConfig::default(), Device::Cpu);
        assert_eq!(loader.num_batches(), 0);
        assert_eq!(loader.iter().count(), 0);
    }
}
