//! Hierarchical pooling and graph-level readouts.
//!
//! - [`TopKPooling`]: learned node scoring, keeps the best `ceil(ratio * n)`
//!   nodes of every graph in the batch
//! - [`global_max_pool`], [`global_mean_pool`]: collapse each graph's nodes
//!   into one vector
//!
//! # Reference
//!
//! Gao & Ji, "Graph U-Nets", ICML 2019; Cangea et al., "Towards Sparse
//! Hierarchical Graph Classifiers", 2018.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Result of one pooling step.
#[derive(Debug, Clone)]
pub struct Pooled {
    /// Kept node features, gated by their scores (K x F).
    pub x: Tensor,
    /// Edges between kept nodes, re-indexed (2 x E') u32.
    pub edge_index: Tensor,
    /// Owning graph of each kept node (K,) u32.
    pub batch: Tensor,
    /// Indices of the kept nodes in the input.
    pub perm: Vec<u32>,
}

/// Top-k node pooling.
///
/// Each node gets the score `tanh(x . p / |p|)` for a learned projection `p`.
/// Per graph, the `ceil(ratio * n)` highest scoring nodes survive (at least
/// one, never more than `n`), their features are multiplied by their score so
/// `p` receives gradients, and edges touching dropped nodes are removed.
pub struct TopKPooling {
    weight: Tensor,
    ratio: f64,
    in_features: usize,
}

impl TopKPooling {
    /// Create a new pooling layer.
    ///
    /// `ratio` must lie in `(0, 1]`.
    pub fn new(in_features: usize, ratio: f64, vb: VarBuilder) -> Result<Self> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            candle_core::bail!("pooling ratio must be in (0, 1], got {ratio}");
        }
        let bound = 1.0 / (in_features as f64).sqrt();
        let weight = vb.get_with_hints(
            (1, in_features),
            "weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Ok(Self {
            weight,
            ratio,
            in_features,
        })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Number of nodes a graph of `n` nodes keeps.
    pub fn keep_count(&self, n: usize) -> usize {
        keep_count(self.ratio, n)
    }

    /// Per-node scores in `(-1, 1)`.
    pub fn score(&self, x: &Tensor) -> Result<Tensor> {
        let norm = self.weight.sqr()?.sum_all()?.sqrt()?;
        x.broadcast_mul(&self.weight)?
            .sum(D::Minus1)?
            .broadcast_div(&norm)?
            .tanh()
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `x`: Node features (N x in_features)
    /// - `edge_index`: Edges (2 x E) u32
    /// - `batch`: Owning graph of each node (N,) u32
    pub fn forward(&self, x: &Tensor, edge_index: &Tensor, batch: &Tensor) -> Result<Pooled> {
        let n = x.dim(0)?;
        let score = self.score(x)?;
        let scores = score.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let owners = batch.to_vec1::<u32>()?;
        let perm = select_top_k(&scores, &owners, self.ratio);

        let perm_t = Tensor::from_slice(&perm, perm.len(), x.device())?;
        let gate = score.index_select(&perm_t, 0)?.unsqueeze(1)?;
        let x = x.index_select(&perm_t, 0)?.broadcast_mul(&gate)?;
        let batch = batch.index_select(&perm_t, 0)?;
        let edge_index = filter_edges(edge_index, &perm, n)?;

        Ok(Pooled {
            x,
            edge_index,
            batch,
            perm,
        })
    }
}

/// `ceil(ratio * n)`, clamped to `1..=n` for non-empty graphs.
pub fn keep_count(ratio: f64, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    ((ratio * n as f64).ceil() as usize).clamp(1, n)
}

/// Indices of the kept nodes: graphs in ascending order, each graph's nodes
/// by descending score under `f32::total_cmp` (ties by position).
fn select_top_k(scores: &[f32], owners: &[u32], ratio: f64) -> Vec<u32> {
    let num_graphs = owners.iter().map(|&g| g as usize + 1).max().unwrap_or(0);
    let mut members: Vec<Vec<u32>> = vec![Vec::new(); num_graphs];
    for (node, &graph) in owners.iter().enumerate() {
        members[graph as usize].push(node as u32);
    }

    let mut perm = Vec::with_capacity(owners.len());
    for mut nodes in members {
        let k = keep_count(ratio, nodes.len());
        nodes.sort_by(|&a, &b| {
            scores[b as usize]
                .total_cmp(&scores[a as usize])
                .then(a.cmp(&b))
        });
        perm.extend_from_slice(&nodes[..k]);
    }
    perm
}

/// Keep edges whose endpoints both survive, renumbered to positions in `perm`.
fn filter_edges(edge_index: &Tensor, perm: &[u32], num_nodes: usize) -> Result<Tensor> {
    let device = edge_index.device();
    if edge_index.dim(1)? == 0 {
        return Tensor::zeros((2, 0), DType::U32, device);
    }

    let mut position = vec![None; num_nodes];
    for (new, &old) in perm.iter().enumerate() {
        position[old as usize] = Some(new as u32);
    }

    let rows = edge_index.to_vec2::<u32>()?;
    let (mut sources, targets): (Vec<u32>, Vec<u32>) = rows[0]
        .iter()
        .zip(&rows[1])
        .filter_map(|(&s, &t)| Some((position[s as usize]?, position[t as usize]?)))
        .unzip();
    let kept = sources.len();
    sources.extend(targets);
    Tensor::from_vec(sources, (2, kept), device)
}

/// Row indices of each graph's nodes.
fn graph_members(batch: &Tensor, num_graphs: usize) -> Result<Vec<Vec<u32>>> {
    let mut members = vec![Vec::new(); num_graphs];
    for (node, graph) in batch.to_vec1::<u32>()?.into_iter().enumerate() {
        match members.get_mut(graph as usize) {
            Some(m) => m.push(node as u32),
            None => candle_core::bail!("node {node} belongs to graph {graph} of {num_graphs}"),
        }
    }
    Ok(members)
}

/// Element-wise maximum over each graph's nodes (G x F).
///
/// Graphs without nodes read out as zeros.
pub fn global_max_pool(x: &Tensor, batch: &Tensor, num_graphs: usize) -> Result<Tensor> {
    let features = x.dim(1)?;
    let rows = graph_members(batch, num_graphs)?
        .into_iter()
        .map(|nodes| {
            if nodes.is_empty() {
                return Tensor::zeros((1, features), x.dtype(), x.device());
            }
            let index = Tensor::from_vec(nodes.clone(), nodes.len(), x.device())?;
            x.index_select(&index, 0)?.max_keepdim(0)
        })
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&rows, 0)
}

/// Mean over each graph's nodes (G x F).
///
/// Graphs without nodes read out as zeros.
pub fn global_mean_pool(x: &Tensor, batch: &Tensor, num_graphs: usize) -> Result<Tensor> {
    let features = x.dim(1)?;
    let counts: Vec<f32> = graph_members(batch, num_graphs)?
        .iter()
        .map(|nodes| nodes.len().max(1) as f32)
        .collect();
    let counts = Tensor::from_vec(counts, (num_graphs, 1), x.device())?.to_dtype(x.dtype())?;
    let sums = Tensor::zeros((num_graphs, features), x.dtype(), x.device())?
        .index_add(batch, x, 0)?;
    sums.broadcast_div(&counts)
}

/// `[max | mean]` readout (G x 2F).
pub fn max_mean_readout(x: &Tensor, batch: &Tensor, num_graphs: usize) -> Result<Tensor> {
    Tensor::cat(
        &[
            global_max_pool(x, batch, num_graphs)?,
            global_mean_pool(x, batch, num_graphs)?,
        ],
        1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn batch_of(sizes: &[usize], device: &Device) -> Tensor {
        let owners: Vec<u32> = sizes
            .iter()
            .enumerate()
            .flat_map(|(g, &n)| std::iter::repeat(g as u32).take(n))
            .collect();
        let len = owners.len();
        Tensor::from_vec(owners, len, device).unwrap()
    }

    #[test]
    fn test_keep_count_rounds_up() {
        assert_eq!(keep_count(0.8, 0), 0);
        assert_eq!(keep_count(0.8, 1), 1);
        assert_eq!(keep_count(0.8, 2), 2);
        assert_eq!(keep_count(0.8, 5), 4);
        assert_eq!(keep_count(0.8, 7), 6);
        assert_eq!(keep_count(0.8, 10), 8);
        assert_eq!(keep_count(1.0, 3), 3);
        assert_eq!(keep_count(0.01, 3), 1);
    }

    #[test]
    fn test_select_top_k_per_graph() {
        let scores = [0.1, 0.9, 0.5, -0.3, 0.7, 0.2];
        let owners = [0, 0, 0, 1, 1, 1];
        // ceil(0.5 * 3) = 2 per graph
        let perm = select_top_k(&scores, &owners, 0.5);
        assert_eq!(perm, vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_select_top_k_with_nan_scores() {
        let scores: Vec<f32> = (0..64)
            .map(|i| if i % 3 == 0 { f32::NAN } else { i as f32 / 64.0 })
            .collect();
        let owners = vec![0u32; 64];

        let perm = select_top_k(&scores, &owners, 0.8);
        assert_eq!(perm.len(), keep_count(0.8, 64));
        let mut unique = perm.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), perm.len());

        let finite: Vec<f32> = perm
            .iter()
            .map(|&i| scores[i as usize])
            .filter(|s| !s.is_nan())
            .collect();
        assert!(finite.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_topk_forward_counts() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let pool = TopKPooling::new(8, 0.8, vb).unwrap();

        let sizes = [5, 1, 10, 2];
        let n: usize = sizes.iter().sum();
        let x = Tensor::randn(0f32, 1f32, (n, 8), &device).unwrap();
        let batch = batch_of(&sizes, &device);
        // A ring over all nodes, crossing graph borders on purpose.
        let mut flat: Vec<u32> = (0..n as u32).collect();
        flat.extend((0..n as u32).map(|i| (i + 1) % n as u32));
        let edge_index = Tensor::from_vec(flat, (2, n), &device).unwrap();

        let pooled = pool.forward(&x, &edge_index, &batch).unwrap();
        let owners = pooled.batch.to_vec1::<u32>().unwrap();
        for (g, &size) in sizes.iter().enumerate() {
            let kept = owners.iter().filter(|&&o| o as usize == g).count();
            assert_eq!(kept, keep_count(0.8, size));
            assert!(kept <= size);
        }
        assert_eq!(pooled.x.dims(), &[owners.len(), 8]);

        let kept_edges = pooled.edge_index.to_vec2::<u32>().unwrap();
        assert!(kept_edges[0].len() <= n);
        for (&s, &t) in kept_edges[0].iter().zip(&kept_edges[1]) {
            assert!((s as usize) < owners.len());
            assert!((t as usize) < owners.len());
            // Surviving edges connect the same original nodes.
            assert_eq!((pooled.perm[s as usize] + 1) % n as u32, pooled.perm[t as usize]);
        }
    }

    #[test]
    fn test_topk_gates_by_score() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let pool = TopKPooling::new(3, 1.0, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (4, 3), &device).unwrap();
        let batch = batch_of(&[4], &device);
        let none = Tensor::zeros((2, 0), DType::U32, &device).unwrap();

        let pooled = pool.forward(&x, &none, &batch).unwrap();
        let scores = pool.score(&x).unwrap().to_vec1::<f32>().unwrap();
        let rows = x.to_vec2::<f32>().unwrap();
        let out = pooled.x.to_vec2::<f32>().unwrap();
        for (row, &node) in out.iter().zip(&pooled.perm) {
            for (a, b) in row.iter().zip(&rows[node as usize]) {
                assert!((a - b * scores[node as usize]).abs() < 1e-5);
            }
        }
        assert_eq!(pooled.edge_index.dims(), &[2, 0]);
    }

    #[test]
    fn test_invalid_ratio() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        assert!(TopKPooling::new(3, 0.0, vb.clone()).is_err());
        assert!(TopKPooling::new(3, 1.5, vb).is_err());
    }

    #[test]
    fn test_global_pools() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1f32, -2.], [3., 4.], [5., 0.], [-1., -1.]], &device).unwrap();
        let batch = batch_of(&[3, 1], &device);

        let max = global_max_pool(&x, &batch, 2).unwrap();
        assert_eq!(max.to_vec2::<f32>().unwrap(), vec![vec![5., 4.], vec![-1., -1.]]);

        let mean = global_mean_pool(&x, &batch, 2).unwrap();
        assert_eq!(mean.to_vec2::<f32>().unwrap(), vec![vec![3., 2. / 3.], vec![-1., -1.]]);

        let readout = max_mean_readout(&x, &batch, 2).unwrap();
        assert_eq!(readout.dims(), &[2, 4]);
    }

    #[test]
    fn test_global_pool_empty_graph() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1f32, 2.]], &device).unwrap();
        let batch = batch_of(&[1], &device);

        let max = global_max_pool(&x, &batch, 2).unwrap();
        assert_eq!(max.to_vec2::<f32>().unwrap(), vec![vec![1., 2.], vec![0., 0.]]);
        let mean = global_mean_pool(&x, &batch, 2).unwrap();
        assert_eq!(mean.to_vec2::<f32>().unwrap(), vec![vec![1., 2.], vec![0., 0.]]);
    }
}
