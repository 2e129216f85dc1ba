//! Hierarchical pooling classifier.
//!
//! ```text
//! x ─▶ [conv ▶ relu ▶ top-k ▶ readout] ─▶ [ ... ] ─▶ [ ... ]
//!                              │               │         │
//!                              └────── + ──────┴─── + ───┘
//!                                      │
//!                      lin ▶ relu ▶ dropout ▶ lin ▶ relu ▶ lin ▶ log_softmax
//! ```
//!
//! Every stage reads out `[max | mean]` over the surviving nodes of each
//! graph; the readouts are summed, not concatenated, so all stages share the
//! width `2 * hidden`.

use crate::conv::GraphConv;
use crate::error::{Error, Result};
use crate::pool::{max_mean_readout, TopKPooling};
use candle_core::{Tensor, D};
use candle_nn::{linear, ops, Linear, Module, VarBuilder};
use classpool_data::Batch;

/// Network configuration.
#[derive(Debug, Clone)]
pub struct PoolNetConfig {
    /// Input feature width.
    pub num_features: usize,
    /// Number of output classes.
    pub num_classes: usize,
    /// Width of every convolution (default: 128).
    pub hidden: usize,
    /// Number of conv/pool stages (default: 3).
    pub stages: usize,
    /// Fraction of nodes kept by each pooling step (default: 0.8).
    pub ratio: f64,
    /// Dropout probability after the first head layer (default: 0.5).
    pub dropout: f32,
    /// Hidden widths of the classifier head (default: [128, 64]).
    pub head: [usize; 2],
}

impl PoolNetConfig {
    pub fn new(num_features: usize, num_classes: usize) -> Self {
        Self {
            num_features,
            num_classes,
            hidden: 128,
            stages: 3,
            ratio: 0.8,
            dropout: 0.5,
            head: [128, 64],
        }
    }

    pub fn with_hidden(mut self, hidden: usize) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = ratio;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of each stage's readout.
    pub fn readout_width(&self) -> usize {
        2 * self.hidden
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_features == 0 {
            return Err(Error::InvalidConfig("num_features must be positive".into()));
        }
        if self.num_classes == 0 {
            return Err(Error::InvalidConfig("num_classes must be positive".into()));
        }
        if self.hidden == 0 || self.head.contains(&0) {
            return Err(Error::InvalidConfig("layer widths must be positive".into()));
        }
        if self.stages == 0 {
            return Err(Error::InvalidConfig("at least one stage is required".into()));
        }
        if !(self.ratio > 0.0 && self.ratio <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "ratio must be in (0, 1], got {}",
                self.ratio
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

struct Stage {
    conv: GraphConv,
    pool: TopKPooling,
}

/// Graph classifier built from conv/top-k stages and an MLP head.
pub struct PoolNet {
    stages: Vec<Stage>,
    lin1: Linear,
    lin2: Linear,
    lin3: Linear,
    config: PoolNetConfig,
}

impl PoolNet {
    pub fn new(config: &PoolNetConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let mut stages = Vec::with_capacity(config.stages);
        for i in 0..config.stages {
            let in_features = if i == 0 {
                config.num_features
            } else {
                config.hidden
            };
            stages.push(Stage {
                conv: GraphConv::new(in_features, config.hidden, vb.pp(format!("conv{}", i + 1)))?,
                pool: TopKPooling::new(
                    config.hidden,
                    config.ratio,
                    vb.pp(format!("pool{}", i + 1)),
                )?,
            });
        }

        let [h1, h2] = config.head;
        Ok(Self {
            stages,
            lin1: linear(config.readout_width(), h1, vb.pp("lin1"))?,
            lin2: linear(h1, h2, vb.pp("lin2"))?,
            lin3: linear(h2, config.num_classes, vb.pp("lin3"))?,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &PoolNetConfig {
        &self.config
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `x`: Node features (N x num_features)
    /// - `edge_index`: Edges (2 x E) u32
    /// - `batch`: Owning graph of each node (N,) u32
    /// - `num_graphs`: Number of graphs G in the batch
    /// - `train`: Enables dropout
    ///
    /// # Returns
    /// - Per-graph log-probabilities (G x num_classes)
    pub fn forward_t(
        &self,
        x: &Tensor,
        edge_index: &Tensor,
        batch: &Tensor,
        num_graphs: usize,
        train: bool,
    ) -> Result<Tensor> {
        let mut x = x.clone();
        let mut edge_index = edge_index.clone();
        let mut batch = batch.clone();
        let mut combined: Option<Tensor> = None;

        for stage in &self.stages {
            x = stage.conv.forward(&x, &edge_index)?.relu()?;
            let pooled = stage.pool.forward(&x, &edge_index, &batch)?;
            x = pooled.x;
            edge_index = pooled.edge_index;
            batch = pooled.batch;

            let readout = max_mean_readout(&x, &batch, num_graphs)?;
            combined = Some(match combined {
                Some(acc) => (acc + readout)?,
                None => readout,
            });
        }
        let combined = combined.ok_or_else(|| Error::InvalidConfig("no stages".into()))?;

        let mut h = self.lin1.forward(&combined)?.relu()?;
        if train && self.config.dropout > 0.0 {
            h = ops::dropout(&h, self.config.dropout)?;
        }
        let h = self.lin2.forward(&h)?.relu()?;
        Ok(ops::log_softmax(&self.lin3.forward(&h)?, D::Minus1)?)
    }

    /// Forward pass over a collated batch.
    pub fn forward_batch(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        self.forward_t(
            &batch.x,
            &batch.edge_index,
            &batch.batch,
            batch.num_graphs,
            train,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use classpool_data::{EdgeIndex, GraphSample};

    fn toy_batch(device: &Device) -> Batch {
        let a = GraphSample::new(
            vec![1, 2, 3, 4, 5],
            (0..20).map(|i| i as f32 / 10.0).collect(),
            0,
            EdgeIndex::new(vec![1, 2, 3, 4], vec![2, 3, 4, 5]),
        )
        .unwrap();
        let b = GraphSample::new(vec![9], vec![1.0, 0.0, -1.0, 0.5], 1, EdgeIndex::default())
            .unwrap();
        let c = GraphSample::new(
            vec![6, 7],
            vec![0.3; 8],
            2,
            EdgeIndex::new(vec![6, 7], vec![7, 6]),
        )
        .unwrap();
        Batch::collate(&[&a, &b, &c], device).unwrap()
    }

    fn model(device: &Device, hidden: usize) -> (VarMap, PoolNet) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let config = PoolNetConfig::new(4, 3).with_hidden(hidden);
        let net = PoolNet::new(&config, vb).unwrap();
        (varmap, net)
    }

    #[test]
    fn test_forward_shape_and_log_probs() {
        let device = Device::Cpu;
        let (_varmap, net) = model(&device, 16);
        let batch = toy_batch(&device);

        let out = net.forward_batch(&batch, false).unwrap();
        assert_eq!(out.dims(), &[3, 3]);

        for row in out.exp().unwrap().to_vec2::<f32>().unwrap() {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_eval_is_deterministic() {
        let device = Device::Cpu;
        let (_varmap, net) = model(&device, 16);
        let batch = toy_batch(&device);

        let a = net.forward_batch(&batch, false).unwrap().to_vec2::<f32>().unwrap();
        let b = net.forward_batch(&batch, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_singleton_graphs_without_edges() {
        let device = Device::Cpu;
        let (_varmap, net) = model(&device, 8);
        let samples: Vec<GraphSample> = (0..5)
            .map(|i| {
                GraphSample::new(
                    vec![i],
                    vec![i as f32; 4],
                    (i % 3) as u32,
                    EdgeIndex::new(vec![i], vec![i + 100]),
                )
                .unwrap()
            })
            .collect();
        let refs: Vec<&GraphSample> = samples.iter().collect();
        let batch = Batch::collate(&refs, &device).unwrap();
        assert_eq!(batch.num_edges, 0);

        let out = net.forward_batch(&batch, true).unwrap();
        assert_eq!(out.dims(), &[5, 3]);
    }

    #[test]
    fn test_gradients_reach_every_parameter() {
        let device = Device::Cpu;
        let (varmap, net) = model(&device, 8);
        let batch = toy_batch(&device);

        let out = net.forward_batch(&batch, false).unwrap();
        let loss = candle_nn::loss::nll(&out, &batch.y).unwrap();
        let grads = loss.backward().unwrap();
        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn test_invalid_config() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = PoolNetConfig::new(0, 3);
        assert!(matches!(
            PoolNet::new(&config, vb.clone()),
            Err(Error::InvalidConfig(_))
        ));
        let config = PoolNetConfig::new(4, 3).with_ratio(0.0);
        assert!(matches!(
            PoolNet::new(&config, vb),
            Err(Error::InvalidConfig(_))
        ));
    }
}
