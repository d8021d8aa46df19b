//! Full kNN convolution over a learned latent space.

use candle_core::{Tensor, D};
use candle_nn::{Module, VarBuilder};
use tracing::trace;

use crate::activation::Activation;
use crate::config::NeighborConvConfig;
use crate::dense::{derive_seed, Dense};
use crate::edges::rot_symmetric_edges;
use crate::embed::SpatialEmbedder;
use crate::error::{Error, Result};
use crate::graph::knn;

/// kNN message passing with iteratively re-embedded edges.
///
/// One call:
///
/// 1. embed points into latent space, build the kNN graph there;
/// 2. edge `e_ij = [|x_i − x_j|, x_i − x_j]`;
/// 3. for each configured width `f_t`:
///    - `e ← act(W_e [e_0 ‖ e])` (near-identity init),
///    - `m_i = mean_j( h_j ⊗ e_ij · mask_ij )`,
///    - `h ← relu(W_t [x ‖ m])`.
///
/// The graph is fixed across iterations; only features and edge weights
/// change. The output is the last `h`, or every `h` concatenated when
/// `concat_iterations` is set.
#[derive(Debug, Clone)]
pub struct NeighborConv {
    layer_id: usize,
    k: usize,
    embedder: SpatialEmbedder,
    edge_transforms: Vec<Dense>,
    updates: Vec<Dense>,
    concat_iterations: bool,
    in_dim: usize,
    output_dim: usize,
}

impl NeighborConv {
    /// Create a kNN convolution.
    ///
    /// # Arguments
    /// - `in_dim`: Input feature dimension
    /// - `config`: Neighbor count, embedder and per-iteration widths
    /// - `layer_id`: Id reported in logs
    /// - `seed`: Seed for the near-identity sublayers
    /// - `vb`: Variable builder, usually already under `layer_{id}`
    pub fn new(
        in_dim: usize,
        config: &NeighborConvConfig,
        layer_id: usize,
        seed: u64,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        if in_dim == 0 {
            return Err(Error::config("neighbor conv input width must be positive"));
        }
        let embedder = SpatialEmbedder::new(in_dim, &config.embedder, derive_seed(seed, 0), vb.pp("space"))?;
        let edge_dim = embedder.out_dim() + 1;

        let mut edge_transforms = Vec::with_capacity(config.filters.len());
        let mut updates = Vec::with_capacity(config.filters.len());
        let mut width = in_dim;
        for (t, &f) in config.filters.iter().enumerate() {
            edge_transforms.push(Dense::noisy_eye(
                2 * edge_dim,
                edge_dim,
                config.edge_activation,
                true,
                derive_seed(seed, 1 + t as u64),
                vb.pp(format!("edge_{t}")),
            )?);
            updates.push(Dense::new(
                in_dim + width * edge_dim,
                f,
                Activation::Relu,
                vb.pp(format!("update_{t}")),
            )?);
            width = f;
        }

        Ok(Self {
            layer_id,
            k: config.k,
            embedder,
            edge_transforms,
            updates,
            concat_iterations: config.concat_iterations,
            in_dim,
            output_dim: config.output_dim(),
        })
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn layer_id(&self) -> usize {
        self.layer_id
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `x`: Point features (B x N x in_dim)
    /// - `valid_counts`: Valid entries per batch element
    ///
    /// # Returns
    /// - Point features (B x N x output_dim)
    pub fn forward(&self, x: &Tensor, valid_counts: &[usize]) -> Result<Tensor> {
        let (batch, n, width) = x.dims3()?;
        if width != self.in_dim {
            return Err(Error::ShapeMismatch {
                what: "neighbor conv input",
                expected: vec![self.in_dim],
                got: vec![width],
            });
        }

        let latent = self.embedder.forward(x)?;
        let graph = knn(&latent, valid_counts, self.k)?;
        let neighbor_latent = graph.gather(&latent)?;
        let diff = latent.unsqueeze(2)?.broadcast_sub(&neighbor_latent)?;
        // (B, N, k, 1, F)
        let orig_edges = rot_symmetric_edges(&diff)?.unsqueeze(3)?;
        let mask = graph.mask().reshape((batch, n, self.k, 1, 1))?;

        let mut edges = orig_edges.clone();
        let mut h = x.clone();
        let mut outputs = Vec::with_capacity(self.updates.len());
        for (edge_transform, update) in self.edge_transforms.iter().zip(&self.updates) {
            edges = edge_transform.forward(&Tensor::cat(&[&orig_edges, &edges], D::Minus1)?)?;
            // (B, N, k, C, 1) * (B, N, k, 1, F)
            let neighbors = graph.gather(&h)?.unsqueeze(4)?;
            let messages = neighbors.broadcast_mul(&edges)?.broadcast_mul(&mask)?;
            let aggregated = messages.mean(2)?.flatten_from(2)?;
            h = update.forward(&Tensor::cat(&[x, &aggregated], D::Minus1)?)?;
            if self.concat_iterations {
                outputs.push(h.clone());
            }
        }

        trace!(layer = self.layer_id, batch, n, k = self.k, out = self.output_dim, "neighbor conv");

        if self.concat_iterations {
            Ok(Tensor::cat(&outputs, D::Minus1)?)
        } else {
            Ok(h)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbedderConfig;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config() -> NeighborConvConfig {
        NeighborConvConfig::default()
            .with_k(3)
            .with_filters(vec![8, 6])
            .with_embedder(EmbedderConfig::new(vec![8], 3))
    }

    #[test]
    fn test_neighbor_conv_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let conv = NeighborConv::new(5, &config(), 0, 1, vb.pp("layer_0")).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 10, 5), &device).unwrap();
        let out = conv.forward(&x, &[10, 7]).unwrap();
        assert_eq!(out.dims(), &[2, 10, 6]);
        assert_eq!(conv.output_dim(), 6);
    }

    #[test]
    fn test_concat_iterations() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let cfg = config().with_concat_iterations(true);
        let conv = NeighborConv::new(5, &cfg, 0, 1, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 6, 5), &device).unwrap();
        let out = conv.forward(&x, &[6]).unwrap();
        assert_eq!(out.dims(), &[1, 6, 14]);
    }

    #[test]
    fn test_k_larger_than_capacity_fails() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let conv = NeighborConv::new(5, &config(), 0, 1, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 2, 5), &device).unwrap();
        assert!(matches!(
            conv.forward(&x, &[2]),
            Err(Error::KTooLarge { k: 3, max_entries: 2 })
        ));
    }

    #[test]
    fn test_padding_does_not_reach_valid_points() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = NeighborConv::new(5, &config(), 0, 1, vb).unwrap();

        let valid = Tensor::randn(0f32, 1f32, (1, 4, 5), &device).unwrap();
        let junk = Tensor::full(50f32, (1, 3, 5), &device).unwrap();
        let padded = Tensor::cat(&[&valid, &junk], 1).unwrap();

        let a = conv.forward(&valid, &[4]).unwrap();
        let b = conv.forward(&padded, &[4]).unwrap().narrow(1, 0, 4).unwrap();
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "max diff {diff}");
    }
}
