//! Seed-bipartite convolution.

use candle_core::{Tensor, D};
use candle_nn::{Module, VarBuilder};
use tracing::trace;

use crate::activation::Activation;
use crate::config::SeededConvConfig;
use crate::dense::{derive_seed, Dense};
use crate::edges::{apply_edges, create_edges, EdgeWeighting, Reduce};
use crate::embed::SpatialEmbedder;
use crate::error::{Error, Result};
use crate::seeds::SeedSet;

/// Points talk to a handful of seeds, seeds talk to each other, and the
/// result flows back to every point.
///
/// ```text
/// x ─ embed ─ latent ─┬─ edges(point → seed)  (B, S, N, F)
///                     │
/// x ─ relu(W_v) ─ h ──┴─ masked mean over points  → (B, S, nf·F)
///                        ‖ seed rows of h (optionally after seed talk)
///                        → tanh(W_c)              → (B, S, nf)
///                        ⊗ edgesᵀ, no reduction   → (B, N, S·nf·F)
///                        → tanh(W_p)              → (B, N, nf)
/// out = tanh(W_o [x ‖ latent ‖ propagated])
/// ```
///
/// Seed talk mixes each seed row with the mean of all seed rows weighted by
/// the seed↔seed edges. Without compression the summaries keep their full
/// width and the back-propagated tensor is `S·(nf·F + nf)·F` wide.
#[derive(Debug, Clone)]
pub struct SeededConv {
    layer_id: usize,
    in_dim: usize,
    n_seeds: usize,
    edge_properties: Option<usize>,
    edge_weighting: EdgeWeighting,
    embedder: SpatialEmbedder,
    vertex_transform: Dense,
    seed_talk: Option<Dense>,
    compress_seeds: Option<Dense>,
    compress_points: Option<Dense>,
    fuse: Dense,
}

impl SeededConv {
    /// Create a seed-bipartite convolution.
    ///
    /// # Arguments
    /// - `in_dim`: Input feature dimension
    /// - `config`: Filters, embedder, edge and seed options
    /// - `n_seeds`: Seeds per batch element
    /// - `layer_id`: Id reported in logs
    /// - `seed`: Seed for the near-identity sublayers
    /// - `vb`: Variable builder
    pub fn new(
        in_dim: usize,
        config: &SeededConvConfig,
        n_seeds: usize,
        layer_id: usize,
        seed: u64,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        if in_dim == 0 || n_seeds == 0 {
            return Err(Error::config("seeded conv needs positive input width and seed count"));
        }
        let nf = config.filters;
        let edge_dim = config.edge_dim();
        let latent_dim = config.embedder.out_dim;

        let embedder = SpatialEmbedder::new(in_dim, &config.embedder, derive_seed(seed, 0), vb.pp("space"))?;
        let vertex_transform = Dense::new(in_dim, nf, Activation::Relu, vb.pp("vertex"))?;

        let seed_talk = if config.seed_talk {
            Some(Dense::noisy_eye(
                nf + nf * edge_dim,
                nf,
                Activation::Tanh,
                true,
                derive_seed(seed, 1),
                vb.pp("seed_talk"),
            )?)
        } else {
            None
        };

        let summary_dim = nf * edge_dim + nf;
        let (compress_seeds, compress_points, propagated_dim) = if config.compress {
            let seeds = Dense::new(summary_dim, nf, Activation::Tanh, vb.pp("compress_seeds"))?;
            let points = Dense::noisy_eye(
                n_seeds * nf * edge_dim,
                nf,
                Activation::Tanh,
                true,
                derive_seed(seed, 2),
                vb.pp("compress_points"),
            )?;
            (Some(seeds), Some(points), nf)
        } else {
            (None, None, n_seeds * summary_dim * edge_dim)
        };

        let fuse = Dense::noisy_eye(
            in_dim + latent_dim + propagated_dim,
            nf,
            Activation::Tanh,
            true,
            derive_seed(seed, 3),
            vb.pp("fuse"),
        )?;

        Ok(Self {
            layer_id,
            in_dim,
            n_seeds,
            edge_properties: config.edge_properties,
            edge_weighting: config.edge_weighting,
            embedder,
            vertex_transform,
            seed_talk,
            compress_seeds,
            compress_points,
            fuse,
        })
    }

    pub fn output_dim(&self) -> usize {
        self.fuse.out_dim()
    }

    pub fn layer_id(&self) -> usize {
        self.layer_id
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `x`: Point features (B x N x in_dim)
    /// - `valid_mask`: 0/1 mask of real entries (B x N); only those
    ///   contribute to the per-seed means
    /// - `seeds`: Seed indices, `n_seeds` per batch element
    ///
    /// # Returns
    /// - Point features (B x N x filters)
    pub fn forward(&self, x: &Tensor, valid_mask: &Tensor, seeds: &SeedSet) -> Result<Tensor> {
        let (batch, n, width) = x.dims3()?;
        if width != self.in_dim {
            return Err(Error::ShapeMismatch {
                what: "seeded conv input",
                expected: vec![self.in_dim],
                got: vec![width],
            });
        }
        if seeds.n_seeds() != self.n_seeds {
            return Err(Error::ShapeMismatch {
                what: "seed count",
                expected: vec![self.n_seeds],
                got: vec![seeds.n_seeds()],
            });
        }

        let latent = self.embedder.forward(x)?;
        let seed_latent = seeds.gather(&latent)?;
        let edges = create_edges(&latent, &seed_latent, self.edge_properties, self.edge_weighting)?;

        let h = self.vertex_transform.forward(x)?;
        let per_seed = apply_edges(&h, &edges, Reduce::MaskedMean(valid_mask))?;

        let mut seed_features = seeds.gather(&h)?;
        if let Some(talk) = &self.seed_talk {
            let seed_edges = create_edges(&seed_latent, &seed_latent, self.edge_properties, self.edge_weighting)?;
            let heard = apply_edges(&seed_features, &seed_edges, Reduce::Mean)?;
            seed_features = talk.forward(&Tensor::cat(&[&seed_features, &heard], D::Minus1)?)?;
        }

        let mut summary = Tensor::cat(&[&per_seed, &seed_features], D::Minus1)?;
        if let Some(compress) = &self.compress_seeds {
            summary = compress.forward(&summary)?;
        }

        // seed → point
        let edges_back = edges.transpose(1, 2)?.contiguous()?;
        let mut propagated = apply_edges(&summary, &edges_back, Reduce::Flatten)?;
        if let Some(compress) = &self.compress_points {
            propagated = compress.forward(&propagated)?;
        }

        trace!(
            layer = self.layer_id,
            batch,
            n,
            seeds = self.n_seeds,
            width = propagated.dim(D::Minus1)?,
            "seeded conv"
        );

        Ok(self.fuse.forward(&Tensor::cat(&[x, &latent, &propagated], D::Minus1)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::valid_mask;
    use crate::config::EmbedderConfig;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small() -> SeededConvConfig {
        SeededConvConfig::default()
            .with_filters(6)
            .with_embedder(EmbedderConfig::new(vec![8], 3).with_final_bias(false))
    }

    #[test]
    fn test_seeded_conv_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let conv = SeededConv::new(5, &small(), 2, 3, 9, vb.pp("layer_3")).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 7, 5), &device).unwrap();
        let seeds = SeedSet::new(vec![vec![0, 4], vec![1, 2]], 7).unwrap();
        let mask = valid_mask(&[7, 3], 7, &device).unwrap();

        let out = conv.forward(&x, &mask, &seeds).unwrap();
        assert_eq!(out.dims(), &[2, 7, 6]);
        // tanh output
        let max = out.abs().unwrap().flatten_all().unwrap().max(0).unwrap();
        assert!(max.to_scalar::<f32>().unwrap() <= 1.0);
    }

    #[test]
    fn test_without_talk_or_compression() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let cfg = small().with_seed_talk(false).with_compress(false);
        let conv = SeededConv::new(5, &cfg, 2, 0, 0, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 4, 5), &device).unwrap();
        let seeds = SeedSet::new(vec![vec![0, 1]], 4).unwrap();
        let mask = valid_mask(&[4], 4, &device).unwrap();
        assert_eq!(conv.forward(&x, &mask, &seeds).unwrap().dims(), &[1, 4, 6]);
    }

    #[test]
    fn test_seed_count_mismatch() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let conv = SeededConv::new(5, &small(), 2, 0, 0, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 4, 5), &device).unwrap();
        let seeds = SeedSet::new(vec![vec![0, 1, 2]], 4).unwrap();
        let mask = valid_mask(&[4], 4, &device).unwrap();
        assert!(matches!(
            conv.forward(&x, &mask, &seeds),
            Err(Error::ShapeMismatch { what: "seed count", .. })
        ));
    }

    #[test]
    fn test_padding_does_not_reach_valid_points() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = SeededConv::new(5, &small(), 2, 0, 0, vb).unwrap();

        let valid = Tensor::randn(0f32, 1f32, (1, 3, 5), &device).unwrap();
        let junk = Tensor::full(-40f32, (1, 5, 5), &device).unwrap();
        let padded = Tensor::cat(&[&valid, &junk], 1).unwrap();

        let seeds3 = SeedSet::new(vec![vec![0, 2]], 3).unwrap();
        let seeds8 = seeds3.with_max_entries(8).unwrap();
        let a = conv
            .forward(&valid, &valid_mask(&[3], 3, &device).unwrap(), &seeds3)
            .unwrap();
        let b = conv
            .forward(&padded, &valid_mask(&[3], 8, &device).unwrap(), &seeds8)
            .unwrap()
            .narrow(1, 0, 3)
            .unwrap();
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
