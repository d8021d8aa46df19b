//! Spatial embedder: per-layer latent coordinates for neighbor search.
//!
//! Hidden layers compute `open_tanh(W (x / s)) · s` with `s = input_scale`,
//! the final layer is a plain projection. All weights start near the
//! identity, so an untrained embedder returns roughly the leading `d` input
//! columns whatever their magnitude.

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::activation::Activation;
use crate::config::EmbedderConfig;
use crate::dense::{derive_seed, Dense};

#[derive(Debug, Clone)]
pub struct SpatialEmbedder {
    hidden: Vec<Dense>,
    output: Dense,
    input_scale: f64,
}

impl SpatialEmbedder {
    /// # Arguments
    /// - `in_dim`: Input feature dimension
    /// - `config`: Hidden widths, latent dimension and input scale
    /// - `seed`: Seed for the near-identity layers
    /// - `vb`: Variable builder
    pub fn new(in_dim: usize, config: &EmbedderConfig, seed: u64, vb: VarBuilder) -> Result<Self> {
        let mut hidden = Vec::with_capacity(config.hidden.len());
        let mut width = in_dim;
        for (i, &h) in config.hidden.iter().enumerate() {
            hidden.push(Dense::noisy_eye(
                width,
                h,
                Activation::OpenTanh,
                true,
                derive_seed(seed, i as u64),
                vb.pp(format!("hidden_{i}")),
            )?);
            width = h;
        }
        let output = Dense::noisy_eye(
            width,
            config.out_dim,
            Activation::Identity,
            config.final_bias,
            derive_seed(seed, config.hidden.len() as u64),
            vb.pp("out"),
        )?;
        Ok(Self {
            hidden,
            output,
            input_scale: config.input_scale,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.output.out_dim()
    }
}

impl Module for SpatialEmbedder {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.hidden {
            h = layer
                .forward(&h.affine(1.0 / self.input_scale, 0.0)?)?
                .affine(self.input_scale, 0.0)?;
        }
        self.output.forward(&h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_embedder_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let cfg = EmbedderConfig::new(vec![16], 4);
        let embedder = SpatialEmbedder::new(7, &cfg, 0, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 9, 7), &device).unwrap();
        assert_eq!(embedder.forward(&x).unwrap().dims(), &[2, 9, 4]);
        assert_eq!(embedder.out_dim(), 4);
    }

    #[test]
    fn test_untrained_embedder_tracks_input() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let cfg = EmbedderConfig::new(vec![3], 3);
        let embedder = SpatialEmbedder::new(3, &cfg, 5, vb).unwrap();
        let x = Tensor::new(&[[[0.5f32, -0.25, 0.1]]], &device).unwrap();
        let out = embedder.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (o, e) in out.iter().zip([0.5f32, -0.25, 0.1]) {
            assert!((o - e).abs() < 0.05, "{o} vs {e}");
        }
    }

    #[test]
    fn test_no_hidden_layers() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let cfg = EmbedderConfig::new(vec![], 2).with_final_bias(false);
        let embedder = SpatialEmbedder::new(5, &cfg, 0, vb).unwrap();
        let x = Tensor::ones((1, 3, 5), DType::F32, &device).unwrap();
        assert_eq!(embedder.forward(&x).unwrap().dims(), &[1, 3, 2]);
        assert_eq!(varmap.all_vars().len(), 1);
    }
}
