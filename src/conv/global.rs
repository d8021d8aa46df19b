//! Pool-and-broadcast exchange.

use candle_core::{Tensor, D};
use candle_nn::{Module, VarBuilder};
use tracing::trace;

use crate::activation::Activation;
use crate::config::GlobalExchangeConfig;
use crate::dense::{derive_seed, Dense};
use crate::edges::{create_edges, EdgeWeighting};
use crate::error::{Error, Result};

/// Masked mean over the point axis: `(B, N, F)`, `(B, N)` → `(B, 1, F)`.
///
/// Elements without valid entries pool to zero.
pub fn masked_mean(x: &Tensor, valid_mask: &Tensor) -> Result<Tensor> {
    let mask = valid_mask.to_dtype(x.dtype())?.unsqueeze(D::Minus1)?;
    let summed = x.broadcast_mul(&mask)?.sum_keepdim(1)?;
    let count = mask.sum_keepdim(1)?.maximum(1.0)?;
    Ok(summed.broadcast_div(&count)?)
}

/// Every point sees the batch-element average.
///
/// ```text
/// h      = relu(W_e x)                 (optional expansion)
/// p      = W_p h                       (optional learned placement)
/// h      = h ‖ exp(-|p − mean(p)|)
/// out    = h ‖ broadcast(mean(h))
/// out    = relu(W_c out)               (optional collapse)
/// ```
///
/// All means run over valid entries only.
#[derive(Debug, Clone)]
pub struct GlobalExchange {
    layer_id: usize,
    in_dim: usize,
    expand: Option<Dense>,
    placement: Option<Dense>,
    collapse: Option<Dense>,
    output_dim: usize,
}

impl GlobalExchange {
    /// Create a global exchange layer.
    ///
    /// # Arguments
    /// - `in_dim`: Input feature dimension
    /// - `config`: Optional expansion, placement and collapse widths
    /// - `layer_id`: Id reported in logs
    /// - `seed`: Seed for the placement projection
    /// - `vb`: Variable builder
    pub fn new(
        in_dim: usize,
        config: &GlobalExchangeConfig,
        layer_id: usize,
        seed: u64,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        if in_dim == 0 {
            return Err(Error::config("global exchange input width must be positive"));
        }
        let expand = config
            .expand_to
            .map(|e| Dense::new(in_dim, e, Activation::Relu, vb.pp("expand")))
            .transpose()?;
        let width = config.expand_to.unwrap_or(in_dim);
        let placement = config
            .placement_dims
            .map(|p| {
                Dense::noisy_eye(
                    width,
                    p,
                    Activation::Identity,
                    true,
                    derive_seed(seed, 0),
                    vb.pp("placement"),
                )
            })
            .transpose()?;
        let pooled_width = 2 * (width + usize::from(placement.is_some()));
        let collapse = config
            .collapse_to
            .map(|c| Dense::new(pooled_width, c, Activation::Relu, vb.pp("collapse")))
            .transpose()?;

        Ok(Self {
            layer_id,
            in_dim,
            expand,
            placement,
            collapse,
            output_dim: config.output_dim(in_dim),
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
    /// - `valid_mask`: 0/1 mask of real entries (B x N)
    ///
    /// # Returns
    /// - Point features (B x N x output_dim)
    pub fn forward(&self, x: &Tensor, valid_mask: &Tensor) -> Result<Tensor> {
        let (_, n, width) = x.dims3()?;
        if width != self.in_dim {
            return Err(Error::ShapeMismatch {
                what: "global exchange input",
                expected: vec![self.in_dim],
                got: vec![width],
            });
        }

        let mut h = match &self.expand {
            Some(expand) => expand.forward(x)?,
            None => x.clone(),
        };

        if let Some(placement) = &self.placement {
            let coords = placement.forward(&h)?;
            let centre = masked_mean(&coords, valid_mask)?;
            // (B, 1, N, 1) -> (B, N, 1)
            let weight = create_edges(&coords, &centre, Some(1), EdgeWeighting::GaussOfLin)?
                .squeeze(1)?;
            h = Tensor::cat(&[&h, &weight], D::Minus1)?;
        }

        let pooled = masked_mean(&h, valid_mask)?;
        let (b, _, f) = pooled.dims3()?;
        let broadcast = pooled.broadcast_as((b, n, f))?.contiguous()?;
        let mut out = Tensor::cat(&[&h, &broadcast], D::Minus1)?;

        if let Some(collapse) = &self.collapse {
            out = collapse.forward(&out)?;
        }

        trace!(layer = self.layer_id, n, out = self.output_dim, "global exchange");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::valid_mask;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_masked_mean_skips_padding() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[1.0f32], [3.0], [100.0]], [[7.0], [7.0], [7.0]]], &device).unwrap();
        let mask = valid_mask(&[2, 0], 3, &device).unwrap();
        let m = masked_mean(&x, &mask).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(m, vec![2.0, 0.0]);
    }

    #[test]
    fn test_plain_exchange_broadcasts_mean() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let layer = GlobalExchange::new(1, &GlobalExchangeConfig::default(), 0, 0, vb).unwrap();
        let x = Tensor::new(&[[[1.0f32], [3.0], [-50.0]]], &device).unwrap();
        let mask = valid_mask(&[2], 3, &device).unwrap();
        let out = layer.forward(&x, &mask).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(out[0][0], vec![1.0, 2.0]);
        assert_eq!(out[0][1], vec![3.0, 2.0]);
        assert_eq!(out[0][2], vec![-50.0, 2.0]);
    }

    #[test]
    fn test_full_exchange_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let cfg = GlobalExchangeConfig::default()
            .with_expand_to(Some(6))
            .with_placement_dims(Some(3))
            .with_collapse_to(Some(5));
        let layer = GlobalExchange::new(4, &cfg, 2, 0, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 9, 4), &device).unwrap();
        let mask = valid_mask(&[9, 4], 9, &device).unwrap();
        let out = layer.forward(&x, &mask).unwrap();
        assert_eq!(out.dims(), &[2, 9, 5]);
        assert_eq!(layer.output_dim(), 5);
    }

    #[test]
    fn test_placement_without_collapse() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let cfg = GlobalExchangeConfig::default().with_placement_dims(Some(2));
        let layer = GlobalExchange::new(3, &cfg, 0, 0, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 5, 3), &device).unwrap();
        let mask = valid_mask(&[5], 5, &device).unwrap();
        assert_eq!(layer.forward(&x, &mask).unwrap().dims(), &[1, 5, 8]);
    }
}
