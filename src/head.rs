//! Per-point class probabilities.

use candle_core::{Result, Tensor, D};
use candle_nn::{Module, VarBuilder};

use crate::activation::Activation;
use crate::dense::Dense;

/// `softmax(relu(W h + b))` over `n_classes` (two clusters plus background).
#[derive(Debug, Clone)]
pub struct OutputHead {
    dense: Dense,
}

impl OutputHead {
    /// # Arguments
    /// - `in_dim`: Width of the feature stack output
    /// - `n_classes`: Output classes (two clusters plus background)
    /// - `vb`: Variable builder, usually under `head`
    pub fn new(in_dim: usize, n_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: Dense::new(in_dim, n_classes, Activation::Relu, vb)?,
        })
    }

    pub fn n_classes(&self) -> usize {
        self.dense.out_dim()
    }
}

impl Module for OutputHead {
    fn forward(&self, h: &Tensor) -> Result<Tensor> {
        candle_nn::ops::softmax(&self.dense.forward(h)?, D::Minus1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_rows_sum_to_one() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let head = OutputHead::new(8, 3, vb).unwrap();
        let h = Tensor::randn(0f32, 5f32, (2, 6, 8), &device).unwrap();
        let p = head.forward(&h).unwrap();
        assert_eq!(p.dims(), &[2, 6, 3]);
        for row in p.to_vec3::<f32>().unwrap().iter().flatten() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|&v| v > 0.0));
        }
    }
}
