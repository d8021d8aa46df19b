//! Dense (fully connected) transforms acting on the last tensor axis.
//!
//! `candle_nn::Linear` only broadcasts over up to two leading axes, while the
//! edge tensors in this crate are rank 4–5 (`batch × points × neighbors × …`).
//! [`Dense`] flattens every leading axis into rows, applies `x Wᵀ + b`, and
//! restores the leading shape.
//!
//! # Near-identity initialization
//!
//! Transforms that act on spatial coordinates start close to the identity so
//! that early in training a layer passes geometry through almost unchanged.
//! [`Dense::noisy_eye`] stores its weight as
//!
//! ```text
//! W = (I + N) + Δ
//! ```
//!
//! where `I` is the rectangular identity, `N` a fixed, seeded uniform noise in
//! `[-noise, noise]`, and `Δ` the learned variable initialised to zero. The
//! gradient with respect to `Δ` equals the gradient with respect to `W`, so an
//! optimizer sees an ordinary parameter whose starting point is `I + N`.

use candle_core::{DType, Result, Tensor};
use candle_nn::{Init, Module, VarBuilder};
use rand::prelude::*;
use rand_xorshift::XorShiftRng;

use crate::activation::Activation;

/// Default half-width of the noise added to near-identity weights.
pub const NOISY_EYE_WIDTH: f32 = 1e-2;

/// Dense layer with an attached activation.
#[derive(Debug, Clone)]
pub struct Dense {
    /// Learned weight, or learned offset from `base` for near-identity layers.
    weight: Tensor,
    /// Fixed `I + N` part of a near-identity weight.
    base: Option<Tensor>,
    bias: Option<Tensor>,
    activation: Activation,
    in_dim: usize,
    out_dim: usize,
}

impl Dense {
    /// Standard dense layer (`candle_nn::linear` initialization).
    ///
    /// # Arguments
    /// - `in_dim`: Input feature dimension
    /// - `out_dim`: Output feature dimension
    /// - `activation`: Applied after the affine map
    /// - `vb`: Variable builder; parameters are `weight` and `bias`
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let linear = candle_nn::linear(in_dim, out_dim, vb)?;
        Ok(Self {
            weight: linear.weight().clone(),
            base: None,
            bias: linear.bias().cloned(),
            activation,
            in_dim,
            out_dim,
        })
    }

    /// Near-identity dense layer.
    ///
    /// `seed` drives the fixed noise; two layers built with the same seed and
    /// shape start from the same weights.
    ///
    /// # Arguments
    /// - `in_dim`, `out_dim`: Input and output feature dimensions
    /// - `activation`: Applied after the affine map
    /// - `use_bias`: Whether to learn a bias (zero-initialized)
    /// - `seed`: Seed of the fixed noise
    /// - `vb`: Variable builder; the learned delta is stored as `weight`
    pub fn noisy_eye(
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        use_bias: bool,
        seed: u64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints((out_dim, in_dim), "weight", Init::Const(0.0))?;
        let bias = if use_bias {
            Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        let base = noisy_eye(out_dim, in_dim, NOISY_EYE_WIDTH, seed)?
            .to_device(vb.device())?
            .to_dtype(vb.dtype())?;
        Ok(Self {
            weight,
            base: Some(base),
            bias,
            activation,
            in_dim,
            out_dim,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Effective weight matrix `(out_dim, in_dim)`.
    pub fn effective_weight(&self) -> Result<Tensor> {
        match &self.base {
            Some(base) => base + &self.weight,
            None => Ok(self.weight.clone()),
        }
    }
}

impl Module for Dense {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        let Some(&last) = dims.last() else {
            candle_core::bail!("dense layer needs at least one axis");
        };
        if last != self.in_dim {
            candle_core::bail!(
                "dense layer expects last axis {}, got shape {:?}",
                self.in_dim,
                dims
            );
        }
        let rows = x.elem_count() / last.max(1);
        let flat = x.reshape((rows, last))?;
        let w = self.effective_weight()?;
        let mut out = flat.matmul(&w.t()?)?;
        if let Some(bias) = &self.bias {
            out = out.broadcast_add(bias)?;
        }
        let mut out_dims = dims;
        if let Some(d) = out_dims.last_mut() {
            *d = self.out_dim;
        }
        self.activation.apply(&out.reshape(out_dims)?)
    }
}

/// Mix a parent seed with a slot number (splitmix64 finalizer).
///
/// Layers hand each of their near-identity sublayers a distinct seed.
#[must_use]
pub fn derive_seed(base: u64, slot: u64) -> u64 {
    let mut z = base ^ slot.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Rectangular identity plus seeded uniform noise, shape `(rows, cols)`.
pub fn noisy_eye(rows: usize, cols: usize, width: f32, seed: u64) -> Result<Tensor> {
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            let eye = if r == c { 1.0 } else { 0.0 };
            let noise = if width > 0.0 {
                rng.gen_range(-width..=width)
            } else {
                0.0
            };
            data.push(eye + noise);
        }
    }
    Tensor::from_vec(data, (rows, cols), &candle_core::Device::Cpu)?.to_dtype(DType::F32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_dense_forward_rank4() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let dense = Dense::new(6, 4, Activation::Relu, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 5, 3, 6), &device).unwrap();
        let out = dense.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 5, 3, 4]);

        let min = out.flatten_all().unwrap().min(0).unwrap();
        assert!(min.to_scalar::<f32>().unwrap() >= 0.0);
    }

    #[test]
    fn test_noisy_eye_is_near_identity() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let dense = Dense::noisy_eye(3, 3, Activation::Identity, false, 7, vb).unwrap();
        let x = Tensor::new(&[[1.0f32, -2.0, 0.5]], &device).unwrap();
        let out = dense.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        for (o, e) in out[0].iter().zip([1.0f32, -2.0, 0.5]) {
            assert!((o - e).abs() < 0.05, "{o} vs {e}");
        }
    }

    #[test]
    fn test_noisy_eye_rectangular_and_seeded() {
        let a = noisy_eye(2, 4, 0.01, 3).unwrap().to_vec2::<f32>().unwrap();
        let b = noisy_eye(2, 4, 0.01, 3).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
        assert!((a[0][0] - 1.0).abs() <= 0.01);
        assert!((a[1][1] - 1.0).abs() <= 0.01);
        assert!(a[0][3].abs() <= 0.01);
    }

    #[test]
    fn test_noisy_eye_weight_is_registered_as_variable() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let _ = Dense::noisy_eye(4, 2, Activation::Tanh, true, 0, vb.pp("space")).unwrap();
        assert_eq!(varmap.all_vars().len(), 2);
    }

    #[test]
    fn test_dense_rejects_wrong_input_width() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let dense = Dense::new(3, 2, Activation::Identity, vb).unwrap();
        let x = Tensor::zeros((4, 5), DType::F32, &device).unwrap();
        assert!(dense.forward(&x).is_err());
    }
}
