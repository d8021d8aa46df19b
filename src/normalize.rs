//! Rescaling of raw detector quantities.
//!
//! Raw energies span several orders of magnitude and the calorimeter is much
//! deeper than it is wide, so every input group gets its own constant:
//!
//! ```text
//! features  · 1e-4          (or ln(x + 1) / 10)
//! global    / (150, 150, 1600)
//! local     / 150
//! ```
//!
//! No masking happens here; padding is rescaled like everything else and
//! zeroed later by the model.

use candle_core::Tensor;

use crate::batch::PointBatch;
use crate::config::NormalizerConfig;
use crate::error::Result;

/// Rescaled copies of a batch's point tensors.
#[derive(Debug, Clone)]
pub struct NormalizedPoints {
    pub features: Tensor,
    pub global: Tensor,
    pub local: Tensor,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn normalize(&self, batch: &PointBatch) -> Result<NormalizedPoints> {
        self.normalize_parts(batch.features(), batch.global(), batch.local())
    }

    /// Same as [`Self::normalize`] on loose tensors.
    pub fn normalize_parts(
        &self,
        features: &Tensor,
        global: &Tensor,
        local: &Tensor,
    ) -> Result<NormalizedPoints> {
        let cfg = &self.config;
        let features = if cfg.log_energy {
            ((features + 1.0)?.log()? / 10.0)?
        } else {
            features.affine(cfg.energy_scale, 0.0)?
        };

        let axis_scale = Tensor::new(
            &[
                cfg.transverse_scale as f32,
                cfg.transverse_scale as f32,
                cfg.longitudinal_scale as f32,
            ],
            global.device(),
        )?
        .to_dtype(global.dtype())?;
        let global = global.broadcast_div(&axis_scale)?;
        let local = local.affine(1.0 / cfg.local_scale, 0.0)?;

        Ok(NormalizedPoints {
            features,
            global,
            local,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tensor3;
    use candle_core::Device;

    fn parts() -> (Tensor, Tensor, Tensor) {
        let device = Device::Cpu;
        (
            tensor3(&[vec![vec![10_000.0, 0.0]]], &device).unwrap(),
            tensor3(&[vec![vec![150.0, -300.0, 3200.0]]], &device).unwrap(),
            tensor3(&[vec![vec![15.0]]], &device).unwrap(),
        )
    }

    #[test]
    fn test_linear_scaling() {
        let (f, g, l) = parts();
        let out = Normalizer::default().normalize_parts(&f, &g, &l).unwrap();
        let f = out.features.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((f[0] - 1.0).abs() < 1e-6);
        let g = out.global.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(g, vec![1.0, -2.0, 2.0]);
        let l = out.local.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((l[0] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_log_energy() {
        let (f, g, l) = parts();
        let norm = Normalizer::new(NormalizerConfig::default().with_log_energy(true)).unwrap();
        let out = norm.normalize_parts(&f, &g, &l).unwrap();
        let f = out.features.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((f[0] - (10_001.0f32).ln() / 10.0).abs() < 1e-5);
        assert_eq!(f[1], 0.0);
    }

    #[test]
    fn test_rejects_zero_scale() {
        let mut cfg = NormalizerConfig::default();
        cfg.longitudinal_scale = 0.0;
        assert!(Normalizer::new(cfg).is_err());
    }
}
