//! Edge features between points and their neighbors.
//!
//! An edge from point `v` to neighbor `s` is described by the offset
//! `x_v − x_s` in latent space together with its length:
//!
//! ```text
//! e(v, s) = [ sqrt(Σ (x_v − x_s)² + ε), x_v − x_s ]      ε = 1e-6
//! ```
//!
//! The length is rotation invariant and always the first component, so
//! truncating to `n_properties ≥ 1` keeps it. The offset convention (point
//! minus neighbor) is the same at every call site: kNN edges, point→seed
//! edges, seed↔seed edges and placement edges.

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::activation::{gauss_of_lin, gauss_times_linear};
use crate::error::{Error, Result};

/// Added under the square root so the distance has a gradient at zero.
pub const DISTANCE_EPSILON: f64 = 1e-6;

/// Decay applied to every edge component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeWeighting {
    /// `exp(-|x|)`: zero distance maps to one.
    GaussOfLin,
    /// `x · exp(-x²)`: vanishes at zero and at large distance.
    #[default]
    GaussTimesLinear,
    /// Raw edge features.
    None,
}

impl EdgeWeighting {
    pub fn apply(self, edges: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::GaussOfLin => gauss_of_lin(edges),
            Self::GaussTimesLinear => gauss_times_linear(edges),
            Self::None => Ok(edges.clone()),
        }
    }
}

/// How [`apply_edges`] reduces over the neighbor axis.
#[derive(Debug, Clone, Copy)]
pub enum Reduce<'a> {
    /// Mean over every neighbor.
    Mean,
    /// Mean over neighbors whose `(B, V)` mask entry is one.
    MaskedMean(&'a Tensor),
    /// Keep the neighbor axis and flatten it into the features.
    Flatten,
}

/// `[sqrt(Σ diff² + ε), diff...]` along the last axis.
pub fn rot_symmetric_edges(diff: &Tensor) -> candle_core::Result<Tensor> {
    let distance = (diff.sqr()?.sum_keepdim(D::Minus1)? + DISTANCE_EPSILON)?.sqrt()?;
    Tensor::cat(&[&distance, diff], D::Minus1)
}

/// Edges from every point of `a` `(B, V, d)` to every point of `b` `(B, S, d)`.
///
/// Returns `(B, S, V, F)` with `F = min(1 + d, n_properties)`.
pub fn create_edges(
    a: &Tensor,
    b: &Tensor,
    n_properties: Option<usize>,
    weighting: EdgeWeighting,
) -> Result<Tensor> {
    let (batch, _, dim) = a.dims3()?;
    let (batch_b, _, dim_b) = b.dims3()?;
    if batch != batch_b || dim != dim_b {
        return Err(Error::ShapeMismatch {
            what: "edge endpoints",
            expected: vec![batch, dim],
            got: vec![batch_b, dim_b],
        });
    }
    let diff = a.unsqueeze(1)?.broadcast_sub(&b.unsqueeze(2)?)?;
    let mut edges = rot_symmetric_edges(&diff)?;
    if let Some(n) = n_properties {
        if n == 0 {
            return Err(Error::config("n_properties must be positive"));
        }
        if n < dim + 1 {
            edges = edges.narrow(D::Minus1, 0, n)?;
        }
    }
    Ok(weighting.apply(&edges)?)
}

/// Weight vertex features by edges and aggregate towards the edge sources.
///
/// `vertices` is `(B, V, F')`, `edges` `(B, S, V, F)`. Every vertex feature is
/// multiplied by every edge component, giving `(B, S, V, F', F)`, then:
/// - [`Reduce::Mean`] / [`Reduce::MaskedMean`] average over `V` → `(B, S, F'·F)`;
/// - [`Reduce::Flatten`] → `(B, S, V·F'·F)`.
///
/// A masked mean over zero valid vertices is zero.
pub fn apply_edges(vertices: &Tensor, edges: &Tensor, reduce: Reduce<'_>) -> Result<Tensor> {
    let (batch, n_vertices, n_feat) = vertices.dims3()?;
    let (batch_e, n_src, n_vertices_e, n_edge) = edges.dims4()?;
    if batch != batch_e || n_vertices != n_vertices_e {
        return Err(Error::ShapeMismatch {
            what: "apply_edges vertices vs edges",
            expected: vec![batch_e, n_vertices_e],
            got: vec![batch, n_vertices],
        });
    }

    let e = edges.unsqueeze(3)?;
    let v = vertices.unsqueeze(1)?.unsqueeze(4)?;
    let weighted = e.broadcast_mul(&v)?;

    let out = match reduce {
        Reduce::Mean => (weighted.sum(2)? / n_vertices.max(1) as f64)?,
        Reduce::MaskedMean(mask) => {
            let mask = mask
                .to_dtype(weighted.dtype())?
                .reshape((batch, 1, n_vertices, 1, 1))?;
            let summed = weighted.broadcast_mul(&mask)?.sum(2)?;
            let count = mask.sum_keepdim(2)?.squeeze(2)?.maximum(1.0)?;
            summed.broadcast_div(&count)?
        }
        Reduce::Flatten => {
            return Ok(weighted.reshape((batch, n_src, n_vertices * n_feat * n_edge))?);
        }
    };
    Ok(out.reshape((batch, n_src, n_feat * n_edge))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_distance_three_four_five() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[[3.0f32, 4.0, 0.0]]], &device).unwrap();
        let b = Tensor::new(&[[[0.0f32, 0.0, 0.0]]], &device).unwrap();

        let e = create_edges(&a, &b, None, EdgeWeighting::None).unwrap();
        assert_eq!(e.dims(), &[1, 1, 1, 4]);
        let v = e.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((v[0] - 5.0).abs() < 1e-4);
        // point minus neighbor
        assert_eq!(&v[1..], &[3.0, 4.0, 0.0]);

        let e = create_edges(&b, &a, None, EdgeWeighting::None).unwrap();
        let v = e.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((v[0] - 5.0).abs() < 1e-4);
        assert_eq!(&v[1..], &[-3.0, -4.0, 0.0]);
    }

    #[test]
    fn test_zero_distance_is_finite() {
        let device = Device::Cpu;
        let a = Tensor::zeros((1, 2, 3), candle_core::DType::F32, &device).unwrap();
        let e = create_edges(&a, &a, Some(1), EdgeWeighting::GaussOfLin).unwrap();
        assert_eq!(e.dims(), &[1, 2, 2, 1]);
        for w in e.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            // exp(-sqrt(1e-6)) ~ 0.999
            assert!((w - 1.0).abs() < 2e-3);
        }
    }

    #[test]
    fn test_truncation_keeps_distance_first() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[[1.0f32, 0.0], [0.0, 2.0]]], &device).unwrap();
        let b = Tensor::new(&[[[0.0f32, 0.0]]], &device).unwrap();
        let e = create_edges(&a, &b, Some(2), EdgeWeighting::None).unwrap();
        assert_eq!(e.dims(), &[1, 1, 2, 2]);
        let flat = e.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((flat[0] - 1.0).abs() < 1e-3);
        assert!((flat[1] - 1.0).abs() < 1e-6);
        assert!((flat[2] - 2.0).abs() < 1e-3);
        assert!(flat[3].abs() < 1e-6);
    }

    #[test]
    fn test_zero_properties_rejected() {
        let device = Device::Cpu;
        let a = Tensor::zeros((1, 2, 3), candle_core::DType::F32, &device).unwrap();
        assert!(matches!(
            create_edges(&a, &a, Some(0), EdgeWeighting::None),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_apply_edges_mean_and_flatten() {
        let device = Device::Cpu;
        // B=1, V=2, F'=1
        let vertices = Tensor::new(&[[[2.0f32], [4.0]]], &device).unwrap();
        // B=1, S=1, V=2, F=2
        let edges = Tensor::new(&[[[[1.0f32, 0.5], [1.0, 0.0]]]], &device).unwrap();

        let mean = apply_edges(&vertices, &edges, Reduce::Mean).unwrap();
        assert_eq!(mean.dims(), &[1, 1, 2]);
        let v = mean.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(v, vec![3.0, 0.5]);

        let flat = apply_edges(&vertices, &edges, Reduce::Flatten).unwrap();
        assert_eq!(flat.dims(), &[1, 1, 4]);
        let v = flat.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(v, vec![2.0, 1.0, 4.0, 0.0]);
    }

    #[test]
    fn test_masked_mean_ignores_padding() {
        let device = Device::Cpu;
        let vertices = Tensor::new(&[[[2.0f32], [1000.0]]], &device).unwrap();
        let edges = Tensor::new(&[[[[1.0f32], [1.0]]]], &device).unwrap();
        let mask = Tensor::new(&[[1.0f32, 0.0]], &device).unwrap();

        let out = apply_edges(&vertices, &edges, Reduce::MaskedMean(&mask)).unwrap();
        let v = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(v, vec![2.0]);

        let empty = Tensor::new(&[[0.0f32, 0.0]], &device).unwrap();
        let out = apply_edges(&vertices, &edges, Reduce::MaskedMean(&empty)).unwrap();
        let v = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(v, vec![0.0]);
    }
}
