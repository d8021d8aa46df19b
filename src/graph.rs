//! Dynamic neighbor graphs over latent coordinates.
//!
//! Graphs are rebuilt from scratch on every layer call: the latent
//! coordinates change as the embedder trains, so nothing is cached.
//!
//! # Conventions
//!
//! - A point is never its own neighbor.
//! - Padding entries (index `>= valid_count`) are never neighbor candidates.
//! - Equal distances are broken by ascending point index.
//! - When fewer than `k` candidates exist, the remaining slots point at the
//!   query itself and carry a zero weight in [`NeighborIndex::mask`].
//!
//! The bipartite (point → seed) graph needs no search: every point of a batch
//! element shares the same neighbor list, the seed indices, which
//! [`crate::seeds::SeedSet::gather`] serves directly.

use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;
use tracing::trace;

use crate::error::{Error, Result};

/// `k` nearest neighbors of every point, per batch element.
#[derive(Debug, Clone)]
pub struct NeighborIndex {
    batch: usize,
    max_entries: usize,
    k: usize,
    /// Row indices into the `(B·N, F)` flattened point table, length `B·N·k`.
    flat: Tensor,
    /// `(B, N, k)` f32: one for real neighbors, zero for filler slots.
    mask: Tensor,
    local: Vec<u32>,
}

impl NeighborIndex {
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    /// Per-batch-element neighbor indices `[b][i][j]`.
    #[must_use]
    pub fn to_vec3(&self) -> Vec<Vec<Vec<usize>>> {
        self.local
            .chunks(self.max_entries * self.k)
            .map(|element| {
                element
                    .chunks(self.k)
                    .map(|row| row.iter().map(|&j| j as usize).collect())
                    .collect()
            })
            .collect()
    }

    /// Gather neighbor rows: `(B, N, F)` → `(B, N, k, F)`.
    ///
    /// Differentiable with respect to `x`.
    pub fn gather(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, n, f) = x.dims3()?;
        if batch != self.batch || n != self.max_entries {
            return Err(Error::ShapeMismatch {
                what: "neighbor gather",
                expected: vec![self.batch, self.max_entries],
                got: vec![batch, n],
            });
        }
        let rows = x.reshape((batch * n, f))?;
        let idx = self.flat.to_device(x.device())?;
        let gathered = rows.index_select(&idx, 0)?;
        Ok(gathered.reshape((batch, n, self.k, f))?)
    }
}

/// Build the kNN graph of `latent` `(B, N, d)`.
///
/// # Errors
/// - [`Error::InvalidConfig`] if `k == 0`
/// - [`Error::KTooLarge`] if `k > N`
///
/// # Complexity
/// O(N² · d) per batch element; batch elements run in parallel.
pub fn knn(latent: &Tensor, valid_counts: &[usize], k: usize) -> Result<NeighborIndex> {
    let (batch, n, dim) = latent.dims3()?;
    if k == 0 {
        return Err(Error::config("k must be positive"));
    }
    if k > n {
        return Err(Error::KTooLarge { k, max_entries: n });
    }
    if dim == 0 {
        return Err(Error::config("latent dimension must be positive"));
    }
    if valid_counts.len() != batch {
        return Err(Error::ShapeMismatch {
            what: "valid counts",
            expected: vec![batch],
            got: vec![valid_counts.len()],
        });
    }
    for (b, &count) in valid_counts.iter().enumerate() {
        if count > n {
            return Err(Error::ValidCountOutOfRange {
                batch: b,
                count,
                max_entries: n,
            });
        }
    }

    let coords = latent
        .detach()
        .to_dtype(DType::F32)?
        .to_device(&Device::Cpu)?
        .flatten_all()?
        .to_vec1::<f32>()?;

    let per_element: Vec<(Vec<u32>, Vec<f32>)> = coords
        .par_chunks(n * dim)
        .zip(valid_counts.par_iter())
        .map(|(points, &valid)| knn_element(points, n, dim, valid, k))
        .collect();

    let mut local = Vec::with_capacity(batch * n * k);
    let mut flat = Vec::with_capacity(batch * n * k);
    let mut mask = Vec::with_capacity(batch * n * k);
    for (b, (indices, weights)) in per_element.into_iter().enumerate() {
        let offset = (b * n) as u32;
        flat.extend(indices.iter().map(|&j| j + offset));
        local.extend(indices);
        mask.extend(weights);
    }

    trace!(batch, n, k, "built knn graph");

    let device = latent.device();
    Ok(NeighborIndex {
        batch,
        max_entries: n,
        k,
        flat: Tensor::from_vec(flat, batch * n * k, device)?,
        mask: Tensor::from_vec(mask, (batch, n, k), device)?.to_dtype(latent.dtype())?,
        local,
    })
}

fn knn_element(points: &[f32], n: usize, dim: usize, valid: usize, k: usize) -> (Vec<u32>, Vec<f32>) {
    let mut indices = Vec::with_capacity(n * k);
    let mut weights = Vec::with_capacity(n * k);
    let mut candidates: Vec<(f32, usize)> = Vec::with_capacity(valid);

    for i in 0..n {
        let query = &points[i * dim..(i + 1) * dim];
        candidates.clear();
        candidates.extend((0..valid).filter(|&j| j != i).map(|j| {
            let other = &points[j * dim..(j + 1) * dim];
            let d2: f32 = query
                .iter()
                .zip(other)
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            (d2, j)
        }));
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let found = candidates.len().min(k);
        for &(_, j) in &candidates[..found] {
            indices.push(j as u32);
            weights.push(1.0);
        }
        for _ in found..k {
            indices.push(i as u32);
            weights.push(0.0);
        }
    }
    (indices, weights)
}
