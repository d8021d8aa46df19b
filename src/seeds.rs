//! Seed points: message hubs and cluster-label anchors.
//!
//! A [`SeedSet`] holds the same number of point indices for every batch
//! element. Gathers are batched through one `index_select` on the flattened
//! `(B·N, F)` table with per-element offsets, so an index never reaches into
//! another batch element.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::Module;

use crate::dense::Dense;
use crate::edges::{create_edges, EdgeWeighting};
use crate::error::{Error, Result};

/// Seed indices per batch element (`B × S`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedSet {
    indices: Vec<Vec<usize>>,
    max_entries: usize,
}

impl SeedSet {
    /// Validate and wrap seed indices.
    ///
    /// Every batch element must carry the same non-zero number of seeds, each
    /// `< max_entries`.
    pub fn new(indices: Vec<Vec<usize>>, max_entries: usize) -> Result<Self> {
        let n_seeds = indices.first().map_or(0, Vec::len);
        if n_seeds == 0 {
            return Err(Error::config("seed set needs at least one seed per batch element"));
        }
        for (b, seeds) in indices.iter().enumerate() {
            if seeds.len() != n_seeds {
                return Err(Error::ShapeMismatch {
                    what: "seeds per batch element",
                    expected: vec![n_seeds],
                    got: vec![seeds.len()],
                });
            }
            if let Some(&seed) = seeds.iter().find(|&&s| s >= max_entries) {
                return Err(Error::SeedBeyondCapacity {
                    batch: b,
                    seed,
                    max_entries,
                });
            }
        }
        Ok(Self {
            indices,
            max_entries,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.indices.len()
    }

    pub fn n_seeds(&self) -> usize {
        self.indices.first().map_or(0, Vec::len)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn indices(&self) -> &[Vec<usize>] {
        &self.indices
    }

    /// Same seeds against a different batch capacity.
    pub fn with_max_entries(&self, max_entries: usize) -> Result<Self> {
        Self::new(self.indices.clone(), max_entries)
    }

    fn flat_index(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<u32> = self
            .indices
            .iter()
            .enumerate()
            .flat_map(|(b, seeds)| seeds.iter().map(move |&s| (b * self.max_entries + s) as u32))
            .collect();
        Ok(Tensor::from_vec(flat, self.indices.len() * self.n_seeds(), device)?)
    }

    /// Rows at the seed indices: `(B, N, F)` → `(B, S, F)`.
    pub fn gather(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, n, f) = x.dims3()?;
        if batch != self.batch_size() || n != self.max_entries {
            return Err(Error::ShapeMismatch {
                what: "seed gather",
                expected: vec![self.batch_size(), self.max_entries],
                got: vec![batch, n],
            });
        }
        let idx = self.flat_index(x.device())?;
        let rows = x.reshape((batch * n, f))?.index_select(&idx, 0)?;
        Ok(rows.reshape((batch, self.n_seeds(), f))?)
    }
}

/// Index of the closest seed in `global` coordinates for every point.
///
/// Returns `(B, N)` f32 labels. Equal distances go to the lower seed slot.
pub fn nearest_seed_labels(global: &Tensor, seeds: &SeedSet) -> Result<Tensor> {
    let (batch, n, _) = global.dims3()?;
    let seed_space = seeds.gather(global)?;
    let points = global.detach().to_dtype(DType::F32)?.to_vec3::<f32>()?;
    let anchors = seed_space.detach().to_dtype(DType::F32)?.to_vec3::<f32>()?;

    let mut labels = Vec::with_capacity(batch * n);
    for (element, element_seeds) in points.iter().zip(&anchors) {
        for point in element {
            let mut best = 0usize;
            let mut best_d2 = f32::INFINITY;
            for (slot, anchor) in element_seeds.iter().enumerate() {
                let d2: f32 = point
                    .iter()
                    .zip(anchor)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                if d2 < best_d2 {
                    best = slot;
                    best_d2 = d2;
                }
            }
            labels.push(best as f32);
        }
    }
    Ok(Tensor::from_vec(labels, (batch, n), global.device())?.to_dtype(global.dtype())?)
}

/// Append `labels` `(B, N)` as a trailing feature column of `features`.
pub fn append_seed_labels(features: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let column = labels.to_dtype(features.dtype())?.unsqueeze(D::Minus1)?;
    Ok(Tensor::cat(&[features, &column], D::Minus1)?)
}

/// Gauss-of-linear distance from every point to every seed in a learned
/// projection of `x`.
///
/// `projection` maps `(B, N, F)` to `(B, N, p)`; the result is `(B, N, S)`,
/// followed by `zero_columns` zero columns.
pub fn distance_weights_to_seeds(
    x: &Tensor,
    seeds: &SeedSet,
    projection: &Dense,
    zero_columns: usize,
) -> Result<Tensor> {
    let projected = projection.forward(x)?;
    let seed_projected = seeds.gather(&projected)?;
    let edges = create_edges(&projected, &seed_projected, Some(1), EdgeWeighting::GaussOfLin)?;
    // (B, S, N, 1) -> (B, N, S)
    let distance = edges.squeeze(D::Minus1)?.transpose(1, 2)?.contiguous()?;
    if zero_columns == 0 {
        return Ok(distance);
    }
    let (batch, n, _) = distance.dims3()?;
    let zeros = Tensor::zeros((batch, n, zero_columns), distance.dtype(), distance.device())?;
    Ok(Tensor::cat(&[&distance, &zeros], D::Minus1)?)
}
