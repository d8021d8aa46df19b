//! Padded batches of detector hits.

use candle_core::{Tensor, D};

use crate::error::{Error, Result};
use crate::seeds::SeedSet;

/// Fixed-capacity batch of points with a per-element valid count.
///
/// Entries at index `>= valid_counts[b]` are padding and may hold arbitrary
/// values. Shapes:
///
/// | Tensor | Shape |
/// |--------|-------|
/// | `features` | `(B, N, F_o)`, column 0 is the energy |
/// | `global` | `(B, N, 3)` |
/// | `local` | `(B, N, L)` |
/// | `targets` | `(B, N, 2)` (optional) |
#[derive(Debug, Clone)]
pub struct PointBatch {
    features: Tensor,
    global: Tensor,
    local: Tensor,
    valid_counts: Vec<usize>,
    seeds: SeedSet,
    targets: Option<Tensor>,
}

fn expect_dims(what: &'static str, t: &Tensor, batch: usize, n: usize) -> Result<usize> {
    let (b, m, f) = t.dims3()?;
    if b != batch || m != n {
        return Err(Error::ShapeMismatch {
            what,
            expected: vec![batch, n],
            got: vec![b, m],
        });
    }
    Ok(f)
}

impl PointBatch {
    /// Validate and assemble a batch.
    ///
    /// Seeds must index valid entries of their batch element (any index
    /// `< N` is accepted when the element has no valid entries).
    pub fn new(
        features: Tensor,
        global: Tensor,
        local: Tensor,
        valid_counts: Vec<usize>,
        seeds: SeedSet,
    ) -> Result<Self> {
        let (batch, n, n_features) = features.dims3()?;
        if batch == 0 {
            return Err(Error::config("batch must contain at least one element"));
        }
        if n_features == 0 {
            return Err(Error::config("features need an energy column"));
        }
        let global_dim = expect_dims("global coordinates", &global, batch, n)?;
        if global_dim != 3 {
            return Err(Error::ShapeMismatch {
                what: "global coordinate width",
                expected: vec![3],
                got: vec![global_dim],
            });
        }
        expect_dims("local coordinates", &local, batch, n)?;

        if valid_counts.len() != batch {
            return Err(Error::ShapeMismatch {
                what: "valid counts",
                expected: vec![batch],
                got: vec![valid_counts.len()],
            });
        }
        if seeds.batch_size() != batch || seeds.max_entries() != n {
            return Err(Error::ShapeMismatch {
                what: "seed set",
                expected: vec![batch, n],
                got: vec![seeds.batch_size(), seeds.max_entries()],
            });
        }
        for (b, (&count, element_seeds)) in valid_counts.iter().zip(seeds.indices()).enumerate() {
            if count > n {
                return Err(Error::ValidCountOutOfRange {
                    batch: b,
                    count,
                    max_entries: n,
                });
            }
            if count > 0 {
                if let Some(&seed) = element_seeds.iter().find(|&&s| s >= count) {
                    return Err(Error::SeedOutOfRange {
                        batch: b,
                        seed,
                        valid_count: count,
                    });
                }
            }
        }

        Ok(Self {
            features,
            global,
            local,
            valid_counts,
            seeds,
            targets: None,
        })
    }

    /// Attach per-point cluster targets `(B, N, 2)`.
    pub fn with_targets(mut self, targets: Tensor) -> Result<Self> {
        let width = expect_dims("targets", &targets, self.batch_size(), self.max_entries())?;
        if width != 2 {
            return Err(Error::ShapeMismatch {
                what: "target width",
                expected: vec![2],
                got: vec![width],
            });
        }
        self.targets = Some(targets);
        Ok(self)
    }

    /// Number of batch elements `B`.
    pub fn batch_size(&self) -> usize {
        self.valid_counts.len()
    }

    /// Capacity `N` of every batch element.
    pub fn max_entries(&self) -> usize {
        self.seeds.max_entries()
    }

    pub fn valid_counts(&self) -> &[usize] {
        &self.valid_counts
    }

    pub fn seeds(&self) -> &SeedSet {
        &self.seeds
    }

    pub fn features(&self) -> &Tensor {
        &self.features
    }

    pub fn global(&self) -> &Tensor {
        &self.global
    }

    pub fn local(&self) -> &Tensor {
        &self.local
    }

    /// Cluster fractions `(B, N, 2)`, if attached.
    pub fn targets(&self) -> Option<&Tensor> {
        self.targets.as_ref()
    }

    /// Feature columns per point, energy included.
    pub fn n_other_features(&self) -> usize {
        self.features.dim(D::Minus1).unwrap_or(0)
    }

    pub fn n_local(&self) -> usize {
        self.local.dim(D::Minus1).unwrap_or(0)
    }

    /// Raw energy column `(B, N)`.
    pub fn energy(&self) -> Result<Tensor> {
        Ok(self.features.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?)
    }

    /// `(B, N)` f32 mask, one for valid entries.
    pub fn valid_mask(&self) -> Result<Tensor> {
        valid_mask(&self.valid_counts, self.max_entries(), self.features.device())
    }
}

/// `(B, N)` f32 mask from per-element counts (`sequence_mask`).
pub fn valid_mask(
    valid_counts: &[usize],
    max_entries: usize,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let data: Vec<f32> = valid_counts
        .iter()
        .flat_map(|&count| (0..max_entries).map(move |i| if i < count { 1.0 } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(data, (valid_counts.len(), max_entries), device)?)
}

/// Replace rows of `x` `(B, N, F)` where `mask` `(B, N)` is zero by exact zeros.
///
/// Uses a select, so non-finite padding values do not leak.
pub fn zero_padding(x: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let keep = mask
        .ne(0.0)?
        .unsqueeze(D::Minus1)?
        .broadcast_as(x.shape())?
        .contiguous()?;
    let zeros = x.zeros_like()?;
    Ok(keep.where_cond(x, &zeros)?)
}

/// Point input for the first layer: `[global, features, local]`.
pub fn collapse(global: &Tensor, features: &Tensor, local: &Tensor) -> Result<Tensor> {
    let dtype = features.dtype();
    let global = global.to_dtype(dtype)?;
    let local = local.to_dtype(dtype)?;
    Ok(Tensor::cat(&[&global, features, &local], D::Minus1)?)
}

/// Test helper: `(B, N, F)` f32 tensor from nested vectors.
#[cfg(test)]
pub(crate) fn tensor3(rows: &[Vec<Vec<f32>>], device: &candle_core::Device) -> Result<Tensor> {
    let batch = rows.len();
    let n = rows.first().map_or(0, Vec::len);
    let f = rows
        .first()
        .and_then(|element| element.first())
        .map_or(0, Vec::len);
    let mut data = Vec::with_capacity(batch * n * f);
    for element in rows {
        if element.len() != n {
            return Err(Error::ShapeMismatch {
                what: "nested rows",
                expected: vec![n],
                got: vec![element.len()],
            });
        }
        for row in element {
            if row.len() != f {
                return Err(Error::ShapeMismatch {
                    what: "nested row width",
                    expected: vec![f],
                    got: vec![row.len()],
                });
            }
            data.extend_from_slice(row);
        }
    }
    Ok(Tensor::from_vec(data, (batch, n, f), device)?)
}
