//! Permutation-invariant clustering loss.
//!
//! The two foreground clusters have no fixed order: the network may call the
//! first shower "class 1" in one event and "class 0" in the next. Each batch
//! element is therefore scored against its targets as given and with the two
//! cluster columns swapped, and the cheaper hypothesis wins.
//!
//! For one batch element with valid points `V`, energies `E_i`, predictions
//! `p_ic` and targets `t_ic` (c ∈ {0, 1}):
//!
//! ```text
//! L(t) = Σ_{i∈V} E_i Σ_c (p_ic − t_ic)²  /  (Σ_{i∈V} E_i · |V|)
//! L    = min( L(t), L(swap(t)) )
//! ```
//!
//! Elements with no valid points or no valid energy contribute exactly zero.
//! The batch loss is the mean over elements, times `LossConfig::scale`.
//!
//! # Response diagnostics
//!
//! With `t'` the targets under the chosen hypothesis:
//!
//! ```text
//! response_c      = Σ p_ic E_i / Σ t'_ic E_i
//! sqrt_response_c = Σ p_ic t'_ic √E_i / Σ t'_ic √E_i
//! ```
//!
//! Both classes of every element are pooled; the reported mean is clipped to
//! `mean_clip` and the variance is clipped to `variance_clip` and divided by
//! the clipped mean. A zero denominator gives a response of zero.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::batch::valid_mask;
use crate::config::LossConfig;
use crate::error::{Error, Result};

/// Which target labelling a batch element was scored against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hypothesis {
    AsGiven,
    Swapped,
}

/// Batch-level response statistics.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseDiagnostics {
    pub mean_response: f32,
    pub variance_response: f32,
    pub mean_sqrt_response: f32,
    pub variance_sqrt_response: f32,
    /// Raw responses: class 0 of every element, then class 1.
    pub responses: Vec<f32>,
    pub sqrt_responses: Vec<f32>,
}

/// Result of [`PermutationInvariantLoss::compute`].
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar, differentiable with respect to the prediction.
    pub loss: Tensor,
    /// Selected per-element loss (before `scale`).
    pub per_element: Vec<f32>,
    pub hypotheses: Vec<Hypothesis>,
    pub diagnostics: ResponseDiagnostics,
}

impl LossOutput {
    pub fn value(&self) -> Result<f32> {
        Ok(self.loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PermutationInvariantLoss {
    config: LossConfig,
}

impl PermutationInvariantLoss {
    pub fn new(config: LossConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Score `prediction` `(B, N, C ≥ 2)` against `targets` `(B, N, 2)`.
    ///
    /// Only the first two prediction columns are compared. Values at padding
    /// positions are ignored, even non-finite ones. Elements without valid
    /// entries or with zero or non-finite valid energy add zero.
    ///
    /// # Arguments
    /// - `prediction`: Class probabilities (B x N x C)
    /// - `targets`: Cluster fractions (B x N x 2)
    /// - `energy`: Raw hit energies (B x N)
    /// - `valid_counts`: Valid entries per batch element
    ///
    /// # Returns
    /// - Scaled batch-mean loss plus per-element terms, chosen hypotheses and
    ///   response diagnostics
    pub fn compute(
        &self,
        prediction: &Tensor,
        targets: &Tensor,
        energy: &Tensor,
        valid_counts: &[usize],
    ) -> Result<LossOutput> {
        let (batch, n, classes) = prediction.dims3()?;
        if classes < 2 {
            return Err(Error::ShapeMismatch {
                what: "prediction classes",
                expected: vec![2],
                got: vec![classes],
            });
        }
        if targets.dims() != [batch, n, 2] {
            return Err(Error::ShapeMismatch {
                what: "targets",
                expected: vec![batch, n, 2],
                got: targets.dims().to_vec(),
            });
        }
        if energy.dims() != [batch, n] {
            return Err(Error::ShapeMismatch {
                what: "energy",
                expected: vec![batch, n],
                got: energy.dims().to_vec(),
            });
        }
        if valid_counts.len() != batch {
            return Err(Error::ShapeMismatch {
                what: "valid counts",
                expected: vec![batch],
                got: vec![valid_counts.len()],
            });
        }
        if batch == 0 {
            return Err(Error::config("loss needs at least one batch element"));
        }
        if let Some((b, &count)) = valid_counts.iter().enumerate().find(|&(_, &c)| c > n) {
            return Err(Error::ValidCountOutOfRange {
                batch: b,
                count,
                max_entries: n,
            });
        }

        let device = prediction.device();
        let dtype = prediction.dtype();
        let keep = valid_mask(valid_counts, n, device)?.ne(0.0)?;
        let keep2 = keep.unsqueeze(2)?.broadcast_as((batch, n, 2))?.contiguous()?;

        let p = prediction.narrow(2, 0, 2)?.contiguous()?;
        let p = keep2.where_cond(&p, &p.zeros_like()?)?;
        let t = targets.to_dtype(dtype)?;
        let t = keep2.where_cond(&t, &t.zeros_like()?)?;
        let e = energy.to_dtype(dtype)?;
        let e = keep.where_cond(&e, &e.zeros_like()?)?;
        let swapped = Tensor::cat(&[&t.narrow(2, 1, 1)?, &t.narrow(2, 0, 1)?], 2)?;

        let energy_sums = e.to_dtype(DType::F32)?.sum(1)?.to_vec1::<f32>()?;
        let mut usable = Vec::with_capacity(batch);
        let mut norm = Vec::with_capacity(batch);
        for (b, (&count, &esum)) in valid_counts.iter().zip(&energy_sums).enumerate() {
            if count == 0 {
                warn!(batch = b, "batch element without valid entries, loss term set to zero");
                usable.push(false);
                norm.push(0.0f32);
            } else if esum == 0.0 || !esum.is_finite() {
                warn!(batch = b, energy = esum, "batch element without usable energy, loss term set to zero");
                usable.push(false);
                norm.push(0.0);
            } else {
                usable.push(true);
                norm.push(1.0 / (esum * count as f32));
            }
        }
        let norm = Tensor::from_vec(norm, batch, device)?.to_dtype(dtype)?;
        // inf · 0 is NaN, so degenerate rows lose their energy entirely
        let rows = Tensor::from_vec(
            usable.iter().map(|&u| u8::from(u)).collect::<Vec<_>>(),
            (batch, 1),
            device,
        )?
        .broadcast_as((batch, n))?
        .contiguous()?;
        let e = rows.where_cond(&e, &e.zeros_like()?)?;

        let score = |target: &Tensor| -> Result<Tensor> {
            let weighted = ((&p - target)?.sqr()?.sum(2)? * &e)?.sum(1)?;
            Ok((weighted * &norm)?)
        };
        let given = score(&t)?;
        let flipped = score(&swapped)?;

        let given_host = given.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let flipped_host = flipped.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let mut hypotheses = Vec::with_capacity(batch);
        let mut per_element = Vec::with_capacity(batch);
        let mut select = Vec::with_capacity(batch);
        for (&a, &b) in given_host.iter().zip(&flipped_host) {
            if b < a {
                hypotheses.push(Hypothesis::Swapped);
                per_element.push(b);
                select.push(1.0f32);
            } else {
                hypotheses.push(Hypothesis::AsGiven);
                per_element.push(a);
                select.push(0.0);
            }
        }
        let select = Tensor::from_vec(select, batch, device)?.to_dtype(dtype)?;
        let keep_given = select.affine(-1.0, 1.0)?;
        let chosen = ((given * keep_given)? + (flipped * &select)?)?;
        let loss = chosen.mean_all()?.affine(f64::from(self.config.scale), 0.0)?;

        let diagnostics = self.diagnostics(&p, &t, &e, valid_counts, &usable, &hypotheses)?;

        Ok(LossOutput {
            loss,
            per_element,
            hypotheses,
            diagnostics,
        })
    }

    fn diagnostics(
        &self,
        prediction: &Tensor,
        targets: &Tensor,
        energy: &Tensor,
        valid_counts: &[usize],
        usable: &[bool],
        hypotheses: &[Hypothesis],
    ) -> Result<ResponseDiagnostics> {
        let p = prediction.detach().to_dtype(DType::F32)?.to_vec3::<f32>()?;
        let t = targets.detach().to_dtype(DType::F32)?.to_vec3::<f32>()?;
        let e = energy.detach().to_dtype(DType::F32)?.to_vec2::<f32>()?;

        let batch = hypotheses.len();
        let mut responses = vec![0.0f32; 2 * batch];
        let mut sqrt_responses = vec![0.0f32; 2 * batch];
        let mut pooled = Vec::with_capacity(2 * batch);
        let mut sqrt_pooled = Vec::with_capacity(2 * batch);
        let mut vanished = 0usize;

        for (b, hypothesis) in hypotheses.iter().enumerate() {
            if !usable[b] {
                continue;
            }
            let valid = valid_counts[b];
            for c in 0..2 {
                let tc = match hypothesis {
                    Hypothesis::AsGiven => c,
                    Hypothesis::Swapped => 1 - c,
                };
                let (mut num, mut den, mut sqrt_num, mut sqrt_den) = (0f64, 0f64, 0f64, 0f64);
                for i in 0..valid {
                    let energy = f64::from(e[b][i]);
                    let root = energy.max(0.0).sqrt();
                    let pred = f64::from(p[b][i][c]);
                    let truth = f64::from(t[b][i][tc]);
                    num += pred * energy;
                    den += truth * energy;
                    sqrt_num += pred * truth * root;
                    sqrt_den += truth * root;
                }
                if let Some(r) = ratio(num, den, &mut vanished) {
                    responses[c * batch + b] = r;
                    pooled.push(r);
                }
                if let Some(r) = ratio(sqrt_num, sqrt_den, &mut vanished) {
                    sqrt_responses[c * batch + b] = r;
                    sqrt_pooled.push(r);
                }
            }
        }
        if vanished > 0 {
            warn!(count = vanished, "response denominators vanished, reported as zero and left out of the moments");
        }

        let (mean_response, variance_response) = self.normalise(&pooled);
        let (mean_sqrt_response, variance_sqrt_response) = self.normalise(&sqrt_pooled);
        Ok(ResponseDiagnostics {
            mean_response,
            variance_response,
            mean_sqrt_response,
            variance_sqrt_response,
            responses,
            sqrt_responses,
        })
    }

    /// Clipped mean and clipped relative (population) variance.
    ///
    /// An empty slice pools to a zero mean before clipping.
    fn normalise(&self, values: &[f32]) -> (f32, f32) {
        let len = values.len().max(1) as f64;
        let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / len;
        let variance = values
            .iter()
            .map(|&v| (f64::from(v) - mean).powi(2))
            .sum::<f64>()
            / len;
        let (mlo, mhi) = self.config.mean_clip;
        let (vlo, vhi) = self.config.variance_clip;
        let mean = (mean as f32).clamp(mlo, mhi);
        let variance = (variance as f32).clamp(vlo, vhi) / mean;
        (mean, variance)
    }
}

fn ratio(num: f64, den: f64, vanished: &mut usize) -> Option<f32> {
    if den == 0.0 {
        *vanished += 1;
        None
    } else {
        Some((num / den) as f32)
    }
}
