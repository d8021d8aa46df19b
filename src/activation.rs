//! Pointwise activations used by the graph layers.
//!
//! Besides the usual `relu`/`tanh`, the distance-driven layers rely on a few
//! bell-shaped functions that turn a distance-like edge feature into a weight:
//!
//! | Function | Shape | Value at 0 | Large \|x\| |
//! |----------|-------|------------|-------------|
//! | [`gauss_of_lin`] | `exp(-\|x\|)` | 1 | 0 |
//! | [`gauss_times_linear`] | `x · exp(-x²)` | 0 | 0 |
//! | [`open_tanh`] | `0.9 tanh(x) + 0.1 x` | 0, slope 1 | unbounded, slope 0.1 |
//!
//! `gauss_of_lin` lets a layer keep self-like (zero distance) edges at full
//! weight; `gauss_times_linear` suppresses both self edges and long-range
//! edges and peaks at `|x| = 1/√2`. `open_tanh` is the near-linear squashing
//! used by the spatial embedders.

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

/// `exp(-|x|)`.
pub fn gauss_of_lin(x: &Tensor) -> Result<Tensor> {
    x.abs()?.neg()?.exp()
}

/// `x · exp(-x²)`.
pub fn gauss_times_linear(x: &Tensor) -> Result<Tensor> {
    let bell = x.sqr()?.neg()?.exp()?;
    x * bell
}

/// `0.9 · tanh(x) + 0.1 · x`.
pub fn open_tanh(x: &Tensor) -> Result<Tensor> {
    let squashed = x.tanh()?.affine(0.9, 0.0)?;
    squashed + x.affine(0.1, 0.0)?
}

/// Activation applied after a dense transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// No activation.
    #[default]
    Identity,
    Relu,
    Tanh,
    OpenTanh,
    GaussOfLin,
    GaussTimesLinear,
}

impl Activation {
    /// Apply the activation elementwise.
    pub fn apply(self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Relu => x.relu(),
            Self::Tanh => x.tanh(),
            Self::OpenTanh => open_tanh(x),
            Self::GaussOfLin => gauss_of_lin(x),
            Self::GaussTimesLinear => gauss_times_linear(x),
        }
    }
}
