//! `hitgraph`: dynamic-graph message passing for clustering detector hits.
//!
//! Each batch element is a padded cloud of calorimeter hits. Layers learn a
//! small latent space, rebuild a neighbor graph in it on every call, and pass
//! distance-weighted messages along that graph. A softmax head assigns every
//! hit to one of two showers or to background, and a permutation-invariant
//! loss compares the assignment with the truth regardless of shower order.
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`batch`] | [`PointBatch`], valid masks, padding handling |
//! | [`normalize`] | rescaling of energies and coordinates |
//! | [`embed`] | near-identity spatial embedder |
//! | [`graph`] | kNN graph over latent coordinates |
//! | [`edges`] | rotation-invariant edge features and edge-weighted aggregation |
//! | [`seeds`] | seed gathers, nearest-seed labels, seed distances |
//! | [`conv`] | kNN, seed-bipartite and global-exchange layers |
//! | [`head`] | dense + softmax output |
//! | [`loss`] | permutation-invariant clustering loss and response diagnostics |
//! | [`model`] | architecture selection and the end-to-end model |
//!
//! # Example
//!
//! ```rust,no_run
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use hitgraph::{ClusterModel, ModelConfig, PointBatch, SeedSet};
//!
//! # fn main() -> hitgraph::Result<()> {
//! let device = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let model = ClusterModel::new(&ModelConfig::new(1, 2), vb)?;
//!
//! let (b, n) = (4, 128);
//! let batch = PointBatch::new(
//!     Tensor::rand(0f32, 100f32, (b, n, 1), &device)?,
//!     Tensor::randn(0f32, 100f32, (b, n, 3), &device)?,
//!     Tensor::randn(0f32, 10f32, (b, n, 2), &device)?,
//!     vec![n; b],
//!     SeedSet::new(vec![vec![0, 1]; b], n)?,
//! )?
//! .with_targets(Tensor::zeros((b, n, 2), DType::F32, &device)?)?;
//!
//! let out = model.evaluate(&batch)?;
//! println!("loss = {}", out.loss.value()?);
//! // optimizer steps over varmap.all_vars() happen outside this crate
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod batch;
pub mod config;
pub mod conv;
pub mod dense;
pub mod edges;
pub mod embed;
pub mod error;
pub mod graph;
pub mod head;
pub mod loss;
pub mod model;
pub mod normalize;
pub mod seeds;

pub use batch::PointBatch;
pub use config::{
    ArchitectureConfig, EmbedderConfig, GlobalExchangeConfig, LossConfig, ModelConfig,
    NeighborConvConfig, NormalizerConfig, SeededConvConfig,
};
pub use error::{Error, Result};
pub use graph::{knn, NeighborIndex};
pub use loss::{Hypothesis, LossOutput, PermutationInvariantLoss, ResponseDiagnostics};
pub use model::{BatchContext, ClusterModel, FeatureStack, ForwardOutput};
pub use seeds::SeedSet;
