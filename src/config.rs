//! Layer, model and loss configuration.
//!
//! Every config is a plain serde struct with a `Default` tuned to the
//! calorimeter clustering setup and `with_*` builders for the fields callers
//! usually touch. Configs are validated once, when the layer or model is
//! built.
//!
//! # Example
//!
//! ```rust
//! use hitgraph::config::{ArchitectureConfig, ModelConfig, SeededConvConfig};
//!
//! let config = ModelConfig::new(1, 2)
//!     .with_architecture(ArchitectureConfig::SeedDriven {
//!         depth: 4,
//!         conv: SeededConvConfig::default().with_filters(16),
//!         distance_weights: None,
//!     })
//!     .with_seed(7);
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::edges::EdgeWeighting;
use crate::error::{Error, Result};

fn require_positive(value: usize, what: &str) -> Result<()> {
    if value == 0 {
        return Err(Error::config(format!("{what} must be positive")));
    }
    Ok(())
}

/// Rescaling constants for raw detector quantities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Multiplier applied to every feature column (default: 1e-4).
    pub energy_scale: f64,
    /// Use `ln(x + 1) / 10` instead of `energy_scale` (default: false).
    pub log_energy: bool,
    /// Divisor for the two transverse global axes (default: 150).
    pub transverse_scale: f64,
    /// Divisor for the longitudinal global axis (default: 1600).
    pub longitudinal_scale: f64,
    /// Divisor for every local coordinate (default: 150).
    pub local_scale: f64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            energy_scale: 1e-4,
            log_energy: false,
            transverse_scale: 150.0,
            longitudinal_scale: 1600.0,
            local_scale: 150.0,
        }
    }
}

impl NormalizerConfig {
    pub fn with_log_energy(mut self, log_energy: bool) -> Self {
        self.log_energy = log_energy;
        self
    }

    pub fn with_energy_scale(mut self, scale: f64) -> Self {
        self.energy_scale = scale;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (value, what) in [
            (self.transverse_scale, "transverse_scale"),
            (self.longitudinal_scale, "longitudinal_scale"),
            (self.local_scale, "local_scale"),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::config(format!("{what} must be finite and positive")));
            }
        }
        if !self.energy_scale.is_finite() {
            return Err(Error::config("energy_scale must be finite"));
        }
        Ok(())
    }
}

/// Spatial embedder shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// Widths of the `open_tanh` hidden layers (default: `[32]`).
    pub hidden: Vec<usize>,
    /// Latent coordinate dimension (default: 4).
    pub out_dim: usize,
    /// Inputs of hidden layers are divided by this and outputs multiplied
    /// back (default: 10).
    pub input_scale: f64,
    /// Bias on the final projection (default: true).
    pub final_bias: bool,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            hidden: vec![32],
            out_dim: 4,
            input_scale: 10.0,
            final_bias: true,
        }
    }
}

impl EmbedderConfig {
    pub fn new(hidden: Vec<usize>, out_dim: usize) -> Self {
        Self {
            hidden,
            out_dim,
            ..Self::default()
        }
    }

    pub fn with_final_bias(mut self, final_bias: bool) -> Self {
        self.final_bias = final_bias;
        self
    }

    pub fn validate(&self) -> Result<()> {
        require_positive(self.out_dim, "embedder out_dim")?;
        for &h in &self.hidden {
            require_positive(h, "embedder hidden width")?;
        }
        if !(self.input_scale.is_finite() && self.input_scale > 0.0) {
            return Err(Error::config("embedder input_scale must be finite and positive"));
        }
        Ok(())
    }
}

/// Full k-nearest-neighbor convolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborConvConfig {
    /// Neighbors per point (default: 16).
    pub k: usize,
    pub embedder: EmbedderConfig,
    /// Output width of each aggregation iteration (default: `[16; 4]`).
    pub filters: Vec<usize>,
    /// Activation of the edge re-embedding (default: `GaussOfLin`).
    pub edge_activation: Activation,
    /// Emit the concatenation of every iteration instead of the last one.
    pub concat_iterations: bool,
}

impl Default for NeighborConvConfig {
    fn default() -> Self {
        Self {
            k: 16,
            embedder: EmbedderConfig::new(vec![16], 4),
            filters: vec![16; 4],
            edge_activation: Activation::GaussOfLin,
            concat_iterations: false,
        }
    }
}

impl NeighborConvConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_filters(mut self, filters: Vec<usize>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_embedder(mut self, embedder: EmbedderConfig) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_concat_iterations(mut self, concat: bool) -> Self {
        self.concat_iterations = concat;
        self
    }

    pub fn validate(&self) -> Result<()> {
        require_positive(self.k, "k")?;
        self.embedder.validate()?;
        if self.filters.is_empty() {
            return Err(Error::config("neighbor conv needs at least one iteration"));
        }
        for &f in &self.filters {
            require_positive(f, "neighbor conv filter width")?;
        }
        Ok(())
    }

    /// Width of the layer output.
    pub fn output_dim(&self) -> usize {
        if self.concat_iterations {
            self.filters.iter().sum()
        } else {
            self.filters.last().copied().unwrap_or(0)
        }
    }
}

/// Seed-bipartite convolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeededConvConfig {
    /// Output width (default: 22).
    pub filters: usize,
    pub embedder: EmbedderConfig,
    /// Seeds exchange messages before points read them back (default: true).
    pub seed_talk: bool,
    /// Compress seed summaries before and after back-propagation (default: true).
    pub compress: bool,
    /// Keep only the first `n` edge components (default: `Some(4)`).
    pub edge_properties: Option<usize>,
    pub edge_weighting: EdgeWeighting,
}

impl Default for SeededConvConfig {
    fn default() -> Self {
        Self {
            filters: 22,
            embedder: EmbedderConfig::new(vec![30], 4).with_final_bias(false),
            seed_talk: true,
            compress: true,
            edge_properties: Some(4),
            edge_weighting: EdgeWeighting::GaussTimesLinear,
        }
    }
}

impl SeededConvConfig {
    pub fn with_filters(mut self, filters: usize) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_seed_talk(mut self, seed_talk: bool) -> Self {
        self.seed_talk = seed_talk;
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_edge_properties(mut self, n: Option<usize>) -> Self {
        self.edge_properties = n;
        self
    }

    pub fn with_embedder(mut self, embedder: EmbedderConfig) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn validate(&self) -> Result<()> {
        require_positive(self.filters, "seeded conv filters")?;
        self.embedder.validate()?;
        if let Some(n) = self.edge_properties {
            require_positive(n, "edge_properties")?;
        }
        Ok(())
    }

    /// Number of edge components after truncation.
    pub fn edge_dim(&self) -> usize {
        let full = self.embedder.out_dim + 1;
        self.edge_properties.map_or(full, |n| n.min(full))
    }
}

/// Pool-and-broadcast exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GlobalExchangeConfig {
    /// Width of an optional `relu` expansion before pooling.
    pub expand_to: Option<usize>,
    /// Dimension of a learned placement space; adds one distance feature.
    pub placement_dims: Option<usize>,
    /// Width of an optional `relu` collapse after concatenation.
    pub collapse_to: Option<usize>,
}

impl GlobalExchangeConfig {
    pub fn with_expand_to(mut self, dims: Option<usize>) -> Self {
        self.expand_to = dims;
        self
    }

    pub fn with_placement_dims(mut self, dims: Option<usize>) -> Self {
        self.placement_dims = dims;
        self
    }

    pub fn with_collapse_to(mut self, dims: Option<usize>) -> Self {
        self.collapse_to = dims;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (value, what) in [
            (self.expand_to, "expand_to"),
            (self.placement_dims, "placement_dims"),
            (self.collapse_to, "collapse_to"),
        ] {
            if let Some(v) = value {
                require_positive(v, what)?;
            }
        }
        Ok(())
    }

    /// Width of the layer output for a given input width.
    pub fn output_dim(&self, in_dim: usize) -> usize {
        if let Some(c) = self.collapse_to {
            return c;
        }
        let expanded = self.expand_to.unwrap_or(in_dim);
        let with_placement = expanded + usize::from(self.placement_dims.is_some());
        2 * with_placement
    }
}

/// Architecture variant, chosen once when the model is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchitectureConfig {
    /// Stacked kNN convolutions.
    Neighbors {
        layers: Vec<NeighborConvConfig>,
        /// Feed the concatenation of every layer's output to the head.
        concat_layers: bool,
    },
    /// Repeated seed-bipartite convolutions.
    SeedDriven {
        depth: usize,
        conv: SeededConvConfig,
        /// Append this many gauss-of-linear seed distances before the head.
        distance_weights: Option<usize>,
    },
    /// One kNN convolution followed by seed-bipartite convolutions.
    SeedDrivenNeighbors {
        neighbors: NeighborConvConfig,
        depth: usize,
        conv: SeededConvConfig,
    },
    /// Repeated global exchanges; every `keep_every`-th output (and the
    /// last) is concatenated and compressed to `hidden`.
    GlobalExchange {
        depth: usize,
        exchange: GlobalExchangeConfig,
        keep_every: usize,
        hidden: usize,
    },
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self::SeedDriven {
            depth: 8,
            conv: SeededConvConfig::default(),
            distance_weights: None,
        }
    }
}

impl ArchitectureConfig {
    /// Five kNN layers with two iterations each, concatenated.
    pub fn neighbors() -> Self {
        let layer = NeighborConvConfig::default()
            .with_k(24)
            .with_filters(vec![32, 32])
            .with_embedder(EmbedderConfig::new(vec![32], 8));
        Self::Neighbors {
            layers: vec![layer; 5],
            concat_layers: true,
        }
    }

    pub fn seed_driven_neighbors() -> Self {
        Self::SeedDrivenNeighbors {
            neighbors: NeighborConvConfig::default()
                .with_filters(vec![42; 5])
                .with_embedder(EmbedderConfig::new(vec![64], 4)),
            depth: 5,
            conv: SeededConvConfig::default()
                .with_filters(24)
                .with_embedder(EmbedderConfig::new(vec![64], 4).with_final_bias(false)),
        }
    }

    pub fn global_exchange() -> Self {
        Self::GlobalExchange {
            depth: 13,
            exchange: GlobalExchangeConfig::default()
                .with_collapse_to(Some(42))
                .with_placement_dims(Some(3)),
            keep_every: 2,
            hidden: 32,
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Neighbors { .. } => "neighbors",
            Self::SeedDriven { .. } => "seed_driven",
            Self::SeedDrivenNeighbors { .. } => "seed_driven_neighbors",
            Self::GlobalExchange { .. } => "global_exchange",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Neighbors { layers, .. } => {
                if layers.is_empty() {
                    return Err(Error::config("neighbors architecture needs at least one layer"));
                }
                layers.iter().try_for_each(NeighborConvConfig::validate)
            }
            Self::SeedDriven {
                depth,
                conv,
                distance_weights,
            } => {
                require_positive(*depth, "depth")?;
                if let Some(d) = distance_weights {
                    require_positive(*d, "distance_weights")?;
                }
                conv.validate()
            }
            Self::SeedDrivenNeighbors {
                neighbors,
                depth,
                conv,
            } => {
                require_positive(*depth, "depth")?;
                neighbors.validate()?;
                conv.validate()
            }
            Self::GlobalExchange {
                depth,
                exchange,
                keep_every,
                hidden,
            } => {
                require_positive(*depth, "depth")?;
                require_positive(*keep_every, "keep_every")?;
                require_positive(*hidden, "hidden")?;
                exchange.validate()
            }
        }
    }
}

/// Complete model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Feature columns per point; column 0 is the energy.
    pub n_other_features: usize,
    /// Local coordinate columns per point.
    pub n_local: usize,
    /// Supervision seeds per batch element (default: 2).
    pub n_seeds: usize,
    /// Output classes: foreground clusters plus background (default: 3).
    pub n_classes: usize,
    pub normalizer: NormalizerConfig,
    /// Append the nearest-seed label as an extra feature (default: true).
    pub seed_labels: bool,
    pub architecture: ArchitectureConfig,
    /// Seed for the fixed near-identity noise (default: 42).
    pub seed: u64,
}

impl ModelConfig {
    pub fn new(n_other_features: usize, n_local: usize) -> Self {
        Self {
            n_other_features,
            n_local,
            n_seeds: 2,
            n_classes: 3,
            normalizer: NormalizerConfig::default(),
            seed_labels: true,
            architecture: ArchitectureConfig::default(),
            seed: 42,
        }
    }

    pub fn with_architecture(mut self, architecture: ArchitectureConfig) -> Self {
        self.architecture = architecture;
        self
    }

    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_seed_labels(mut self, seed_labels: bool) -> Self {
        self.seed_labels = seed_labels;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Width of the collapsed `[global, features, (label), local]` input.
    pub fn input_dim(&self) -> usize {
        3 + self.n_other_features + usize::from(self.seed_labels) + self.n_local
    }

    pub fn validate(&self) -> Result<()> {
        require_positive(self.n_other_features, "n_other_features")?;
        require_positive(self.n_seeds, "n_seeds")?;
        if self.n_classes < 2 {
            return Err(Error::config("n_classes must be at least 2"));
        }
        self.normalizer.validate()?;
        self.architecture.validate()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::new(1, 0)
    }
}

/// Clipping and scaling of the clustering loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Clip range of the reported mean response (default: `(0.01, 5)`).
    pub mean_clip: (f32, f32),
    /// Clip range of the reported response variance (default: `(0, 5)`).
    pub variance_clip: (f32, f32),
    /// Multiplier on the final scalar loss (default: 1).
    pub scale: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            mean_clip: (0.01, 5.0),
            variance_clip: (0.0, 5.0),
            scale: 1.0,
        }
    }
}

impl LossConfig {
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_mean_clip(mut self, lo: f32, hi: f32) -> Self {
        self.mean_clip = (lo, hi);
        self
    }

    pub fn with_variance_clip(mut self, lo: f32, hi: f32) -> Self {
        self.variance_clip = (lo, hi);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let (mlo, mhi) = self.mean_clip;
        if !(mlo > 0.0 && mlo <= mhi) {
            return Err(Error::config("mean_clip must satisfy 0 < lo <= hi"));
        }
        let (vlo, vhi) = self.variance_clip;
        if !(vlo >= 0.0 && vlo <= vhi) {
            return Err(Error::config("variance_clip must satisfy 0 <= lo <= hi"));
        }
        if !self.scale.is_finite() {
            return Err(Error::config("loss scale must be finite"));
        }
        Ok(())
    }
}
