//! End-to-end clustering model.
//!
//! ```text
//! PointBatch ─ normalize ─ (+ nearest-seed label) ─ [global ‖ features ‖ local]
//!            ─ zero padding ─ FeatureStack ─ OutputHead ─ (B, N, 3)
//! ```
//!
//! The architecture is an [`ArchitectureConfig`] variant resolved once in
//! [`ClusterModel::new`] into a boxed [`FeatureStack`]. Layers receive
//! explicit ids in construction order; parameters live under `layer_{id}` in
//! the caller's `VarMap`, and the output head under `head`.

use candle_core::{Tensor, D};
use candle_nn::{Module, VarBuilder};
use tracing::{debug, trace};

use crate::activation::Activation;
use crate::batch::{collapse, zero_padding, PointBatch};
use crate::config::{
    ArchitectureConfig, GlobalExchangeConfig, LossConfig, ModelConfig, NeighborConvConfig,
    SeededConvConfig,
};
use crate::conv::{GlobalExchange, NeighborConv, SeededConv};
use crate::dense::{derive_seed, Dense};
use crate::error::{Error, Result};
use crate::head::OutputHead;
use crate::loss::{LossOutput, PermutationInvariantLoss};
use crate::normalize::Normalizer;
use crate::seeds::{append_seed_labels, distance_weights_to_seeds, nearest_seed_labels, SeedSet};

/// Per-forward-pass information shared by all layers.
#[derive(Debug, Clone)]
pub struct BatchContext<'a> {
    pub valid_counts: &'a [usize],
    /// `(B, N)` 0/1 mask of valid entries.
    pub valid_mask: Tensor,
    pub seeds: &'a SeedSet,
}

/// A stack of aggregation layers between the collapsed input and the head.
pub trait FeatureStack: Send + Sync + std::fmt::Debug {
    /// `(B, N, input)` → `(B, N, output_dim)`.
    fn forward(&self, x: &Tensor, ctx: &BatchContext<'_>) -> Result<Tensor>;

    fn output_dim(&self) -> usize;

    /// Ids of the layers in construction order.
    fn layer_ids(&self) -> Vec<usize>;
}

/// Hands out layer ids and the matching parameter prefixes.
struct LayerBuilder<'a> {
    vb: VarBuilder<'a>,
    seed: u64,
    next_id: usize,
}

impl<'a> LayerBuilder<'a> {
    fn new(vb: VarBuilder<'a>, seed: u64) -> Self {
        Self { vb, seed, next_id: 0 }
    }

    fn next(&mut self) -> (usize, u64, VarBuilder<'a>) {
        let id = self.next_id;
        self.next_id += 1;
        (id, derive_seed(self.seed, id as u64), self.vb.pp(format!("layer_{id}")))
    }

    fn neighbor(&mut self, in_dim: usize, cfg: &NeighborConvConfig) -> Result<NeighborConv> {
        let (id, seed, vb) = self.next();
        NeighborConv::new(in_dim, cfg, id, seed, vb)
    }

    fn seeded(&mut self, in_dim: usize, cfg: &SeededConvConfig, n_seeds: usize) -> Result<SeededConv> {
        let (id, seed, vb) = self.next();
        SeededConv::new(in_dim, cfg, n_seeds, id, seed, vb)
    }

    fn exchange(&mut self, in_dim: usize, cfg: &GlobalExchangeConfig) -> Result<GlobalExchange> {
        let (id, seed, vb) = self.next();
        GlobalExchange::new(in_dim, cfg, id, seed, vb)
    }

    fn dense(&mut self, in_dim: usize, out_dim: usize, activation: Activation) -> Result<(usize, Dense)> {
        let (id, _, vb) = self.next();
        Ok((id, Dense::new(in_dim, out_dim, activation, vb)?))
    }

    fn noisy_dense(&mut self, in_dim: usize, out_dim: usize) -> Result<(usize, Dense)> {
        let (id, seed, vb) = self.next();
        Ok((id, Dense::noisy_eye(in_dim, out_dim, Activation::Identity, true, seed, vb)?))
    }
}

#[derive(Debug)]
struct NeighborStack {
    layers: Vec<NeighborConv>,
    concat_layers: bool,
    output_dim: usize,
}

impl FeatureStack for NeighborStack {
    fn forward(&self, x: &Tensor, ctx: &BatchContext<'_>) -> Result<Tensor> {
        let mut h = x.clone();
        let mut outputs = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            h = layer.forward(&h, ctx.valid_counts)?;
            if self.concat_layers {
                outputs.push(h.clone());
            }
        }
        if self.concat_layers {
            Ok(Tensor::cat(&outputs, D::Minus1)?)
        } else {
            Ok(h)
        }
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn layer_ids(&self) -> Vec<usize> {
        self.layers.iter().map(NeighborConv::layer_id).collect()
    }
}

#[derive(Debug)]
struct SeedStack {
    neighbors: Option<NeighborConv>,
    layers: Vec<SeededConv>,
    /// Projection for appended seed distances.
    distance_weights: Option<Dense>,
    ids: Vec<usize>,
    output_dim: usize,
}

impl FeatureStack for SeedStack {
    fn forward(&self, x: &Tensor, ctx: &BatchContext<'_>) -> Result<Tensor> {
        let mut h = match &self.neighbors {
            Some(conv) => conv.forward(x, ctx.valid_counts)?,
            None => x.clone(),
        };
        for layer in &self.layers {
            h = layer.forward(&h, &ctx.valid_mask, ctx.seeds)?;
        }
        if let Some(projection) = &self.distance_weights {
            let weights = distance_weights_to_seeds(&h, ctx.seeds, projection, 0)?;
            h = Tensor::cat(&[&h, &weights], D::Minus1)?;
        }
        Ok(h)
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn layer_ids(&self) -> Vec<usize> {
        self.ids.clone()
    }
}

#[derive(Debug)]
struct ExchangeStack {
    layers: Vec<GlobalExchange>,
    keep: Vec<bool>,
    hidden: Dense,
    ids: Vec<usize>,
}

impl FeatureStack for ExchangeStack {
    fn forward(&self, x: &Tensor, ctx: &BatchContext<'_>) -> Result<Tensor> {
        let mut h = x.clone();
        let mut kept = Vec::new();
        for (layer, &keep) in self.layers.iter().zip(&self.keep) {
            h = layer.forward(&h, &ctx.valid_mask)?;
            if keep {
                kept.push(h.clone());
            }
        }
        let joined = Tensor::cat(&kept, D::Minus1)?;
        Ok(self.hidden.forward(&joined)?)
    }

    fn output_dim(&self) -> usize {
        self.hidden.out_dim()
    }

    fn layer_ids(&self) -> Vec<usize> {
        self.ids.clone()
    }
}

fn build_stack(
    config: &ModelConfig,
    builder: &mut LayerBuilder<'_>,
) -> Result<Box<dyn FeatureStack>> {
    let in_dim = config.input_dim();
    match &config.architecture {
        ArchitectureConfig::Neighbors {
            layers,
            concat_layers,
        } => {
            let mut built = Vec::with_capacity(layers.len());
            let mut width = in_dim;
            for cfg in layers {
                let conv = builder.neighbor(width, cfg)?;
                width = conv.output_dim();
                built.push(conv);
            }
            let output_dim = if *concat_layers {
                built.iter().map(NeighborConv::output_dim).sum()
            } else {
                width
            };
            Ok(Box::new(NeighborStack {
                layers: built,
                concat_layers: *concat_layers,
                output_dim,
            }))
        }
        ArchitectureConfig::SeedDriven {
            depth,
            conv,
            distance_weights,
        } => seed_stack(config, builder, None, *depth, conv, *distance_weights),
        ArchitectureConfig::SeedDrivenNeighbors {
            neighbors,
            depth,
            conv,
        } => {
            let first = builder.neighbor(in_dim, neighbors)?;
            seed_stack(config, builder, Some(first), *depth, conv, None)
        }
        ArchitectureConfig::GlobalExchange {
            depth,
            exchange,
            keep_every,
            hidden,
        } => {
            let mut layers = Vec::with_capacity(*depth);
            let mut keep = Vec::with_capacity(*depth);
            let mut ids = Vec::with_capacity(*depth + 1);
            let mut width = in_dim;
            let mut kept_width = 0;
            for i in 0..*depth {
                let layer = builder.exchange(width, exchange)?;
                width = layer.output_dim();
                let is_kept = (i + 1) % keep_every == 0 || i + 1 == *depth;
                if is_kept {
                    kept_width += width;
                }
                ids.push(layer.layer_id());
                keep.push(is_kept);
                layers.push(layer);
            }
            let (hidden_id, hidden) = builder.dense(kept_width, *hidden, Activation::Relu)?;
            ids.push(hidden_id);
            Ok(Box::new(ExchangeStack {
                layers,
                keep,
                hidden,
                ids,
            }))
        }
    }
}

fn seed_stack(
    config: &ModelConfig,
    builder: &mut LayerBuilder<'_>,
    neighbors: Option<NeighborConv>,
    depth: usize,
    conv: &SeededConvConfig,
    distance_weights: Option<usize>,
) -> Result<Box<dyn FeatureStack>> {
    let mut ids: Vec<usize> = neighbors.iter().map(NeighborConv::layer_id).collect();
    let mut width = neighbors
        .as_ref()
        .map_or(config.input_dim(), NeighborConv::output_dim);
    let mut layers = Vec::with_capacity(depth);
    for _ in 0..depth {
        let layer = builder.seeded(width, conv, config.n_seeds)?;
        width = layer.output_dim();
        ids.push(layer.layer_id());
        layers.push(layer);
    }
    let distance_weights = match distance_weights {
        Some(dims) => {
            let (id, projection) = builder.noisy_dense(width, dims)?;
            ids.push(id);
            width += config.n_seeds;
            Some(projection)
        }
        None => None,
    };
    Ok(Box::new(SeedStack {
        neighbors,
        layers,
        distance_weights,
        ids,
        output_dim: width,
    }))
}

/// Probabilities plus the loss of one evaluated batch.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `(B, N, n_classes)`.
    pub probabilities: Tensor,
    pub loss: LossOutput,
}

/// Normalizer, feature stack and output head.
#[derive(Debug)]
pub struct ClusterModel {
    config: ModelConfig,
    normalizer: Normalizer,
    stack: Box<dyn FeatureStack>,
    head: OutputHead,
    loss: PermutationInvariantLoss,
}

impl ClusterModel {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Self::with_loss(config, LossConfig::default(), vb)
    }

    pub fn with_loss(config: &ModelConfig, loss: LossConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let normalizer = Normalizer::new(config.normalizer.clone())?;
        let mut builder = LayerBuilder::new(vb.clone(), config.seed);
        let stack = build_stack(config, &mut builder)?;
        let head = OutputHead::new(stack.output_dim(), config.n_classes, vb.pp("head"))?;

        debug!(
            architecture = config.architecture.name(),
            input_dim = config.input_dim(),
            stack_dim = stack.output_dim(),
            layers = ?stack.layer_ids(),
            n_classes = config.n_classes,
            "built cluster model"
        );

        Ok(Self {
            config: config.clone(),
            normalizer,
            stack,
            head,
            loss: PermutationInvariantLoss::new(loss)?,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Layer ids in construction order.
    pub fn layer_ids(&self) -> Vec<usize> {
        self.stack.layer_ids()
    }

    /// Collapsed, padding-zeroed layer input `(B, N, input_dim)`.
    pub fn prepare(&self, batch: &PointBatch) -> Result<Tensor> {
        if batch.n_other_features() != self.config.n_other_features
            || batch.n_local() != self.config.n_local
        {
            return Err(Error::ShapeMismatch {
                what: "feature/local widths",
                expected: vec![self.config.n_other_features, self.config.n_local],
                got: vec![batch.n_other_features(), batch.n_local()],
            });
        }
        let normalized = self.normalizer.normalize(batch)?;
        let features = if self.config.seed_labels {
            let labels = nearest_seed_labels(&normalized.global, batch.seeds())?;
            append_seed_labels(&normalized.features, &labels)?
        } else {
            normalized.features
        };
        let x = collapse(&normalized.global, &features, &normalized.local)?;
        zero_padding(&x, &batch.valid_mask()?)
    }

    /// Per-point class probabilities `(B, N, n_classes)`.
    pub fn forward(&self, batch: &PointBatch) -> Result<Tensor> {
        if batch.seeds().n_seeds() != self.config.n_seeds {
            return Err(Error::ShapeMismatch {
                what: "seed count",
                expected: vec![self.config.n_seeds],
                got: vec![batch.seeds().n_seeds()],
            });
        }
        debug!(
            batch = batch.batch_size(),
            max_entries = batch.max_entries(),
            architecture = self.config.architecture.name(),
            "forward pass"
        );

        let x = self.prepare(batch)?;
        let ctx = BatchContext {
            valid_counts: batch.valid_counts(),
            valid_mask: batch.valid_mask()?,
            seeds: batch.seeds(),
        };
        let h = self.stack.forward(&x, &ctx)?;
        trace!(shape = ?h.dims(), "feature stack output");
        Ok(self.head.forward(&h)?)
    }

    /// Forward pass plus the clustering loss; the batch must carry targets.
    pub fn evaluate(&self, batch: &PointBatch) -> Result<ForwardOutput> {
        let targets = batch
            .targets()
            .ok_or_else(|| Error::config("evaluate needs a batch with targets"))?;
        let probabilities = self.forward(batch)?;
        let loss = self
            .loss
            .compute(&probabilities, targets, &batch.energy()?, batch.valid_counts())?;
        Ok(ForwardOutput {
            probabilities,
            loss,
        })
    }
}
