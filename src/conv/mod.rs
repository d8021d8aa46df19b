//! Message aggregation layers.
//!
//! All three layers follow the same pattern: build edges in a freshly
//! learned latent space, weight neighbor features by the edges, reduce over
//! the neighbor axis and fuse the result with the layer input through a dense
//! transform.
//!
//! - [`NeighborConv`]: kNN graph, iterated aggregation with re-embedded edges
//! - [`SeededConv`]: bipartite point↔seed graph with seed talk and
//!   back-propagation to every point
//! - [`GlobalExchange`]: one pooled summary per batch element
//!
//! ```text
//! h_i' = UPDATE(x_i, REDUCE_j( h_j ⊗ w(e_ij) ))
//! ```
//!
//! Layers never assume padding is zero: neighbor search skips padding and
//! every mean over points divides by the valid count.

mod global;
mod neighbor;
mod seeded;

pub use global::{masked_mean, GlobalExchange};
pub use neighbor::NeighborConv;
pub use seeded::SeededConv;
